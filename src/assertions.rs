use serde::{Deserialize, Serialize};

// Structured assertion sets evaluated against a check's output. The set
// is stored as JSON on the monitor; malformed content is a no-op pass so
// a bad assertion can never wedge the pipeline.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolOp {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    StatusCode,
    BodyContains,
    BodyRegex,
    JsonPath,
    Header,
    ResponseTime,
    CertExpiry,
    DnsRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    NotContains,
    Matches,
    NotMatches,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionType,
    pub operator: AssertionOp,
    /// Header name or JSON path, where the type needs one.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub value: String,
    /// A failing condition with this flag demotes the result to degraded
    /// instead of down (if every failing condition agrees).
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub operator: BoolOp,
    #[serde(default)]
    pub conditions: Vec<Assertion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSet {
    #[serde(default)]
    pub operator: BoolOp,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

/// Check output fields the evaluator can see.
#[derive(Debug, Default)]
pub struct AssertionInput<'a> {
    pub status_code: Option<i32>,
    pub body: &'a str,
    pub headers: Option<&'a serde_json::Value>,
    pub response_time_ms: u32,
    pub cert_expiry: Option<i64>,
    pub dns_records: Option<&'a [String]>,
    /// Unix seconds used for cert_expiry day math.
    pub now_unix: i64,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub pass: bool,
    /// True when the set failed and every failing condition carried the
    /// degraded flag.
    pub degraded: bool,
    pub message: Option<String>,
}

impl Evaluation {
    fn pass() -> Self {
        Evaluation { pass: true, degraded: false, message: None }
    }
}

/// Evaluate a raw assertion blob against a check's output.
pub fn evaluate(raw: &serde_json::Value, input: &AssertionInput) -> Evaluation {
    let set: ConditionSet = match serde_json::from_value(raw.clone()) {
        Ok(s) => s,
        Err(_) => return Evaluation::pass(),
    };
    evaluate_set(&set, input)
}

pub fn evaluate_set(set: &ConditionSet, input: &AssertionInput) -> Evaluation {
    let mut failing: Vec<&Assertion> = Vec::new();
    let mut group_results = Vec::with_capacity(set.groups.len());
    for group in &set.groups {
        let results: Vec<bool> = group.conditions.iter().map(|c| condition_holds(c, input)).collect();
        for (condition, ok) in group.conditions.iter().zip(&results) {
            if !ok {
                failing.push(condition);
            }
        }
        group_results.push(combine(group.operator, &results));
    }
    let pass = combine(set.operator, &group_results);
    if pass {
        return Evaluation::pass();
    }
    let degraded = !failing.is_empty() && failing.iter().all(|c| c.degraded);
    let message = Some(format!(
        "assertion failed: {}",
        failing.iter().map(|c| describe(c)).collect::<Vec<_>>().join("; ")
    ));
    Evaluation { pass: false, degraded, message }
}

// Empty operand list is vacuously true for both operators.
fn combine(op: BoolOp, results: &[bool]) -> bool {
    match op {
        BoolOp::And => results.iter().all(|r| *r),
        BoolOp::Or => results.is_empty() || results.iter().any(|r| *r),
    }
}

fn describe(c: &Assertion) -> String {
    let kind = match c.kind {
        AssertionType::StatusCode => "status_code",
        AssertionType::BodyContains => "body_contains",
        AssertionType::BodyRegex => "body_regex",
        AssertionType::JsonPath => "json_path",
        AssertionType::Header => "header",
        AssertionType::ResponseTime => "response_time",
        AssertionType::CertExpiry => "cert_expiry",
        AssertionType::DnsRecord => "dns_record",
    };
    let op = match c.operator {
        AssertionOp::Eq => "eq",
        AssertionOp::Neq => "neq",
        AssertionOp::Gt => "gt",
        AssertionOp::Lt => "lt",
        AssertionOp::Gte => "gte",
        AssertionOp::Lte => "lte",
        AssertionOp::Contains => "contains",
        AssertionOp::NotContains => "not_contains",
        AssertionOp::Matches => "matches",
        AssertionOp::NotMatches => "not_matches",
        AssertionOp::Exists => "exists",
    };
    if c.target.is_empty() {
        format!("{kind} {op} {}", c.value)
    } else {
        format!("{kind} {} {op} {}", c.target, c.value)
    }
}

fn condition_holds(c: &Assertion, input: &AssertionInput) -> bool {
    match c.kind {
        AssertionType::StatusCode => match input.status_code {
            Some(code) => int_compare(c.operator, code as i64, &c.value),
            None => false,
        },
        AssertionType::ResponseTime => int_compare(c.operator, input.response_time_ms as i64, &c.value),
        AssertionType::CertExpiry => match input.cert_expiry {
            Some(expiry) => {
                let days = (expiry - input.now_unix) / 86400;
                int_compare(c.operator, days, &c.value)
            }
            None => false,
        },
        AssertionType::BodyContains => match c.operator {
            AssertionOp::Contains => input.body.contains(&c.value),
            AssertionOp::NotContains => !input.body.contains(&c.value),
            _ => false,
        },
        AssertionType::BodyRegex => match regex::Regex::new(&c.value) {
            Ok(re) => match c.operator {
                AssertionOp::Matches => re.is_match(input.body),
                AssertionOp::NotMatches => !re.is_match(input.body),
                _ => false,
            },
            Err(_) => false,
        },
        AssertionType::Header => {
            let found = input.headers.and_then(|h| header_lookup(h, &c.target));
            match c.operator {
                AssertionOp::Exists => found.is_some(),
                AssertionOp::Eq => found.as_deref() == Some(c.value.as_str()),
                AssertionOp::Neq => found.as_deref() != Some(c.value.as_str()),
                AssertionOp::Contains => found.map(|v| v.contains(&c.value)).unwrap_or(false),
                AssertionOp::NotContains => found.map(|v| !v.contains(&c.value)).unwrap_or(false),
                _ => false,
            }
        }
        AssertionType::JsonPath => {
            let parsed: Option<serde_json::Value> = serde_json::from_str(input.body).ok();
            let leaf = parsed.as_ref().and_then(|v| walk_path(v, &c.target));
            match c.operator {
                AssertionOp::Exists => leaf.is_some(),
                _ => match leaf {
                    Some(value) => {
                        let text = stringify_leaf(value);
                        match c.operator {
                            AssertionOp::Eq => text == c.value,
                            AssertionOp::Neq => text != c.value,
                            AssertionOp::Contains => text.contains(&c.value),
                            AssertionOp::NotContains => !text.contains(&c.value),
                            AssertionOp::Gt | AssertionOp::Lt | AssertionOp::Gte | AssertionOp::Lte => {
                                num_compare(c.operator, &text, &c.value)
                            }
                            _ => false,
                        }
                    }
                    None => false,
                },
            }
        }
        AssertionType::DnsRecord => {
            let records = input.dns_records.unwrap_or(&[]);
            match c.operator {
                AssertionOp::Contains => records.iter().any(|r| r.contains(&c.value)),
                AssertionOp::Eq => records.iter().any(|r| r == &c.value),
                _ => false,
            }
        }
    }
}

fn int_compare(op: AssertionOp, left: i64, value: &str) -> bool {
    let Ok(right) = value.trim().parse::<i64>() else {
        return false;
    };
    match op {
        AssertionOp::Eq => left == right,
        AssertionOp::Neq => left != right,
        AssertionOp::Gt => left > right,
        AssertionOp::Lt => left < right,
        AssertionOp::Gte => left >= right,
        AssertionOp::Lte => left <= right,
        _ => false,
    }
}

fn num_compare(op: AssertionOp, left: &str, right: &str) -> bool {
    let (Ok(l), Ok(r)) = (left.trim().parse::<f64>(), right.trim().parse::<f64>()) else {
        return false;
    };
    match op {
        AssertionOp::Gt => l > r,
        AssertionOp::Lt => l < r,
        AssertionOp::Gte => l >= r,
        AssertionOp::Lte => l <= r,
        _ => false,
    }
}

fn header_lookup(headers: &serde_json::Value, name: &str) -> Option<String> {
    let obj = headers.as_object()?;
    obj.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_str().map(|s| s.to_string()))
}

/// Walk a dot path with optional `[n]` array indexing, e.g.
/// `data.items[2].name`.
fn walk_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    if path.is_empty() {
        return Some(current);
    }
    for segment in path.split('.') {
        let (field, indexes) = parse_segment(segment)?;
        if !field.is_empty() {
            current = current.get(field)?;
        }
        for idx in indexes {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let bracket = segment.find('[');
    let (field, rest) = match bracket {
        Some(pos) => (&segment[..pos], &segment[pos..]),
        None => (segment, ""),
    };
    let mut indexes = Vec::new();
    let mut rest = rest;
    while let Some(inner) = rest.strip_prefix('[') {
        let end = inner.find(']')?;
        indexes.push(inner[..end].parse().ok()?);
        rest = &inner[end + 1..];
    }
    if rest.is_empty() {
        Some((field, indexes))
    } else {
        None
    }
}

fn stringify_leaf(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_with_body(body: &str) -> AssertionInput<'_> {
        AssertionInput {
            status_code: Some(200),
            body,
            headers: None,
            response_time_ms: 50,
            cert_expiry: None,
            dns_records: None,
            now_unix: 1_700_000_000,
        }
    }

    fn single(kind: &str, op: &str, target: &str, value: &str, degraded: bool) -> serde_json::Value {
        json!({
            "operator": "and",
            "groups": [{
                "operator": "and",
                "conditions": [{
                    "type": kind, "operator": op, "target": target, "value": value, "degraded": degraded
                }]
            }]
        })
    }

    #[test]
    fn malformed_json_is_a_noop_pass() {
        let eval = evaluate(&json!({"operator": "nonsense"}), &input_with_body(""));
        assert!(eval.pass);
        let eval = evaluate(&json!([1, 2, 3]), &input_with_body(""));
        assert!(eval.pass);
    }

    #[test]
    fn empty_set_passes() {
        let eval = evaluate(&json!({}), &input_with_body(""));
        assert!(eval.pass);
    }

    #[test]
    fn status_code_comparisons() {
        let input = input_with_body("");
        assert!(evaluate(&single("status_code", "eq", "", "200", false), &input).pass);
        assert!(!evaluate(&single("status_code", "eq", "", "500", false), &input).pass);
        assert!(evaluate(&single("status_code", "lt", "", "300", false), &input).pass);
        assert!(evaluate(&single("status_code", "gte", "", "200", false), &input).pass);
        // Unparseable comparison value fails the condition.
        assert!(!evaluate(&single("status_code", "eq", "", "abc", false), &input).pass);
    }

    #[test]
    fn body_contains_and_regex() {
        let input = input_with_body("hello world");
        assert!(evaluate(&single("body_contains", "contains", "", "world", false), &input).pass);
        assert!(evaluate(&single("body_contains", "not_contains", "", "gone", false), &input).pass);
        assert!(evaluate(&single("body_regex", "matches", "", "^hello", false), &input).pass);
        assert!(evaluate(&single("body_regex", "not_matches", "", "^world", false), &input).pass);
        // Invalid regex fails rather than erroring.
        assert!(!evaluate(&single("body_regex", "matches", "", "(unclosed", false), &input).pass);
    }

    #[test]
    fn json_path_walking() {
        let body = r#"{"data":{"items":[{"name":"a"},{"name":"b"}],"count":2}}"#;
        let input = input_with_body(body);
        assert!(evaluate(&single("json_path", "exists", "data.items[1].name", "", false), &input).pass);
        assert!(evaluate(&single("json_path", "eq", "data.items[0].name", "a", false), &input).pass);
        assert!(evaluate(&single("json_path", "gte", "data.count", "2", false), &input).pass);
        assert!(!evaluate(&single("json_path", "exists", "data.missing", "", false), &input).pass);
        assert!(!evaluate(&single("json_path", "eq", "data.items[9].name", "a", false), &input).pass);
    }

    #[test]
    fn header_match_is_case_insensitive() {
        let headers = json!({"Content-Type": "application/json", "X-Req": "abc"});
        let input = AssertionInput { headers: Some(&headers), ..input_with_body("") };
        assert!(evaluate(&single("header", "exists", "content-type", "", false), &input).pass);
        assert!(evaluate(&single("header", "contains", "CONTENT-TYPE", "json", false), &input).pass);
        assert!(evaluate(&single("header", "eq", "x-req", "abc", false), &input).pass);
        assert!(!evaluate(&single("header", "exists", "x-missing", "", false), &input).pass);
    }

    #[test]
    fn cert_expiry_compares_days() {
        let input = AssertionInput {
            cert_expiry: Some(1_700_000_000 + 10 * 86400),
            ..input_with_body("")
        };
        assert!(evaluate(&single("cert_expiry", "gte", "", "10", false), &input).pass);
        assert!(!evaluate(&single("cert_expiry", "gt", "", "10", false), &input).pass);
        assert!(evaluate(&single("cert_expiry", "lt", "", "30", false), &input).pass);
    }

    #[test]
    fn dns_record_match() {
        let records = vec!["10 mail.example.com".to_string(), "1.2.3.4".to_string()];
        let input = AssertionInput { dns_records: Some(&records), ..input_with_body("") };
        assert!(evaluate(&single("dns_record", "contains", "", "mail.", false), &input).pass);
        assert!(evaluate(&single("dns_record", "eq", "", "1.2.3.4", false), &input).pass);
        assert!(!evaluate(&single("dns_record", "eq", "", "mail.", false), &input).pass);
    }

    #[test]
    fn degraded_only_when_all_failures_degraded() {
        let input = AssertionInput { response_time_ms: 500, ..input_with_body("") };
        // Only the degraded-flagged condition fails.
        let set = json!({
            "operator": "and",
            "groups": [{
                "operator": "and",
                "conditions": [
                    {"type": "status_code", "operator": "eq", "value": "200"},
                    {"type": "response_time", "operator": "lt", "value": "100", "degraded": true}
                ]
            }]
        });
        let eval = evaluate(&set, &input);
        assert!(!eval.pass);
        assert!(eval.degraded);
        assert!(eval.message.as_deref().unwrap().contains("response_time"));

        // A non-degraded failure alongside keeps the result hard-down.
        let set = json!({
            "operator": "and",
            "groups": [{
                "operator": "and",
                "conditions": [
                    {"type": "status_code", "operator": "eq", "value": "204"},
                    {"type": "response_time", "operator": "lt", "value": "100", "degraded": true}
                ]
            }]
        });
        let eval = evaluate(&set, &input);
        assert!(!eval.pass);
        assert!(!eval.degraded);
    }

    #[test]
    fn or_groups_combine() {
        let input = input_with_body("hello");
        let set = json!({
            "operator": "or",
            "groups": [
                {"operator": "and", "conditions": [
                    {"type": "body_contains", "operator": "contains", "value": "nope"}
                ]},
                {"operator": "and", "conditions": [
                    {"type": "body_contains", "operator": "contains", "value": "hello"}
                ]}
            ]
        });
        assert!(evaluate(&set, &input).pass);
    }

    #[test]
    fn serde_round_trip_preserves_outcomes() {
        let raw = json!({
            "operator": "or",
            "groups": [
                {"operator": "and", "conditions": [
                    {"type": "status_code", "operator": "eq", "value": "200"},
                    {"type": "body_contains", "operator": "contains", "value": "ok", "degraded": true}
                ]},
                {"operator": "or", "conditions": [
                    {"type": "response_time", "operator": "lt", "value": "10"}
                ]}
            ]
        });
        let set: ConditionSet = serde_json::from_value(raw.clone()).unwrap();
        let rejson = serde_json::to_value(&set).unwrap();
        for body in ["ok fine", "nope"] {
            for rt in [5u32, 5000] {
                let input = AssertionInput { response_time_ms: rt, ..input_with_body(body) };
                let a = evaluate(&raw, &input);
                let b = evaluate(&rejson, &input);
                assert_eq!(a.pass, b.pass);
                assert_eq!(a.degraded, b.degraded);
            }
        }
    }
}
