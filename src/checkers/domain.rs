use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind, Status};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::tls::DEFAULT_WARN_DAYS;

const WHOIS_PORT: u16 = 43;
const RESPONSE_CAP: usize = 8192;

static WHOIS_SERVERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (".com", "whois.verisign-grs.com"),
        (".net", "whois.verisign-grs.com"),
        (".org", "whois.pir.org"),
        (".info", "whois.nic.info"),
        (".io", "whois.nic.io"),
        (".dev", "whois.nic.google"),
        (".app", "whois.nic.google"),
        (".page", "whois.nic.google"),
        (".me", "whois.nic.me"),
        (".co", "whois.nic.co"),
        (".us", "whois.nic.us"),
        (".uk", "whois.nic.uk"),
        (".de", "whois.denic.de"),
        (".fr", "whois.nic.fr"),
        (".nl", "whois.domain-registry.nl"),
        (".eu", "whois.eu"),
        (".ru", "whois.tcinet.ru"),
        (".au", "whois.auda.org.au"),
        (".ca", "whois.cira.ca"),
        (".in", "whois.registry.in"),
        (".br", "whois.registro.br"),
        (".xyz", "whois.nic.xyz"),
        (".biz", "whois.nic.biz"),
        (".tech", "whois.nic.tech"),
        (".cloud", "whois.nic.cloud"),
        (".site", "whois.nic.site"),
        (".top", "whois.nic.top"),
        (".name", "whois.nic.name"),
        (".cc", "ccwhois.verisign-grs.com"),
        (".tv", "tvwhois.verisign-grs.com"),
    ])
});

// Registrars disagree on the expiry label; patterns are tried in order.
static EXPIRY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)Registry Expiry Date:\s*(\S.*)",
        r"(?i)Registrar Registration Expiration Date:\s*(\S.*)",
        r"(?i)Expir(?:y|ation) Date:\s*(\S.*)",
        r"(?i)paid-till:\s*(\S.*)",
        r"(?i)expires:\s*(\S.*)",
        r"(?i)Expiration Time:\s*(\S.*)",
        r"(?i)expire:\s*(\S.*)",
        r"(?i)Valid Until:\s*(\S.*)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%d %H:%M:%S",
    "%Y.%m.%d %H:%M:%S",
    "%d-%b-%Y %H:%M:%S",
];

const DATE_ONLY_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%d.%m.%Y", "%d-%b-%Y"];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DomainSettings {
    /// Degrade when the registration expires within this many days.
    pub warn_days_before: Option<i64>,
}

pub struct DomainChecker {
    allow_private: bool,
}

impl DomainChecker {
    pub fn new(allow_private: bool) -> Self {
        DomainChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: DomainSettings = decode_settings(&monitor.settings)?;
        let warn_days = settings.warn_days_before.unwrap_or(DEFAULT_WARN_DAYS);
        let domain = monitor.target.trim().trim_end_matches('.').to_lowercase();

        let tld = domain
            .rfind('.')
            .map(|pos| &domain[pos..])
            .ok_or_else(|| format!("'{domain}' has no TLD"))?;
        let server = WHOIS_SERVERS
            .get(tld)
            .ok_or_else(|| format!("no whois server known for '{tld}'"))?;

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        let mut stream = match safedial::connect(server, WHOIS_PORT, timeout, self.allow_private).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };

        if let Err(e) = stream.write_all(format!("{domain}\r\n").as_bytes()).await {
            return Ok(CheckOutcome::down(elapsed_ms(start), format!("whois write failed: {e}")));
        }

        let mut raw = Vec::new();
        let mut chunk = [0u8; 2048];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let remaining = RESPONSE_CAP - raw.len();
                    raw.extend_from_slice(&chunk[..n.min(remaining)]);
                    if raw.len() >= RESPONSE_CAP {
                        break;
                    }
                }
                Err(e) => {
                    return Ok(CheckOutcome::down(elapsed_ms(start), format!("whois read failed: {e}")));
                }
            }
        }
        let response_time_ms = elapsed_ms(start);
        let response = String::from_utf8_lossy(&raw);

        let Some(expiry) = parse_expiry(&response) else {
            return Ok(CheckOutcome::down(
                response_time_ms,
                format!("could not parse expiration date for '{domain}'"),
            ));
        };

        let days = (expiry - Utc::now().timestamp()) / 86400;
        let (status, message) = if days <= 0 {
            (Status::Down, Some(format!("domain expired {} days ago", -days)))
        } else if days <= warn_days {
            (Status::Degraded, Some(format!("domain expires in {days} days")))
        } else {
            (Status::Up, None)
        };

        Ok(CheckOutcome {
            status,
            response_time_ms,
            status_code: Some(days as i32),
            message,
            cert_expiry: Some(expiry),
            ..CheckOutcome::up(response_time_ms)
        })
    }
}

/// Scan whois output lines for an expiry field and parse it with the
/// known date formats.
fn parse_expiry(response: &str) -> Option<i64> {
    for line in response.lines() {
        for pattern in EXPIRY_PATTERNS.iter() {
            let Some(caps) = pattern.captures(line) else { continue };
            let value = caps.get(1)?.as_str().trim();
            if let Some(ts) = parse_date(value) {
                return Some(ts);
            }
        }
    }
    None
}

fn parse_date(value: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    for fmt in DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    for fmt in DATE_ONLY_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
        }
    }
    None
}

#[async_trait]
impl Checker for DomainChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Domain
    }

    async fn check(&self, monitor: &Monitor) -> CheckOutcome {
        let start = Instant::now();
        match self.run(monitor).await {
            Ok(outcome) => outcome,
            Err(msg) => CheckOutcome::down(elapsed_ms(start), msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tld_table_covers_common_suffixes() {
        for tld in [".com", ".net", ".org", ".io", ".dev", ".uk", ".de", ".ru", ".tv", ".cc"] {
            assert!(WHOIS_SERVERS.contains_key(tld), "missing {tld}");
        }
    }

    #[test]
    fn parses_registry_expiry_line() {
        let response = "Domain Name: EXAMPLE.COM\r\nRegistry Expiry Date: 2030-08-13T04:00:00Z\r\n";
        let ts = parse_expiry(response).unwrap();
        assert_eq!(ts, DateTime::parse_from_rfc3339("2030-08-13T04:00:00Z").unwrap().timestamp());
    }

    #[test]
    fn parses_paid_till_line() {
        let response = "domain: EXAMPLE.RU\npaid-till: 2031-02-01T21:00:00Z\nstate: REGISTERED\n";
        assert!(parse_expiry(response).is_some());
    }

    #[test]
    fn parses_date_only_formats() {
        assert!(parse_date("2030-06-01").is_some());
        assert!(parse_date("01.06.2030").is_some());
        assert!(parse_date("14-May-2030").is_some());
    }

    #[test]
    fn earlier_pattern_wins() {
        let response = "Registrar Registration Expiration Date: 2031-01-01T00:00:00Z\nexpires: 2029-01-01\n";
        let ts = parse_expiry(response).unwrap();
        // Line scan order: the registrar expiration line comes first.
        assert_eq!(ts, DateTime::parse_from_rfc3339("2031-01-01T00:00:00Z").unwrap().timestamp());
    }

    #[test]
    fn unparseable_response_yields_none() {
        assert!(parse_expiry("No match for domain").is_none());
    }
}
