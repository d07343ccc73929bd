use serde::{Deserialize, Serialize};

// ─── Monitor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Http,
    Tcp,
    Dns,
    Icmp,
    Tls,
    Websocket,
    Grpc,
    Mqtt,
    Docker,
    Domain,
    Command,
    Heartbeat,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Http => "http",
            MonitorKind::Tcp => "tcp",
            MonitorKind::Dns => "dns",
            MonitorKind::Icmp => "icmp",
            MonitorKind::Tls => "tls",
            MonitorKind::Websocket => "websocket",
            MonitorKind::Grpc => "grpc",
            MonitorKind::Mqtt => "mqtt",
            MonitorKind::Docker => "docker",
            MonitorKind::Domain => "domain",
            MonitorKind::Command => "command",
            MonitorKind::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(s: &str) -> Option<MonitorKind> {
        match s {
            "http" => Some(MonitorKind::Http),
            "tcp" => Some(MonitorKind::Tcp),
            "dns" => Some(MonitorKind::Dns),
            "icmp" => Some(MonitorKind::Icmp),
            "tls" => Some(MonitorKind::Tls),
            "websocket" => Some(MonitorKind::Websocket),
            "grpc" => Some(MonitorKind::Grpc),
            "mqtt" => Some(MonitorKind::Mqtt),
            "docker" => Some(MonitorKind::Docker),
            "domain" => Some(MonitorKind::Domain),
            "command" => Some(MonitorKind::Command),
            "heartbeat" => Some(MonitorKind::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: MonitorKind,
    /// Probe target; meaning is kind-specific (URL, host:port, domain,
    /// container name, executable path). Empty only for heartbeat monitors.
    pub target: String,
    /// Kind-specific settings blob, decoded by the checker at use site.
    #[serde(default)]
    pub settings: serde_json::Value,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// 0 disables reminder notifications for open incidents.
    pub resend_interval_seconds: u32,
    pub track_changes: bool,
    pub upside_down: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
    /// Structured assertion set (see assertions module). Raw JSON here;
    /// malformed content evaluates as a no-op pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertions: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Resolved proxy URL, attached at dispatch time. Never persisted.
    #[serde(skip)]
    pub proxy_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Monitor {
    /// Validate numeric bounds and target presence before persistence.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".into());
        }
        if self.target.trim().is_empty() && self.kind != MonitorKind::Heartbeat {
            return Err("target is required".into());
        }
        if !(5..=86400).contains(&self.interval_seconds) {
            return Err("interval_seconds must be between 5 and 86400".into());
        }
        if !(1..=300).contains(&self.timeout_seconds) {
            return Err("timeout_seconds must be between 1 and 300".into());
        }
        if self.failure_threshold < 1 {
            return Err("failure_threshold must be at least 1".into());
        }
        if self.success_threshold < 1 {
            return Err("success_threshold must be at least 1".into());
        }
        Ok(())
    }
}

// ─── Check status and outcome ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
    Degraded,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
            Status::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "up" => Some(Status::Up),
            "down" => Some(Status::Down),
            "degraded" => Some(Status::Degraded),
            _ => None,
        }
    }
}

/// What a single probe run produced. Checkers encode every failure as a
/// down outcome with a descriptive message; they do not return errors.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub status: Status,
    pub response_time_ms: u32,
    /// Kind-specific protocol code: HTTP status, process exit code,
    /// gRPC serving status, days-until-expiry for certificate checks.
    pub status_code: Option<i32>,
    pub message: Option<String>,
    pub headers: Option<serde_json::Value>,
    pub body: Option<String>,
    pub body_hash: Option<String>,
    /// Leaf certificate NotAfter, unix seconds.
    pub cert_expiry: Option<i64>,
    pub cert_fingerprint: Option<String>,
    pub dns_records: Option<Vec<String>>,
}

impl CheckOutcome {
    pub fn up(response_time_ms: u32) -> Self {
        CheckOutcome {
            status: Status::Up,
            response_time_ms,
            status_code: None,
            message: None,
            headers: None,
            body: None,
            body_hash: None,
            cert_expiry: None,
            cert_fingerprint: None,
            dns_records: None,
        }
    }

    pub fn down(response_time_ms: u32, message: impl Into<String>) -> Self {
        CheckOutcome {
            status: Status::Down,
            message: Some(message.into()),
            ..CheckOutcome::up(response_time_ms)
        }
    }

    pub fn degraded(response_time_ms: u32, message: impl Into<String>) -> Self {
        CheckOutcome {
            status: Status::Degraded,
            message: Some(message.into()),
            ..CheckOutcome::up(response_time_ms)
        }
    }
}

/// Per-monitor health counters, created lazily on first check.
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub monitor_id: String,
    pub status: Status,
    pub last_check_at: Option<String>,
    pub consec_successes: u32,
    pub consec_fails: u32,
    pub last_body_hash: Option<String>,
}

impl MonitorStatus {
    pub fn new(monitor_id: &str) -> Self {
        MonitorStatus {
            monitor_id: monitor_id.to_string(),
            status: Status::Up,
            last_check_at: None,
            consec_successes: 0,
            consec_fails: 0,
            last_body_hash: None,
        }
    }
}

/// Append-only record of a single check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub id: String,
    pub monitor_id: String,
    pub status: Status,
    pub response_time_ms: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_expiry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_records: Option<Vec<String>>,
    pub checked_at: String,
    pub seq: i64,
}

// ─── Incidents ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<IncidentStatus> {
        match s {
            "open" => Some(IncidentStatus::Open),
            "acknowledged" => Some(IncidentStatus::Acknowledged),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    pub monitor_id: String,
    /// Monitor name at the time the incident opened.
    pub monitor_name: String,
    pub cause: String,
    pub status: IncidentStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentEventType {
    Created,
    Acknowledged,
    Resolved,
    CheckFailed,
    CheckRecovered,
}

impl IncidentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentEventType::Created => "created",
            IncidentEventType::Acknowledged => "acknowledged",
            IncidentEventType::Resolved => "resolved",
            IncidentEventType::CheckFailed => "check_failed",
            IncidentEventType::CheckRecovered => "check_recovered",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentEvent {
    pub id: String,
    pub incident_id: String,
    pub event_type: String,
    pub message: String,
    pub created_at: String,
}

// ─── Content changes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ContentChange {
    pub id: String,
    pub monitor_id: String,
    pub old_hash: String,
    pub new_hash: String,
    /// Unified diff between the previous stored body and the current one.
    pub diff: String,
    pub created_at: String,
}

// ─── Maintenance windows ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Recurrence> {
        match s {
            "daily" => Some(Recurrence::Daily),
            "weekly" => Some(Recurrence::Weekly),
            "monthly" => Some(Recurrence::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceWindow {
    pub id: String,
    pub starts_at: String,
    pub ends_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    /// Empty set applies the window to every monitor.
    pub monitor_ids: Vec<String>,
    pub created_at: String,
}

// ─── Heartbeats ─────────────────────────────────────────────────────────────

/// Push-style monitor state: health is derived from incoming pings.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub monitor_id: String,
    pub expected_interval_seconds: u32,
    /// Unix seconds of the last received ping.
    pub last_ping_at: i64,
    pub status: Status,
}

impl Heartbeat {
    pub fn expired(&self, now_unix: i64) -> bool {
        now_unix - self.last_ping_at > self.expected_interval_seconds as i64
    }
}

// ─── Proxies ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    /// "http" or "socks5".
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Proxy {
    /// Render as a URL usable by the HTTP client layer.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("{}://{}:{}@{}:{}", self.protocol, u, p, self.host, self.port),
            (Some(u), None) => format!("{}://{}@{}:{}", self.protocol, u, self.host, self.port),
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }
}

// ─── Notification events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "incident.created")]
    IncidentCreated,
    #[serde(rename = "incident.resolved")]
    IncidentResolved,
    #[serde(rename = "incident.acknowledged")]
    IncidentAcknowledged,
    #[serde(rename = "incident.reminder")]
    IncidentReminder,
    #[serde(rename = "content.changed")]
    ContentChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::IncidentCreated => "incident.created",
            EventType::IncidentResolved => "incident.resolved",
            EventType::IncidentAcknowledged => "incident.acknowledged",
            EventType::IncidentReminder => "incident.reminder",
            EventType::ContentChanged => "content.changed",
        }
    }
}

/// Record handed to the external notifier for fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub event_type: EventType,
    pub monitor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Monitor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<Incident>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<ContentChange>,
    pub timestamp: String,
}

// ─── Pipeline messages ──────────────────────────────────────────────────────

/// One scheduled probe, dispatched to the worker pool.
#[derive(Debug, Clone)]
pub struct Job {
    pub monitor: std::sync::Arc<Monitor>,
}

/// Worker output consumed by the result processor. Registry misses,
/// per-check timeouts, and worker panics are already folded into a
/// down outcome by the pool.
#[derive(Debug)]
pub struct WorkerResult {
    pub monitor: std::sync::Arc<Monitor>,
    pub outcome: CheckOutcome,
}

/// Timestamp format used for every TEXT datetime column.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
