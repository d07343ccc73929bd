use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const RESPONSE_CAP: usize = 512 * 1024;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    pub socket_path: Option<String>,
    /// Consult the container's healthcheck state instead of just Running.
    pub check_health: bool,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "State")]
    state: Option<ContainerState>,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running")]
    running: Option<bool>,
    #[serde(rename = "Health")]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
struct ContainerHealth {
    #[serde(rename = "Status")]
    status: Option<String>,
}

pub struct DockerChecker;

impl DockerChecker {
    pub fn new() -> Self {
        DockerChecker
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: DockerSettings = decode_settings(&monitor.settings)?;
        let socket_path = settings.socket_path.as_deref().unwrap_or(DEFAULT_SOCKET);
        let container = monitor.target.trim();
        if container.is_empty() || container.contains('/') || container.contains(' ') {
            return Err(format!("invalid container name '{container}'"));
        }

        let start = Instant::now();
        let mut stream = match UnixStream::connect(socket_path).await {
            Ok(s) => s,
            Err(e) => {
                return Ok(CheckOutcome::down(
                    elapsed_ms(start),
                    format!("docker socket {socket_path}: {e}"),
                ));
            }
        };

        let request = format!(
            "GET /v1.24/containers/{container}/json HTTP/1.1\r\nHost: docker\r\nAccept: application/json\r\nConnection: close\r\n\r\n"
        );
        if let Err(e) = stream.write_all(request.as_bytes()).await {
            return Ok(CheckOutcome::down(elapsed_ms(start), format!("request write failed: {e}")));
        }

        let mut raw = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    if raw.len() > RESPONSE_CAP {
                        return Ok(CheckOutcome::down(elapsed_ms(start), "response too large"));
                    }
                }
                Err(e) => {
                    return Ok(CheckOutcome::down(elapsed_ms(start), format!("response read failed: {e}")));
                }
            }
        }
        let response_time_ms = elapsed_ms(start);

        let (code, body) = parse_http_response(&raw)?;
        if code == 404 {
            return Ok(CheckOutcome {
                status_code: Some(404),
                ..CheckOutcome::down(response_time_ms, format!("container '{container}' not found"))
            });
        }
        if code != 200 {
            return Ok(CheckOutcome {
                status_code: Some(code as i32),
                ..CheckOutcome::down(response_time_ms, format!("docker API returned {code}"))
            });
        }

        let inspect: InspectResponse =
            serde_json::from_slice(&body).map_err(|e| format!("inspect parse failed: {e}"))?;
        let state = inspect.state.ok_or("inspect response has no State")?;
        let running = state.running.unwrap_or(false);
        if !running {
            return Ok(CheckOutcome {
                status_code: Some(200),
                ..CheckOutcome::down(response_time_ms, format!("container '{container}' is not running"))
            });
        }

        if settings.check_health {
            let health = state
                .health
                .and_then(|h| h.status)
                .unwrap_or_else(|| "none".to_string());
            let outcome = match health.as_str() {
                "healthy" => CheckOutcome::up(response_time_ms),
                "starting" => CheckOutcome::degraded(
                    response_time_ms,
                    format!("container '{container}' is starting"),
                ),
                other => CheckOutcome::down(
                    response_time_ms,
                    format!("container '{container}' health is '{other}'"),
                ),
            };
            return Ok(CheckOutcome { status_code: Some(200), ..outcome });
        }

        Ok(CheckOutcome {
            status_code: Some(200),
            ..CheckOutcome::up(response_time_ms)
        })
    }
}

/// Minimal HTTP/1.1 response parse for the single inspect exchange:
/// status code plus body, de-chunking when the daemon streams chunked.
fn parse_http_response(raw: &[u8]) -> Result<(u16, Vec<u8>), String> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or("malformed HTTP response")?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut lines = head.lines();
    let status_line = lines.next().ok_or("empty HTTP response")?;
    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| format!("malformed status line '{status_line}'"))?;
    let chunked = lines.any(|l| {
        let lower = l.to_ascii_lowercase();
        lower.starts_with("transfer-encoding:") && lower.contains("chunked")
    });
    let body = &raw[split + 4..];
    if chunked {
        Ok((code, dechunk(body)?))
    } else {
        Ok((code, body.to_vec()))
    }
}

fn dechunk(mut data: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or("malformed chunked body")?;
        let size_str = String::from_utf8_lossy(&data[..line_end]);
        let size = usize::from_str_radix(size_str.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| format!("bad chunk size '{size_str}'"))?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if data.len() < size + 2 {
            return Err("truncated chunked body".to_string());
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

#[async_trait]
impl Checker for DockerChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Docker
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
    use crate::models::Status;

    #[test]
    fn parses_plain_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        let (code, body) = parse_http_response(raw).unwrap();
        assert_eq!(code, 200);
        assert_eq!(body, b"{}");
    }

    #[test]
    fn parses_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"a\r\n3\r\n\":1\r\n1\r\n}\r\n0\r\n\r\n";
        let (code, body) = parse_http_response(raw).unwrap();
        assert_eq!(code, 200);
        assert_eq!(body, b"{\"a\":1}");
    }

    #[test]
    fn parses_404() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (code, body) = parse_http_response(raw).unwrap();
        assert_eq!(code, 404);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn healthy_container_via_scripted_daemon() {
        use tokio::net::UnixListener;
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            let body = r#"{"State":{"Running":true,"Health":{"Status":"healthy"}}}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
        });

        let checker = DockerChecker::new();
        let monitor = Monitor {
            id: "m-docker".into(),
            name: "docker".into(),
            description: None,
            kind: MonitorKind::Docker,
            target: "web".into(),
            settings: serde_json::json!({
                "socket_path": sock_path.to_str().unwrap(),
                "check_health": true
            }),
            interval_seconds: 60,
            timeout_seconds: 2,
            enabled: true,
            failure_threshold: 1,
            success_threshold: 1,
            resend_interval_seconds: 0,
            track_changes: false,
            upside_down: false,
            group_id: None,
            proxy_id: None,
            assertions: None,
            tags: vec![],
            proxy_url: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.status_code, Some(200));
    }
}
