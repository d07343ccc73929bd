use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const READ_CAP: usize = 4096;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Bytes written after connecting.
    pub send_data: Option<String>,
    /// Substring the first 4 KiB of the response must contain.
    pub expect_data: Option<String>,
}

pub struct TcpChecker {
    allow_private: bool,
}

impl TcpChecker {
    pub fn new(allow_private: bool) -> Self {
        TcpChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: TcpSettings = decode_settings(&monitor.settings)?;
        let (host, port) = safedial::split_host_port(&monitor.target, 0)?;
        if port == 0 {
            return Err(format!("target '{}' must be host:port", monitor.target));
        }

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        let mut stream = match safedial::connect(&host, port, timeout, self.allow_private).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };

        if let Some(data) = &settings.send_data {
            if let Err(e) = stream.write_all(data.as_bytes()).await {
                return Ok(CheckOutcome::down(elapsed_ms(start), format!("write failed: {e}")));
            }
        }

        if let Some(expected) = &settings.expect_data {
            let mut buf = vec![0u8; READ_CAP];
            let mut filled = 0;
            loop {
                match stream.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        filled += n;
                        if String::from_utf8_lossy(&buf[..filled]).contains(expected.as_str()) {
                            break;
                        }
                        if filled == READ_CAP {
                            break;
                        }
                    }
                    Err(e) => {
                        return Ok(CheckOutcome::down(elapsed_ms(start), format!("read failed: {e}")));
                    }
                }
            }
            let received = String::from_utf8_lossy(&buf[..filled]);
            if !received.contains(expected.as_str()) {
                return Ok(CheckOutcome::down(
                    elapsed_ms(start),
                    format!("expected data '{expected}' not found in response"),
                ));
            }
        }

        Ok(CheckOutcome::up(elapsed_ms(start)))
    }
}

#[async_trait]
impl Checker for TcpChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Tcp
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
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    fn tcp_monitor(target: &str, settings: serde_json::Value) -> Monitor {
        Monitor {
            id: "m-tcp".into(),
            name: "tcp".into(),
            description: None,
            kind: MonitorKind::Tcp,
            target: target.into(),
            settings,
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
        }
    }

    #[tokio::test]
    async fn connect_and_banner_match() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"220 ready\r\n").await.unwrap();
        });

        let checker = TcpChecker::new(true);
        let monitor = tcp_monitor(&addr.to_string(), serde_json::json!({"expect_data": "220"}));
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Up);
    }

    #[tokio::test]
    async fn refused_port_is_down() {
        // Bind and drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checker = TcpChecker::new(true);
        let monitor = tcp_monitor(&addr.to_string(), serde_json::Value::Null);
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.message.is_some());
    }

    #[tokio::test]
    async fn private_target_blocked_by_default() {
        let checker = TcpChecker::new(false);
        let monitor = tcp_monitor("127.0.0.1:80", serde_json::Value::Null);
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.message.unwrap().contains("private/reserved"));
    }
}
