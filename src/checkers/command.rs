use super::{decode_settings, elapsed_ms, sha256_hex, BODY_CAP};
use crate::models::{CheckOutcome, Monitor, MonitorKind, Status};
use crate::registry::Checker;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub args: Vec<String>,
}

pub struct CommandChecker {
    /// Canonicalized at construction; an empty list rejects everything.
    allowlist: Vec<PathBuf>,
}

impl CommandChecker {
    pub fn new(allowlist: Vec<PathBuf>) -> Self {
        let allowlist = allowlist
            .into_iter()
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
            .collect();
        CommandChecker { allowlist }
    }

    fn allowed(&self, canonical: &Path) -> bool {
        self.allowlist.iter().any(|p| p == canonical)
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: CommandSettings = decode_settings(&monitor.settings)?;

        // Canonicalize before the allowlist comparison so `../` and
        // symlink tricks cannot smuggle a different executable through.
        let canonical = std::fs::canonicalize(&monitor.target)
            .map_err(|e| format!("executable '{}': {e}", monitor.target))?;
        if !self.allowed(&canonical) {
            return Err(format!("executable '{}' is not allowlisted", canonical.display()));
        }

        let start = Instant::now();
        let output = match tokio::process::Command::new(&canonical)
            .args(&settings.args)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                return Ok(CheckOutcome {
                    status_code: Some(-1),
                    ..CheckOutcome::down(elapsed_ms(start), format!("failed to start: {e}"))
                });
            }
        };
        let response_time_ms = elapsed_ms(start);

        let mut stdout = output.stdout;
        stdout.truncate(BODY_CAP);
        let body_hash = sha256_hex(&stdout);
        let body = String::from_utf8_lossy(&stdout).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(CheckOutcome {
                status_code: Some(code),
                body: Some(body),
                body_hash: Some(body_hash),
                ..CheckOutcome::up(response_time_ms)
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            let message = if detail.is_empty() {
                format!("exit code {code}")
            } else {
                format!("exit code {code}: {detail}")
            };
            Ok(CheckOutcome {
                status: Status::Down,
                response_time_ms,
                status_code: Some(code),
                message: Some(message),
                body: Some(body),
                body_hash: Some(body_hash),
                ..CheckOutcome::up(response_time_ms)
            })
        }
    }
}

#[async_trait]
impl Checker for CommandChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Command
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

    fn command_monitor(target: &str, args: serde_json::Value) -> Monitor {
        Monitor {
            id: "m-cmd".into(),
            name: "cmd".into(),
            description: None,
            kind: MonitorKind::Command,
            target: target.into(),
            settings: args,
            interval_seconds: 60,
            timeout_seconds: 5,
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
    async fn empty_allowlist_rejects_everything() {
        let checker = CommandChecker::new(vec![]);
        let monitor = command_monitor("/bin/echo", serde_json::Value::Null);
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.message.unwrap().contains("not allowlisted"));
    }

    #[tokio::test]
    async fn allowlisted_command_captures_stdout() {
        let echo = PathBuf::from("/bin/echo");
        if !echo.exists() {
            return;
        }
        let checker = CommandChecker::new(vec![echo]);
        let monitor = command_monitor("/bin/echo", serde_json::json!({"args": ["ok"]}));
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Up);
        assert_eq!(outcome.status_code, Some(0));
        assert_eq!(outcome.body.as_deref(), Some("ok\n"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_down_with_code() {
        let sh = PathBuf::from("/bin/sh");
        if !sh.exists() {
            return;
        }
        let checker = CommandChecker::new(vec![sh]);
        let monitor = command_monitor(
            "/bin/sh",
            serde_json::json!({"args": ["-c", "echo boom >&2; exit 3"]}),
        );
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Down);
        assert_eq!(outcome.status_code, Some(3));
        assert!(outcome.message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn traversal_cannot_escape_the_allowlist() {
        let echo = PathBuf::from("/bin/echo");
        if !echo.exists() {
            return;
        }
        let checker = CommandChecker::new(vec![echo]);
        // Resolves to /bin/sh, which is not allowlisted.
        let monitor = command_monitor("/bin/../bin/sh", serde_json::Value::Null);
        let outcome = checker.check(&monitor).await;
        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.message.unwrap().contains("not allowlisted"));
    }
}
