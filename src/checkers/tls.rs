use super::{decode_settings, elapsed_ms, sha256_hex};
use crate::models::{CheckOutcome, Monitor, MonitorKind, Status};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

pub const DEFAULT_WARN_DAYS: i64 = 30;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Degrade when the certificate expires within this many days.
    pub warn_days_before: Option<i64>,
}

pub struct TlsChecker {
    allow_private: bool,
}

impl TlsChecker {
    pub fn new(allow_private: bool) -> Self {
        TlsChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: TlsSettings = decode_settings(&monitor.settings)?;
        let warn_days = settings.warn_days_before.unwrap_or(DEFAULT_WARN_DAYS);
        let (host, port) = safedial::split_host_port(&monitor.target, 443)?;

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        let tcp = match safedial::connect(&host, port, timeout, self.allow_private).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name =
            ServerName::try_from(host.clone()).map_err(|_| format!("invalid SNI host '{host}'"))?;

        let stream = match connector.connect(server_name, tcp).await {
            Ok(s) => s,
            Err(e) => {
                return Ok(CheckOutcome::down(elapsed_ms(start), format!("TLS handshake failed: {e}")));
            }
        };
        let response_time_ms = elapsed_ms(start);

        let (_, conn) = stream.get_ref();
        let Some(certs) = conn.peer_certificates().filter(|c| !c.is_empty()) else {
            return Ok(CheckOutcome::down(response_time_ms, "server presented no certificate"));
        };
        let der = certs[0].as_ref();
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| format!("certificate parse failed: {e}"))?;
        let not_after = cert.validity().not_after.timestamp();
        let days = (not_after - chrono::Utc::now().timestamp()) / 86400;

        let (status, message) = if days <= 0 {
            (Status::Down, Some(format!("certificate expired {} days ago", -days)))
        } else if days <= warn_days {
            (Status::Degraded, Some(format!("certificate expires in {days} days")))
        } else {
            (Status::Up, None)
        };

        Ok(CheckOutcome {
            status,
            response_time_ms,
            status_code: Some(days as i32),
            message,
            cert_expiry: Some(not_after),
            cert_fingerprint: Some(sha256_hex(der)),
            ..CheckOutcome::up(response_time_ms)
        })
    }
}

#[async_trait]
impl Checker for TlsChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Tls
    }

    async fn check(&self, monitor: &Monitor) -> CheckOutcome {
        let start = Instant::now();
        match self.run(monitor).await {
            Ok(outcome) => outcome,
            Err(msg) => CheckOutcome::down(elapsed_ms(start), msg),
        }
    }
}
