use super::{decode_settings, elapsed_ms, sha256_hex, BODY_CAP};
use crate::models::{CheckOutcome, Monitor, MonitorKind, Status};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use x509_parser::prelude::*;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub method: Option<String>,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    /// Request body encoding: "json", "xml" or "form".
    pub encoding: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    pub expected_status: Option<u16>,
    /// Append a nanosecond-derived query param to defeat caches.
    pub cache_bust: bool,
    pub skip_tls_verify: bool,
    /// 0 follows no redirects; anything else follows at least 10.
    pub max_redirects: usize,
}

pub struct HttpChecker {
    allow_private: bool,
}

impl HttpChecker {
    pub fn new(allow_private: bool) -> Self {
        HttpChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: HttpSettings = decode_settings(&monitor.settings)?;

        let mut url = reqwest::Url::parse(&monitor.target).map_err(|e| format!("invalid URL: {e}"))?;
        let host = url.host_str().ok_or("URL has no host")?.to_string();

        // Vet the target's addresses up front and pin them on the client so
        // the request cannot connect anywhere we did not check.
        let addrs = safedial::resolve_checked(&host, self.allow_private).await?;
        let pinned: Vec<SocketAddr> = addrs.iter().map(|ip| SocketAddr::new(*ip, 0)).collect();

        if settings.cache_bust {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            url.query_pairs_mut().append_pair("_", &nanos.to_string());
        }

        let redirect = if settings.max_redirects == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(settings.max_redirects.max(10))
        };

        let mut builder = reqwest::Client::builder()
            .redirect(redirect)
            .danger_accept_invalid_certs(settings.skip_tls_verify)
            .tls_info(true)
            .pool_max_idle_per_host(0)
            .timeout(Duration::from_secs(monitor.timeout_seconds as u64))
            .resolve_to_addrs(&host, &pinned);
        if let Some(proxy_url) = &monitor.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| format!("invalid proxy: {e}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| format!("client build failed: {e}"))?;

        let method = match &settings.method {
            Some(m) => reqwest::Method::from_bytes(m.to_uppercase().as_bytes())
                .map_err(|_| format!("invalid method '{m}'"))?,
            None => reqwest::Method::GET,
        };

        let mut req = client.request(method, url);
        for (name, value) in &settings.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &settings.bearer_token {
            req = req.bearer_auth(token);
        } else if let Some(user) = &settings.username {
            req = req.basic_auth(user, settings.password.as_deref());
        }
        if let Some(body) = &settings.body {
            let content_type = match settings.encoding.as_deref() {
                Some("json") | None => "application/json",
                Some("xml") => "application/xml",
                Some("form") => "application/x-www-form-urlencoded",
                Some(other) => return Err(format!("invalid settings: unknown encoding '{other}'")),
            };
            req = req.header(reqwest::header::CONTENT_TYPE, content_type).body(body.clone());
        }

        let start = Instant::now();
        let mut resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                let msg = if e.is_timeout() {
                    "request timed out".to_string()
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request failed: {e}")
                };
                return Ok(CheckOutcome::down(elapsed_ms(start), msg));
            }
        };
        let code = resp.status().as_u16();

        let mut headers = serde_json::Map::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), serde_json::Value::String(v.to_string()));
            }
        }

        // Leaf certificate, when the transport exposes one.
        let (cert_expiry, cert_fingerprint) = resp
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(|der| {
                let expiry = parse_x509_certificate(der)
                    .ok()
                    .map(|(_, cert)| cert.validity().not_after.timestamp());
                (expiry, Some(sha256_hex(der)))
            })
            .unwrap_or((None, None));

        let mut body = Vec::new();
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = BODY_CAP - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                    if body.len() >= BODY_CAP {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Ok(CheckOutcome::down(elapsed_ms(start), format!("body read failed: {e}")));
                }
            }
        }
        let response_time_ms = elapsed_ms(start);
        let body_hash = sha256_hex(&body);
        let body_text = String::from_utf8_lossy(&body).into_owned();

        let (status, message) = match settings.expected_status {
            Some(expected) if code != expected => (
                Status::Down,
                Some(format!("expected status {expected}, got {code}")),
            ),
            _ => (Status::Up, None),
        };

        Ok(CheckOutcome {
            status,
            response_time_ms,
            status_code: Some(code as i32),
            message,
            headers: Some(serde_json::Value::Object(headers)),
            body: Some(body_text),
            body_hash: Some(body_hash),
            cert_expiry,
            cert_fingerprint,
            dns_records: None,
        })
    }
}

#[async_trait]
impl Checker for HttpChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Http
    }

    async fn check(&self, monitor: &Monitor) -> CheckOutcome {
        let start = Instant::now();
        match self.run(monitor).await {
            Ok(outcome) => outcome,
            Err(msg) => CheckOutcome::down(elapsed_ms(start), msg),
        }
    }
}
