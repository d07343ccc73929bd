use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WebsocketSettings {
    pub headers: HashMap<String, String>,
    /// Text frame sent after the handshake.
    pub send_message: Option<String>,
    /// Substring the first reply frame must contain.
    pub expect_reply: Option<String>,
}

pub struct WebsocketChecker {
    allow_private: bool,
}

impl WebsocketChecker {
    pub fn new(allow_private: bool) -> Self {
        WebsocketChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: WebsocketSettings = decode_settings(&monitor.settings)?;

        let url = reqwest::Url::parse(&monitor.target).map_err(|e| format!("invalid URL: {e}"))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(format!("unsupported scheme '{other}'")),
        }
        let host = url.host_str().ok_or("URL has no host")?.to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if url.scheme() == "wss" { 443 } else { 80 });

        let mut request = monitor
            .target
            .as_str()
            .into_client_request()
            .map_err(|e| format!("invalid websocket request: {e}"))?;
        for (name, value) in &settings.headers {
            let name: http::header::HeaderName =
                name.parse().map_err(|_| format!("invalid header name '{name}'"))?;
            let value = value
                .parse()
                .map_err(|_| format!("invalid header value for '{name:?}'"))?;
            request.headers_mut().insert(name, value);
        }

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        // Dial through the vetted connector, then hand the stream to the
        // websocket client so the handshake reuses the checked connection.
        let tcp = match safedial::connect(&host, port, timeout, self.allow_private).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };
        let (mut ws, _resp) = match tokio_tungstenite::client_async_tls(request, tcp).await {
            Ok(pair) => pair,
            Err(e) => {
                return Ok(CheckOutcome::down(
                    elapsed_ms(start),
                    format!("websocket handshake failed: {e}"),
                ));
            }
        };

        if let Some(text) = &settings.send_message {
            if let Err(e) = ws.send(Message::Text(text.clone())).await {
                return Ok(CheckOutcome::down(elapsed_ms(start), format!("send failed: {e}")));
            }
        }

        if let Some(expected) = &settings.expect_reply {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(reply))) => {
                        if reply.contains(expected.as_str()) {
                            break;
                        }
                        return Ok(CheckOutcome::down(
                            elapsed_ms(start),
                            format!("reply did not contain '{expected}'"),
                        ));
                    }
                    Some(Ok(Message::Binary(reply))) => {
                        if String::from_utf8_lossy(&reply).contains(expected.as_str()) {
                            break;
                        }
                        return Ok(CheckOutcome::down(
                            elapsed_ms(start),
                            format!("reply did not contain '{expected}'"),
                        ));
                    }
                    // Control frames can arrive before the reply.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Ok(CheckOutcome::down(elapsed_ms(start), format!("read failed: {e}")));
                    }
                    None => {
                        return Ok(CheckOutcome::down(elapsed_ms(start), "connection closed before reply"));
                    }
                }
            }
        }

        let _ = ws.close(None).await;
        Ok(CheckOutcome::up(elapsed_ms(start)))
    }
}

#[async_trait]
impl Checker for WebsocketChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Websocket
    }

    async fn check(&self, monitor: &Monitor) -> CheckOutcome {
        let start = Instant::now();
        match self.run(monitor).await {
            Ok(outcome) => outcome,
            Err(msg) => CheckOutcome::down(elapsed_ms(start), msg),
        }
    }
}
