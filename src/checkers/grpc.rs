use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

const HEALTH_PATH: &str = "/grpc.health.v1.Health/Check";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GrpcSettings {
    /// Service name sent in the health check request; empty checks the
    /// server as a whole.
    pub service: Option<String>,
    pub use_tls: bool,
}

pub struct GrpcChecker {
    allow_private: bool,
}

impl GrpcChecker {
    pub fn new(allow_private: bool) -> Self {
        GrpcChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: GrpcSettings = decode_settings(&monitor.settings)?;
        let default_port = if settings.use_tls { 443 } else { 80 };
        let (host, port) = safedial::split_host_port(&monitor.target, default_port)?;
        let service = settings.service.clone().unwrap_or_default();

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        let tcp = match safedial::connect(&host, port, timeout, self.allow_private).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };

        let authority = format!("{host}:{port}");
        let outcome = if settings.use_tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let mut config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![b"h2".to_vec()];
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| format!("invalid SNI host '{host}'"))?;
            let tls = match connector.connect(server_name, tcp).await {
                Ok(s) => s,
                Err(e) => {
                    return Ok(CheckOutcome::down(
                        elapsed_ms(start),
                        format!("TLS handshake failed: {e}"),
                    ));
                }
            };
            health_call(tls, &authority, "https", &service, start).await
        } else {
            health_call(tcp, &authority, "http", &service, start).await
        };
        Ok(outcome)
    }
}

/// Unary gRPC health check over an established connection: a hand-built
/// length-prefixed frame carrying the minimal protobuf request.
async fn health_call<S>(stream: S, authority: &str, scheme: &str, service: &str, start: Instant) -> CheckOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, connection) = match h2::client::handshake(stream).await {
        Ok(pair) => pair,
        Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("HTTP/2 handshake failed: {e}")),
    };
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let mut client = match client.ready().await {
        Ok(c) => c,
        Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("HTTP/2 connection failed: {e}")),
    };

    let request = match http::Request::builder()
        .method("POST")
        .uri(format!("{scheme}://{authority}{HEALTH_PATH}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(())
    {
        Ok(r) => r,
        Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("request build failed: {e}")),
    };

    let (response, mut body_tx) = match client.send_request(request, false) {
        Ok(pair) => pair,
        Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("request send failed: {e}")),
    };
    if let Err(e) = body_tx.send_data(Bytes::from(encode_health_request(service)), true) {
        return CheckOutcome::down(elapsed_ms(start), format!("frame send failed: {e}"));
    }

    let response = match response.await {
        Ok(r) => r,
        Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("response failed: {e}")),
    };

    if let Some(status) = grpc_status_error(response.headers()) {
        return CheckOutcome {
            status_code: Some(status.0),
            ..CheckOutcome::down(elapsed_ms(start), status.1)
        };
    }

    let mut body = response.into_body();
    let mut payload = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                let _ = body.flow_control().release_capacity(data.len());
                payload.extend_from_slice(&data);
            }
            Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("body read failed: {e}")),
        }
    }
    let trailers = match body.trailers().await {
        Ok(t) => t,
        Err(e) => return CheckOutcome::down(elapsed_ms(start), format!("trailer read failed: {e}")),
    };
    if let Some(status) = trailers.as_ref().and_then(|t| grpc_status_error(t)) {
        return CheckOutcome {
            status_code: Some(status.0),
            ..CheckOutcome::down(elapsed_ms(start), status.1)
        };
    }

    let response_time_ms = elapsed_ms(start);
    match decode_serving_status(&payload) {
        Some(1) => CheckOutcome {
            status_code: Some(1),
            ..CheckOutcome::up(response_time_ms)
        },
        Some(2) => CheckOutcome {
            status_code: Some(2),
            ..CheckOutcome::down(response_time_ms, "service NOT_SERVING")
        },
        Some(3) => CheckOutcome {
            status_code: Some(3),
            ..CheckOutcome::down(response_time_ms, "service SERVICE_UNKNOWN")
        },
        Some(other) => CheckOutcome {
            status_code: Some(other as i32),
            ..CheckOutcome::down(response_time_ms, format!("unknown serving status {other}"))
        },
        None => CheckOutcome::down(response_time_ms, "malformed health response"),
    }
}

/// Non-zero `grpc-status` as (code, message), if present.
fn grpc_status_error(headers: &http::HeaderMap) -> Option<(i32, String)> {
    let status = headers.get("grpc-status")?.to_str().ok()?;
    if status == "0" {
        return None;
    }
    let message = headers
        .get("grpc-message")
        .and_then(|m| m.to_str().ok())
        .unwrap_or("unknown error");
    Some((
        status.parse().unwrap_or(-1),
        format!("grpc-status {status}: {message}"),
    ))
}

/// `[compression:1][length:4 BE][payload]` with the HealthCheckRequest
/// service name as protobuf field 1 (wire type 2).
fn encode_health_request(service: &str) -> Vec<u8> {
    let mut pb = Vec::new();
    if !service.is_empty() {
        pb.push(0x0a);
        encode_varint(service.len() as u64, &mut pb);
        pb.extend_from_slice(service.as_bytes());
    }
    let mut frame = Vec::with_capacity(5 + pb.len());
    frame.push(0);
    frame.extend_from_slice(&(pb.len() as u32).to_be_bytes());
    frame.extend_from_slice(&pb);
    frame
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Pull the HealthCheckResponse status (field 1, varint) out of a
/// length-prefixed gRPC frame.
fn decode_serving_status(frame: &[u8]) -> Option<u64> {
    if frame.len() < 5 || frame[0] != 0 {
        return None;
    }
    let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    let payload = frame.get(5..5 + len)?;
    // An empty message means status UNKNOWN (0).
    if payload.is_empty() {
        return Some(0);
    }
    let mut idx = 0;
    while idx < payload.len() {
        let tag = payload[idx];
        idx += 1;
        let field = tag >> 3;
        let wire = tag & 0x07;
        match (field, wire) {
            (1, 0) => return decode_varint(payload, &mut idx),
            (_, 0) => {
                decode_varint(payload, &mut idx)?;
            }
            (_, 2) => {
                let len = decode_varint(payload, &mut idx)? as usize;
                idx += len;
            }
            _ => return None,
        }
    }
    None
}

fn decode_varint(data: &[u8], idx: &mut usize) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *data.get(*idx)?;
        *idx += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

#[async_trait]
impl Checker for GrpcChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Grpc
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
    fn frame_layout_for_named_service() {
        let frame = encode_health_request("db");
        // compression flag, 4-byte length, then field 1 / wire type 2.
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..5], &4u32.to_be_bytes());
        assert_eq!(&frame[5..], &[0x0a, 0x02, b'd', b'b']);
    }

    #[test]
    fn frame_layout_for_empty_service() {
        let frame = encode_health_request("");
        assert_eq!(frame, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn decodes_serving_status() {
        // status = SERVING (1)
        assert_eq!(decode_serving_status(&[0, 0, 0, 0, 2, 0x08, 0x01]), Some(1));
        // status = NOT_SERVING (2)
        assert_eq!(decode_serving_status(&[0, 0, 0, 0, 2, 0x08, 0x02]), Some(2));
        // empty message decodes as UNKNOWN
        assert_eq!(decode_serving_status(&[0, 0, 0, 0, 0]), Some(0));
        // compressed frames are not understood
        assert_eq!(decode_serving_status(&[1, 0, 0, 0, 0]), None);
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let mut idx = 0;
            assert_eq!(decode_varint(&buf, &mut idx), Some(value));
            assert_eq!(idx, buf.len());
        }
    }
}
