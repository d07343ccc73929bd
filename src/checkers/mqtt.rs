use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Topic to subscribe to after connecting; connection-only check when
    /// absent.
    pub topic: Option<String>,
    pub use_tls: bool,
}

pub struct MqttChecker {
    allow_private: bool,
}

impl MqttChecker {
    pub fn new(allow_private: bool) -> Self {
        MqttChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: MqttSettings = decode_settings(&monitor.settings)?;
        let default_port = if settings.use_tls { 8883 } else { 1883 };
        let (host, port) = safedial::split_host_port(&monitor.target, default_port)?;

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        let tcp = match safedial::connect(&host, port, timeout, self.allow_private).await {
            Ok(s) => s,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };

        let result = if settings.use_tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| format!("invalid SNI host '{host}'"))?;
            match connector.connect(server_name, tcp).await {
                Ok(tls) => session(tls, settings.topic.as_deref()).await,
                Err(e) => Err(format!("TLS handshake failed: {e}")),
            }
        } else {
            session(tcp, settings.topic.as_deref()).await
        };

        match result {
            Ok(()) => Ok(CheckOutcome::up(elapsed_ms(start))),
            Err(msg) => Ok(CheckOutcome::down(elapsed_ms(start), msg)),
        }
    }
}

/// MQTT 3.1.1 spoken by hand: CONNECT/CONNACK, optional SUBSCRIBE/SUBACK,
/// then DISCONNECT.
async fn session<S>(mut stream: S, topic: Option<&str>) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = format!("asura-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    stream
        .write_all(&connect_packet(&client_id))
        .await
        .map_err(|e| format!("CONNECT write failed: {e}"))?;

    let mut connack = [0u8; 4];
    stream
        .read_exact(&mut connack)
        .await
        .map_err(|e| format!("CONNACK read failed: {e}"))?;
    if connack[0] >> 4 != 2 {
        return Err(format!("expected CONNACK, got packet type {}", connack[0] >> 4));
    }
    if connack[3] != 0 {
        return Err(format!("broker refused connection: return code {}", connack[3]));
    }

    if let Some(topic) = topic {
        stream
            .write_all(&subscribe_packet(topic, 1))
            .await
            .map_err(|e| format!("SUBSCRIBE write failed: {e}"))?;
        let mut suback = [0u8; 5];
        stream
            .read_exact(&mut suback)
            .await
            .map_err(|e| format!("SUBACK read failed: {e}"))?;
        if suback[0] >> 4 != 9 {
            return Err(format!("expected SUBACK, got packet type {}", suback[0] >> 4));
        }
        if suback[4] == 0x80 {
            return Err(format!("subscription to '{topic}' rejected"));
        }
    }

    let _ = stream.write_all(&[0xe0, 0x00]).await; // DISCONNECT
    Ok(())
}

fn connect_packet(client_id: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x00, 0x04]); // protocol name length
    body.extend_from_slice(b"MQTT");
    body.push(4); // protocol level 3.1.1
    body.push(0x02); // clean session
    body.extend_from_slice(&30u16.to_be_bytes()); // keepalive seconds
    body.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    body.extend_from_slice(client_id.as_bytes());

    let mut packet = vec![0x10];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    packet
}

fn subscribe_packet(topic: &str, packet_id: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&packet_id.to_be_bytes());
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.push(0); // QoS 0

    let mut packet = vec![0x82];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    packet
}

/// Variable-length base-128 "remaining length", at most 4 bytes.
fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return;
        }
    }
}

#[allow(dead_code)]
fn decode_remaining_length(data: &[u8]) -> Option<(usize, usize)> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in data.iter().take(4).enumerate() {
        value += (*byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        multiplier *= 128;
    }
    None
}

#[async_trait]
impl Checker for MqttChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Mqtt
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
    fn remaining_length_encoding() {
        let cases: &[(usize, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (16383, &[0xff, 0x7f]),
            (16384, &[0x80, 0x80, 0x01]),
            (2_097_151, &[0xff, 0xff, 0x7f]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
        ];
        for (len, expected) in cases {
            let mut out = Vec::new();
            encode_remaining_length(*len, &mut out);
            assert_eq!(&out, expected, "length {len}");
            assert_eq!(decode_remaining_length(expected), Some((*len, expected.len())));
        }
    }

    #[test]
    fn connect_packet_shape() {
        let packet = connect_packet("asura-test");
        assert_eq!(packet[0], 0x10);
        let (remaining, header_len) = decode_remaining_length(&packet[1..]).unwrap();
        assert_eq!(remaining, packet.len() - 1 - header_len);
        // Variable header: protocol name, level 4, clean session, keepalive 30.
        let body = &packet[1 + header_len..];
        assert_eq!(&body[..6], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(body[6], 4);
        assert_eq!(body[7], 0x02);
        assert_eq!(&body[8..10], &30u16.to_be_bytes());
    }

    #[test]
    fn subscribe_packet_shape() {
        let packet = subscribe_packet("health/#", 1);
        assert_eq!(packet[0], 0x82);
        let (_, header_len) = decode_remaining_length(&packet[1..]).unwrap();
        let body = &packet[1 + header_len..];
        assert_eq!(&body[..2], &[0x00, 0x01]); // packet id
        assert_eq!(&body[2..4], &(8u16).to_be_bytes());
        assert_eq!(&body[4..12], b"health/#");
        assert_eq!(body[12], 0); // QoS 0
    }

    #[tokio::test]
    async fn session_against_scripted_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await.unwrap(); // CONNECT
            sock.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap(); // CONNACK accepted
            let _ = sock.read(&mut buf).await.unwrap(); // SUBSCRIBE
            sock.write_all(&[0x90, 0x03, 0x00, 0x01, 0x00]).await.unwrap(); // SUBACK QoS 0
            let _ = sock.read(&mut buf).await; // DISCONNECT
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(session(stream, Some("health/#")).await.is_ok());
    }

    #[tokio::test]
    async fn refused_connack_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await.unwrap();
            // return code 5: not authorized
            sock.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let err = session(stream, None).await.unwrap_err();
        assert!(err.contains("return code 5"));
    }
}
