pub mod command;
pub mod dns;
pub mod docker;
pub mod domain;
pub mod grpc;
pub mod http;
pub mod icmp;
pub mod mqtt;
pub mod tcp;
pub mod tls;
pub mod websocket;

use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

/// Response bodies are capped before hashing and storage.
pub const BODY_CAP: usize = 1024 * 1024;

/// Decode a per-kind settings blob. Null/absent settings fall back to the
/// kind's defaults; anything else that fails to decode is reported so the
/// checker can return a down outcome instead of guessing.
pub fn decode_settings<T: DeserializeOwned + Default>(raw: &serde_json::Value) -> Result<T, String> {
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw.clone()).map_err(|e| format!("invalid settings: {e}"))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn elapsed_ms(start: std::time::Instant) -> u32 {
    start.elapsed().as_millis().min(u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, serde::Deserialize)]
    struct Sample {
        #[serde(default)]
        flag: bool,
    }

    #[test]
    fn null_settings_take_defaults() {
        let s: Sample = decode_settings(&serde_json::Value::Null).unwrap();
        assert!(!s.flag);
    }

    #[test]
    fn bad_settings_report_instead_of_panicking() {
        let err = decode_settings::<Sample>(&serde_json::json!({"flag": "not-a-bool"})).unwrap_err();
        assert!(err.contains("invalid settings"));
    }
}
