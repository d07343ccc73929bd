use hmac::{Hmac, Mac};
use sha1::Sha1;

// RFC 6238 time-based codes for the admin CLI. Never used on the probe
// path.
const DIGITS: u32 = 6;
const STEP_SECONDS: u64 = 30;

/// Code for an explicit unix timestamp.
pub fn generate_at(secret: &[u8], unix_time: u64) -> u32 {
    let counter = unix_time / STEP_SECONDS;
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[19] & 0x0f) as usize;
    let code = u32::from_be_bytes([digest[offset], digest[offset + 1], digest[offset + 2], digest[offset + 3]])
        & 0x7fff_ffff;
    code % 10u32.pow(DIGITS)
}

/// Code for the current time step.
pub fn generate(secret: &[u8]) -> u32 {
    generate_at(secret, chrono::Utc::now().timestamp() as u64)
}

/// Verify a submitted code, accepting `skew` adjacent time steps on
/// either side.
pub fn verify_at(secret: &[u8], code: u32, unix_time: u64, skew: u64) -> bool {
    let window = skew * STEP_SECONDS;
    let start = unix_time.saturating_sub(window);
    let mut t = start;
    while t <= unix_time + window {
        if generate_at(secret, t) == code {
            return true;
        }
        t += STEP_SECONDS;
    }
    false
}

pub fn verify(secret: &[u8], code: u32, skew: u64) -> bool {
    verify_at(secret, code, chrono::Utc::now().timestamp() as u64, skew)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B vectors (SHA-1, 8-digit codes truncated to 6).
    const SECRET: &[u8] = b"12345678901234567890";

    #[test]
    fn rfc6238_vectors() {
        assert_eq!(generate_at(SECRET, 59), 94287082 % 1_000_000);
        assert_eq!(generate_at(SECRET, 1111111109), 7081804 % 1_000_000);
        assert_eq!(generate_at(SECRET, 1111111111), 14050471 % 1_000_000);
        assert_eq!(generate_at(SECRET, 1234567890), 89005924 % 1_000_000);
        assert_eq!(generate_at(SECRET, 2000000000), 69279037 % 1_000_000);
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        let code = generate_at(SECRET, 1_000_000_000);
        assert!(verify_at(SECRET, code, 1_000_000_000, 0));
        assert!(verify_at(SECRET, code, 1_000_000_029, 1));
        assert!(!verify_at(SECRET, code, 1_000_000_120, 1));
    }
}
