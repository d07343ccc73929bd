use super::elapsed_ms;
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use crate::safedial;
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

const ECHO_PAYLOAD: &[u8] = b"asura-ping";

pub struct IcmpChecker {
    allow_private: bool,
}

impl IcmpChecker {
    pub fn new(allow_private: bool) -> Self {
        IcmpChecker { allow_private }
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let addrs = safedial::resolve_checked(&monitor.target, self.allow_private).await?;
        let target = addrs
            .iter()
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| format!("{} has no IPv4 address", monitor.target))?;

        let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || ping_blocking(target, timeout))
            .await
            .map_err(|e| format!("ping task failed: {e}"))?;
        match result {
            Ok(rtt) => Ok(CheckOutcome::up(rtt.as_millis().min(u32::MAX as u128) as u32)),
            Err(msg) => Ok(CheckOutcome::down(elapsed_ms(start), msg)),
        }
    }
}

/// One echo request / echo reply round trip. Tries a privileged raw
/// socket first and falls back to the unprivileged datagram ICMP socket.
fn ping_blocking(target: Ipv4Addr, timeout: Duration) -> Result<Duration, String> {
    let (socket, raw) = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(s) => (s, true),
        Err(_) => match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
            Ok(s) => (s, false),
            Err(e) => return Err(format!("icmp socket unavailable: {e}")),
        },
    };

    let id = (std::process::id() & 0xffff) as u16;
    let seq: u16 = 1;
    let packet = build_echo_request(id, seq);

    let dest = SockAddr::from(SocketAddrV4::new(target, 0));
    let start = Instant::now();
    socket
        .send_to(&packet, &dest)
        .map_err(|e| format!("icmp send failed: {e}"))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1600];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .ok_or_else(|| "no echo reply within timeout".to_string())?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| format!("icmp socket config failed: {e}"))?;
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err("no echo reply within timeout".to_string());
            }
            Err(e) => return Err(format!("icmp recv failed: {e}")),
        };
        let bytes: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
        // Raw sockets deliver the IP header; datagram ICMP sockets do not.
        let icmp = if raw {
            if bytes.len() < 20 {
                continue;
            }
            let ihl = ((bytes[0] & 0x0f) as usize) * 4;
            if bytes.len() <= ihl {
                continue;
            }
            &bytes[ihl..]
        } else {
            bytes
        };
        if icmp.len() < 8 || icmp[0] != 0 || icmp[1] != 0 {
            continue; // not an echo reply
        }
        let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
        let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
        // The kernel rewrites the identifier on datagram ICMP sockets, so
        // only require a match on raw sockets.
        if reply_seq == seq && (!raw || reply_id == id) {
            return Ok(start.elapsed());
        }
    }
}

fn build_echo_request(id: u16, seq: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    packet.push(8); // echo request
    packet.push(0);
    packet.extend_from_slice(&[0, 0]); // checksum placeholder
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    let ck = checksum(&packet);
    packet[2..4].copy_from_slice(&ck.to_be_bytes());
    packet
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for pair in data.chunks(2) {
        let word = if pair.len() == 2 {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], 0])
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[async_trait]
impl Checker for IcmpChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Icmp
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
    fn echo_request_layout() {
        let packet = build_echo_request(0x1234, 1);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x01]);
        assert_eq!(&packet[8..], b"asura-ping");
    }

    #[test]
    fn checksum_verifies_to_zero() {
        // A packet with a correct checksum sums to 0xffff before inversion.
        let packet = build_echo_request(42, 1);
        let mut sum: u32 = 0;
        for pair in packet.chunks(2) {
            let word = if pair.len() == 2 {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], 0])
            };
            sum = sum.wrapping_add(word as u32);
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);
    }
}
