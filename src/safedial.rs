use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

// Reserved/special-purpose ranges rejected unless private targets are
// explicitly allowed. The check runs on post-resolution addresses so a
// hostname cannot smuggle a private IP past it (DNS rebinding).
const BLOCKED_V4: &[(u32, u8)] = &[
    (0x00000000, 8),  // 0.0.0.0/8
    (0x0A000000, 8),  // 10.0.0.0/8
    (0x64400000, 10), // 100.64.0.0/10
    (0x7F000000, 8),  // 127.0.0.0/8
    (0xA9FE0000, 16), // 169.254.0.0/16
    (0xAC100000, 12), // 172.16.0.0/12
    (0xC0000000, 24), // 192.0.0.0/24
    (0xC0000200, 24), // 192.0.2.0/24
    (0xC0586300, 24), // 192.88.99.0/24
    (0xC0A80000, 16), // 192.168.0.0/16
    (0xC6120000, 15), // 198.18.0.0/15
    (0xC6336400, 24), // 198.51.100.0/24
    (0xCB007100, 24), // 203.0.113.0/24
    (0xE0000000, 4),  // 224.0.0.0/4
    (0xF0000000, 4),  // 240.0.0.0/4
    (0xFFFFFFFF, 32), // 255.255.255.255/32
];

const BLOCKED_V6: &[(u128, u8)] = &[
    (0x0000_0000_0000_0000_0000_0000_0000_0001, 128), // ::1/128
    (0xFC00_0000_0000_0000_0000_0000_0000_0000, 7),   // fc00::/7
    (0xFE80_0000_0000_0000_0000_0000_0000_0000, 10),  // fe80::/10
];

fn v4_blocked(ip: Ipv4Addr) -> bool {
    let bits = u32::from(ip);
    BLOCKED_V4.iter().any(|&(net, prefix)| {
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        bits & mask == net
    })
}

fn v6_blocked(ip: Ipv6Addr) -> bool {
    let bits = u128::from(ip);
    BLOCKED_V6.iter().any(|&(net, prefix)| {
        let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
        bits & mask == net
    })
}

pub fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4_blocked(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4_blocked(v4),
            None => v6_blocked(v6),
        },
    }
}

/// Resolve `host` and vet every address against the blocked ranges.
/// Literal IPs are vetted directly. Errors are plain strings because the
/// callers fold them into a down outcome.
pub async fn resolve_checked(host: &str, allow_private: bool) -> Result<Vec<IpAddr>, String> {
    let addrs: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![ip]
    } else {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| format!("DNS lookup failed for {host}: {e}"))?;
        lookup.iter().collect()
    };
    if addrs.is_empty() {
        return Err(format!("no addresses found for {host}"));
    }
    if !allow_private {
        if let Some(bad) = addrs.iter().find(|ip| is_blocked(**ip)) {
            return Err(format!("{host} resolves to private/reserved address {bad}"));
        }
    }
    Ok(addrs)
}

/// Vetted TCP connect: resolve, check the blocked ranges, then dial the
/// addresses we checked (never re-resolving).
pub async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
    allow_private: bool,
) -> Result<TcpStream, String> {
    let addrs = resolve_checked(host, allow_private).await?;
    let mut last_err = String::from("no addresses tried");
    for addr in addrs {
        let sock = SocketAddr::new(addr, port);
        match tokio::time::timeout(timeout, TcpStream::connect(sock)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = format!("connect {sock}: {e}"),
            Err(_) => last_err = format!("connect {sock}: timed out"),
        }
    }
    Err(last_err)
}

/// Split a `host:port` target, tolerating a scheme prefix and bracketed
/// IPv6 literals. Returns the default port when none is present.
pub fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16), String> {
    let t = target
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("tls://");
    if let Some(rest) = t.strip_prefix('[') {
        // [v6]:port or [v6]
        let Some(end) = rest.find(']') else {
            return Err(format!("invalid target '{target}'"));
        };
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| format!("invalid port in '{target}'"))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match t.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(':') => {
            let port = port.parse().map_err(|_| format!("invalid port in '{target}'"))?;
            Ok((host.to_string(), port))
        }
        // Bare IPv6 literal or no port at all.
        _ => Ok((t.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_every_reserved_range() {
        let blocked = [
            "0.1.2.3",
            "10.0.0.1",
            "100.64.1.1",
            "127.0.0.1",
            "169.254.1.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.0.0.1",
            "192.0.2.10",
            "192.88.99.1",
            "192.168.1.1",
            "198.18.0.1",
            "198.19.255.255",
            "198.51.100.7",
            "203.0.113.9",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
            "::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
        ];
        for ip in blocked {
            assert!(is_blocked(ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn admits_public_addresses() {
        let public = ["1.1.1.1", "8.8.8.8", "93.184.216.34", "172.32.0.1", "100.128.0.1", "2606:4700::1111"];
        for ip in public {
            assert!(!is_blocked(ip.parse().unwrap()), "{ip} should be admitted");
        }
    }

    #[test]
    fn blocks_v4_mapped_v6() {
        assert!(is_blocked("::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_blocked("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!is_blocked("::ffff:1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn splits_targets() {
        assert_eq!(split_host_port("example.com:8080", 80).unwrap(), ("example.com".into(), 8080));
        assert_eq!(split_host_port("example.com", 443).unwrap(), ("example.com".into(), 443));
        assert_eq!(split_host_port("tcp://db:5432", 80).unwrap(), ("db".into(), 5432));
        assert_eq!(split_host_port("[::1]:9000", 80).unwrap(), ("::1".into(), 9000));
        assert_eq!(split_host_port("::1", 80).unwrap(), ("::1".into(), 80));
        assert!(split_host_port("host:notaport", 80).is_err());
    }

    #[tokio::test]
    async fn resolve_checked_rejects_loopback_literal() {
        let err = resolve_checked("127.0.0.1", false).await.unwrap_err();
        assert!(err.contains("private/reserved"), "{err}");
    }

    #[tokio::test]
    async fn resolve_checked_allows_private_when_configured() {
        let addrs = resolve_checked("127.0.0.1", true).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
