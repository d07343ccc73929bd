use super::{decode_settings, elapsed_ms};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use crate::registry::Checker;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::{Name, TokioAsyncResolver};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// One of A, AAAA, CNAME, MX, TXT, NS. Defaults to A.
    pub record_type: Option<String>,
    /// Custom resolver IP; queried over UDP port 53.
    pub resolver: Option<String>,
}

pub struct DnsChecker;

impl DnsChecker {
    pub fn new() -> Self {
        DnsChecker
    }

    async fn run(&self, monitor: &Monitor) -> Result<CheckOutcome, String> {
        let settings: DnsSettings = decode_settings(&monitor.settings)?;
        let record_type = settings.record_type.as_deref().unwrap_or("A").to_uppercase();

        let resolver = match &settings.resolver {
            Some(addr) => {
                let ip: IpAddr = addr.parse().map_err(|_| format!("invalid resolver address '{addr}'"))?;
                let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
                let config = ResolverConfig::from_parts(None, vec![], group);
                TokioAsyncResolver::tokio(config, ResolverOpts::default())
            }
            None => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        };

        let name = Name::from_ascii(&monitor.target)
            .map_err(|e| format!("invalid hostname '{}': {e}", monitor.target))?;

        let start = Instant::now();
        let records = match lookup(&resolver, name, &record_type).await {
            Ok(r) => r,
            Err(e) => return Ok(CheckOutcome::down(elapsed_ms(start), e)),
        };
        let response_time_ms = elapsed_ms(start);

        if records.is_empty() {
            return Ok(CheckOutcome {
                dns_records: Some(records),
                ..CheckOutcome::down(
                    response_time_ms,
                    format!("no {record_type} records found for {}", monitor.target),
                )
            });
        }

        Ok(CheckOutcome {
            dns_records: Some(records),
            ..CheckOutcome::up(response_time_ms)
        })
    }
}

async fn lookup(resolver: &TokioAsyncResolver, name: Name, record_type: &str) -> Result<Vec<String>, String> {
    match record_type {
        "A" => {
            let response = resolver.ipv4_lookup(name).await.map_err(|e| e.to_string())?;
            Ok(response.iter().map(|ip| ip.to_string()).collect())
        }
        "AAAA" => {
            let response = resolver.ipv6_lookup(name).await.map_err(|e| e.to_string())?;
            Ok(response.iter().map(|ip| ip.to_string()).collect())
        }
        "MX" => {
            let response = resolver.mx_lookup(name).await.map_err(|e| e.to_string())?;
            Ok(response
                .iter()
                .map(|mx| format!("{} {}", mx.preference(), mx.exchange()))
                .collect())
        }
        "TXT" => {
            let response = resolver.txt_lookup(name).await.map_err(|e| e.to_string())?;
            Ok(response.iter().map(|txt| txt.to_string()).collect())
        }
        "NS" => {
            let response = resolver.ns_lookup(name).await.map_err(|e| e.to_string())?;
            Ok(response.iter().map(|ns| ns.to_string()).collect())
        }
        "CNAME" => {
            let response = resolver
                .lookup(name, RecordType::CNAME)
                .await
                .map_err(|e| e.to_string())?;
            Ok(response.iter().map(|r| r.to_string()).collect())
        }
        other => Err(format!("unsupported record type: {other}")),
    }
}

#[async_trait]
impl Checker for DnsChecker {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Dns
    }

    async fn check(&self, monitor: &Monitor) -> CheckOutcome {
        let start = Instant::now();
        match self.run(monitor).await {
            Ok(outcome) => outcome,
            Err(msg) => CheckOutcome::down(elapsed_ms(start), msg),
        }
    }
}
