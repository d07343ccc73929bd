use crate::checkers;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{CheckOutcome, Monitor, MonitorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One protocol probe. Implementations encode every failure as a down
/// outcome with a descriptive message and must never panic on malformed
/// settings.
#[async_trait]
pub trait Checker: Send + Sync {
    fn kind(&self) -> MonitorKind;
    async fn check(&self, monitor: &Monitor) -> CheckOutcome;
}

/// Process-local map of kind → checker. Registration happens at startup;
/// lookups are read-mostly and never block each other.
pub struct Registry {
    checkers: RwLock<HashMap<MonitorKind, Arc<dyn Checker>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { checkers: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, checker: Arc<dyn Checker>) {
        self.checkers.write().unwrap().insert(checker.kind(), checker);
    }

    pub fn get(&self, kind: MonitorKind) -> Result<Arc<dyn Checker>> {
        self.checkers
            .read()
            .unwrap()
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NoChecker(kind.as_str().to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with one checker per supported probe kind. Heartbeat monitors
/// are not probed by the pool, so no checker is registered for them.
pub fn default_registry(cfg: &Config) -> Arc<Registry> {
    let allow_private = cfg.allow_private_targets;
    let registry = Registry::new();
    registry.register(Arc::new(checkers::http::HttpChecker::new(allow_private)));
    registry.register(Arc::new(checkers::tcp::TcpChecker::new(allow_private)));
    registry.register(Arc::new(checkers::dns::DnsChecker::new()));
    registry.register(Arc::new(checkers::icmp::IcmpChecker::new(allow_private)));
    registry.register(Arc::new(checkers::tls::TlsChecker::new(allow_private)));
    registry.register(Arc::new(checkers::websocket::WebsocketChecker::new(allow_private)));
    registry.register(Arc::new(checkers::grpc::GrpcChecker::new(allow_private)));
    registry.register(Arc::new(checkers::mqtt::MqttChecker::new(allow_private)));
    registry.register(Arc::new(checkers::docker::DockerChecker::new()));
    registry.register(Arc::new(checkers::domain::DomainChecker::new(allow_private)));
    registry.register(Arc::new(checkers::command::CommandChecker::new(cfg.command_allowlist.clone())));
    Arc::new(registry)
}
