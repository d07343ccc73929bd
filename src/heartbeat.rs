use crate::db::Store;
use crate::incidents::IncidentManager;
use crate::models::{now_iso, now_unix, EventType, MonitorStatus, Status};
use crate::notify::Notifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Turns missing pings into failures. Runs on its own tick, independent
/// of the probe pipeline, and feeds the same incident manager.
pub struct HeartbeatWatcher {
    store: Arc<Store>,
    incidents: Arc<IncidentManager>,
    notifier: Arc<Notifier>,
    interval: Duration,
}

impl HeartbeatWatcher {
    pub fn new(
        store: Arc<Store>,
        incidents: Arc<IncidentManager>,
        notifier: Arc<Notifier>,
        interval: Duration,
    ) -> Self {
        HeartbeatWatcher { store, incidents, notifier, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep(),
                _ = shutdown.changed() => {
                    info!("heartbeat watcher: stopped");
                    return;
                }
            }
        }
    }

    /// One pass over expired heartbeats.
    pub fn sweep(&self) {
        let expired = match self.store.list_expired_heartbeats(now_unix()) {
            Ok(list) => list,
            Err(e) => {
                warn!("heartbeat watcher: listing failed: {e}");
                return;
            }
        };
        for heartbeat in expired {
            if let Err(e) = self.handle_expired(&heartbeat.monitor_id, heartbeat.status) {
                warn!("heartbeat watcher: {} failed: {e}", heartbeat.monitor_id);
            }
        }
    }

    fn handle_expired(&self, monitor_id: &str, current: Status) -> crate::Result<()> {
        let monitor = self.store.get_monitor(monitor_id)?;
        let in_maintenance = self
            .store
            .is_monitor_in_maintenance(monitor_id, &now_iso())
            .unwrap_or(false);

        if current == Status::Down {
            // Already failed; only reminders are left to consider.
            if let Some(incident) = self.incidents.maybe_remind(&monitor)? {
                if !in_maintenance {
                    self.notifier.emit_incident(EventType::IncidentReminder, &monitor, &incident);
                }
            }
            return Ok(());
        }

        self.store.update_heartbeat_status(monitor_id, Status::Down)?;

        // Force the failure threshold so the incident opens on this sweep.
        let mut status = self
            .store
            .get_monitor_status(monitor_id)?
            .unwrap_or_else(|| MonitorStatus::new(monitor_id));
        status.status = Status::Down;
        status.last_check_at = Some(now_iso());
        status.consec_fails = monitor.failure_threshold;
        status.consec_successes = 0;
        self.store.upsert_monitor_status(&status)?;

        let (incident, created) =
            self.incidents
                .process_failure(monitor_id, &monitor.name, "heartbeat missed")?;
        info!("heartbeat missed for {}", monitor.name);
        if created && !in_maintenance {
            self.notifier.emit_incident(EventType::IncidentCreated, &monitor, &incident);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Monitor, MonitorKind};

    fn heartbeat_monitor(id: &str, interval: u32) -> Monitor {
        Monitor {
            id: id.into(),
            name: format!("hb-{id}"),
            description: None,
            kind: MonitorKind::Heartbeat,
            target: String::new(),
            settings: serde_json::Value::Null,
            interval_seconds: interval,
            timeout_seconds: 10,
            enabled: true,
            failure_threshold: 3,
            success_threshold: 1,
            resend_interval_seconds: 0,
            track_changes: false,
            upside_down: false,
            group_id: None,
            proxy_id: None,
            assertions: None,
            tags: vec![],
            proxy_url: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn watcher(store: Arc<Store>) -> (HeartbeatWatcher, tokio::sync::mpsc::Receiver<crate::models::NotificationEvent>) {
        let incidents = IncidentManager::new(store.clone());
        let (notifier, rx) = Notifier::channel();
        (
            HeartbeatWatcher::new(store, incidents, notifier, Duration::from_secs(30)),
            rx,
        )
    }

    #[tokio::test]
    async fn missed_ping_opens_incident_at_threshold() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_monitor(&heartbeat_monitor("hb1", 60)).unwrap();
        // Backdate the last ping beyond the expected interval.
        store.record_heartbeat_ping("hb1", now_unix() - 120).unwrap();

        let (watcher, mut events) = watcher(store.clone());
        watcher.sweep();

        let hb = store.get_heartbeat("hb1").unwrap().unwrap();
        assert_eq!(hb.status, Status::Down);

        let status = store.get_monitor_status("hb1").unwrap().unwrap();
        assert_eq!(status.status, Status::Down);
        assert_eq!(status.consec_fails, 3);

        let incident = store.open_incident("hb1").unwrap().unwrap();
        assert_eq!(incident.cause, "heartbeat missed");

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::IncidentCreated);
    }

    #[tokio::test]
    async fn second_sweep_does_not_duplicate_incident() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_monitor(&heartbeat_monitor("hb1", 60)).unwrap();
        store.record_heartbeat_ping("hb1", now_unix() - 120).unwrap();

        let (watcher, mut events) = watcher(store.clone());
        watcher.sweep();
        watcher.sweep();

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
        let open = store.open_incident("hb1").unwrap().unwrap();
        let incident_events = store.list_incident_events(&open.id).unwrap();
        assert_eq!(incident_events.len(), 1); // created only, no check_failed spam
    }

    #[tokio::test]
    async fn healthy_heartbeat_untouched() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_monitor(&heartbeat_monitor("hb1", 3600)).unwrap();
        let (watcher, mut events) = watcher(store.clone());
        watcher.sweep();
        assert!(events.try_recv().is_err());
        assert_eq!(store.get_heartbeat("hb1").unwrap().unwrap().status, Status::Up);
    }
}
