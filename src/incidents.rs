use crate::db::Store;
use crate::error::{Error, Result};
use crate::models::{now_iso, Incident, IncidentEventType, IncidentStatus, Monitor};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Incident lifecycle: open → acknowledged → resolved (open → resolved
/// allowed). All durable state lives in the store; the manager only keeps
/// the in-process reminder clock.
pub struct IncidentManager {
    store: Arc<Store>,
    /// incident id → last reminder instant.
    reminders: Mutex<HashMap<String, Instant>>,
}

impl IncidentManager {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(IncidentManager { store, reminders: Mutex::new(HashMap::new()) })
    }

    /// Record a failed check. Returns the incident and whether this call
    /// created it. At most one non-resolved incident exists per monitor.
    pub fn process_failure(
        &self,
        monitor_id: &str,
        monitor_name: &str,
        cause: &str,
    ) -> Result<(Incident, bool)> {
        if let Some(incident) = self.store.open_incident(monitor_id)? {
            self.store
                .insert_incident_event(&incident.id, IncidentEventType::CheckFailed, cause)?;
            return Ok((incident, false));
        }
        let incident = self.store.create_incident(monitor_id, monitor_name, cause)?;
        self.store.insert_incident_event(
            &incident.id,
            IncidentEventType::Created,
            &format!("Incident created: {cause}"),
        )?;
        info!("incident opened for {monitor_name}: {cause}");
        Ok((incident, true))
    }

    /// Auto-resolve the open incident after a recovery burst. Returns the
    /// resolved incident, or None when nothing was open.
    pub fn process_recovery(&self, monitor_id: &str) -> Result<Option<Incident>> {
        let Some(mut incident) = self.store.open_incident(monitor_id)? else {
            return Ok(None);
        };
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now_iso());
        incident.resolved_by = Some("auto".to_string());
        self.store.update_incident(&incident)?;
        self.store.insert_incident_event(
            &incident.id,
            IncidentEventType::CheckRecovered,
            "Monitor recovered",
        )?;
        self.reminders.lock().unwrap().remove(&incident.id);
        info!("incident resolved for {}", incident.monitor_name);
        Ok(Some(incident))
    }

    /// Manual acknowledgement from the UI collaborator.
    pub fn acknowledge(&self, incident_id: &str, by: &str, note: Option<&str>) -> Result<Incident> {
        let mut incident = self.store.get_incident(incident_id)?;
        if incident.status == IncidentStatus::Resolved {
            return Err(Error::Conflict(format!(
                "incident {incident_id} is already resolved"
            )));
        }
        incident.status = IncidentStatus::Acknowledged;
        incident.acknowledged_at = Some(now_iso());
        incident.acknowledged_by = Some(by.to_string());
        self.store.update_incident(&incident)?;
        let message = match note {
            Some(n) => format!("Acknowledged by {by}: {n}"),
            None => format!("Acknowledged by {by}"),
        };
        self.store
            .insert_incident_event(&incident.id, IncidentEventType::Acknowledged, &message)?;
        Ok(incident)
    }

    /// Manual resolve from the UI collaborator.
    pub fn resolve(&self, incident_id: &str, by: &str) -> Result<Incident> {
        let mut incident = self.store.get_incident(incident_id)?;
        if incident.status == IncidentStatus::Resolved {
            return Ok(incident);
        }
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now_iso());
        incident.resolved_by = Some(by.to_string());
        self.store.update_incident(&incident)?;
        self.store.insert_incident_event(
            &incident.id,
            IncidentEventType::Resolved,
            &format!("Resolved by {by}"),
        )?;
        self.reminders.lock().unwrap().remove(&incident.id);
        Ok(incident)
    }

    /// Reminder gate: at most one reminder per resend interval while the
    /// incident stays open and unacknowledged. Returns the incident when
    /// a reminder is due now.
    pub fn maybe_remind(&self, monitor: &Monitor) -> Result<Option<Incident>> {
        if monitor.resend_interval_seconds == 0 {
            return Ok(None);
        }
        let Some(incident) = self.store.open_incident(&monitor.id)? else {
            return Ok(None);
        };
        if incident.status == IncidentStatus::Acknowledged {
            return Ok(None);
        }
        let interval = Duration::from_secs(monitor.resend_interval_seconds as u64);
        let mut reminders = self.reminders.lock().unwrap();
        let due = match reminders.get(&incident.id) {
            Some(last) => last.elapsed() >= interval,
            // No reminder sent yet: wait a full interval from creation so
            // the reminder doesn't double up with incident.created.
            None => incident_age(&incident) >= interval,
        };
        if !due {
            return Ok(None);
        }
        reminders.insert(incident.id.clone(), Instant::now());
        Ok(Some(incident))
    }
}

fn incident_age(incident: &Incident) -> Duration {
    let formats = ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d %H:%M:%S"];
    for fmt in formats {
        if let Ok(created) = NaiveDateTime::parse_from_str(&incident.created_at, fmt) {
            let age = chrono::Utc::now().naive_utc() - created;
            return age.to_std().unwrap_or(Duration::ZERO);
        }
    }
    Duration::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MonitorKind;

    fn store_with_monitor(resend: u32) -> (Arc<Store>, Monitor) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let monitor = Monitor {
            id: "m1".into(),
            name: "api".into(),
            description: None,
            kind: MonitorKind::Http,
            target: "https://example.com".into(),
            settings: serde_json::Value::Null,
            interval_seconds: 60,
            timeout_seconds: 10,
            enabled: true,
            failure_threshold: 1,
            success_threshold: 1,
            resend_interval_seconds: resend,
            track_changes: false,
            upside_down: false,
            group_id: None,
            proxy_id: None,
            assertions: None,
            tags: vec![],
            proxy_url: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        store.insert_monitor(&monitor).unwrap();
        (store, monitor)
    }

    #[test]
    fn failure_creates_once_then_appends() {
        let (store, _) = store_with_monitor(0);
        let manager = IncidentManager::new(store.clone());

        let (incident, created) = manager.process_failure("m1", "api", "500 response").unwrap();
        assert!(created);
        assert_eq!(incident.status, IncidentStatus::Open);
        assert!(incident.cause.contains("500"));

        let (again, created) = manager.process_failure("m1", "api", "still failing").unwrap();
        assert!(!created);
        assert_eq!(again.id, incident.id);

        let events = store.list_incident_events(&incident.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "created");
        assert_eq!(events[1].event_type, "check_failed");
    }

    #[test]
    fn recovery_resolves_and_is_idempotent() {
        let (store, _) = store_with_monitor(0);
        let manager = IncidentManager::new(store.clone());
        let (incident, _) = manager.process_failure("m1", "api", "down").unwrap();

        let resolved = manager.process_recovery("m1").unwrap().unwrap();
        assert_eq!(resolved.id, incident.id);
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("auto"));

        assert!(manager.process_recovery("m1").unwrap().is_none());
        assert!(store.open_incident("m1").unwrap().is_none());
    }

    #[test]
    fn at_most_one_open_incident_per_monitor() {
        let (store, _) = store_with_monitor(0);
        let manager = IncidentManager::new(store.clone());
        for _ in 0..5 {
            manager.process_failure("m1", "api", "down").unwrap();
        }
        let open = store.open_incident("m1").unwrap().unwrap();
        let events = store.list_incident_events(&open.id).unwrap();
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn acknowledge_blocks_reminders() {
        let (store, mut monitor) = store_with_monitor(1);
        monitor.resend_interval_seconds = 1;
        let manager = IncidentManager::new(store.clone());
        let (incident, _) = manager.process_failure("m1", "api", "down").unwrap();

        manager.acknowledge(&incident.id, "oncall", Some("looking")).unwrap();
        let acked = store.get_incident(&incident.id).unwrap();
        assert_eq!(acked.status, IncidentStatus::Acknowledged);
        assert!(manager.maybe_remind(&monitor).unwrap().is_none());
    }

    #[test]
    fn reminder_respects_resend_interval() {
        let (store, mut monitor) = store_with_monitor(3600);
        monitor.resend_interval_seconds = 3600;
        let manager = IncidentManager::new(store);
        manager.process_failure("m1", "api", "down").unwrap();
        // Fresh incident: a full interval has not elapsed yet.
        assert!(manager.maybe_remind(&monitor).unwrap().is_none());
    }

    #[test]
    fn reminder_disabled_when_resend_zero() {
        let (store, monitor) = store_with_monitor(0);
        let manager = IncidentManager::new(store);
        manager.process_failure("m1", "api", "down").unwrap();
        assert!(manager.maybe_remind(&monitor).unwrap().is_none());
    }

    #[test]
    fn manual_resolve_from_open() {
        let (store, _) = store_with_monitor(0);
        let manager = IncidentManager::new(store.clone());
        let (incident, _) = manager.process_failure("m1", "api", "down").unwrap();
        let resolved = manager.resolve(&incident.id, "oncall").unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("oncall"));
        assert!(store.open_incident("m1").unwrap().is_none());
    }

}
