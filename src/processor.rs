use crate::adaptive;
use crate::assertions::{self, AssertionInput};
use crate::db::Store;
use crate::diffing;
use crate::incidents::IncidentManager;
use crate::models::{
    now_iso, now_unix, CheckOutcome, EventType, Monitor, MonitorStatus, Status, WorkerResult,
};
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Single consumer of worker results. Being the only writer of
/// per-monitor counters serializes status transitions without
/// per-monitor locks.
pub struct Processor {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    incidents: Arc<IncidentManager>,
    notifier: Arc<Notifier>,
    adaptive_intervals: bool,
    multipliers: HashMap<String, f64>,
}

impl Processor {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        incidents: Arc<IncidentManager>,
        notifier: Arc<Notifier>,
        adaptive_intervals: bool,
    ) -> Self {
        Processor {
            store,
            scheduler,
            incidents,
            notifier,
            adaptive_intervals,
            multipliers: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut results: mpsc::Receiver<WorkerResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = results.recv() => {
                    let Some(WorkerResult { monitor, outcome }) = result else {
                        info!("processor: results channel closed");
                        return;
                    };
                    self.handle(&monitor, outcome);
                }
                _ = shutdown.changed() => {
                    info!("processor: stopped");
                    return;
                }
            }
        }
    }

    /// Full result pipeline for one check: assertions, inversion,
    /// persistence, counters, content changes, adaptive interval,
    /// incident transitions.
    pub fn handle(&mut self, monitor: &Monitor, mut outcome: CheckOutcome) {
        // Assertions may demote a nominally healthy result.
        if let Some(raw) = &monitor.assertions {
            let input = AssertionInput {
                status_code: outcome.status_code,
                body: outcome.body.as_deref().unwrap_or(""),
                headers: outcome.headers.as_ref(),
                response_time_ms: outcome.response_time_ms,
                cert_expiry: outcome.cert_expiry,
                dns_records: outcome.dns_records.as_deref(),
                now_unix: now_unix(),
            };
            let eval = assertions::evaluate(raw, &input);
            if !eval.pass {
                let demoted = if eval.degraded { Status::Degraded } else { Status::Down };
                if severity(demoted) > severity(outcome.status) {
                    outcome.status = demoted;
                }
                if let Some(msg) = eval.message {
                    outcome.message = Some(match outcome.message.take() {
                        Some(existing) => format!("{existing}; {msg}"),
                        None => msg,
                    });
                }
            }
        }

        // Upside-down monitors treat reachability as the failure.
        if monitor.upside_down {
            match outcome.status {
                Status::Up => outcome.status = Status::Down,
                Status::Down => {
                    outcome.status = Status::Up;
                    outcome.message = None;
                }
                Status::Degraded => {}
            }
        }

        // The previous body has to be read before this check is persisted.
        let previous_body = if monitor.track_changes && outcome.body_hash.is_some() {
            match self.store.latest_check_result(&monitor.id) {
                Ok(prev) => prev.and_then(|r| r.body),
                Err(e) => {
                    warn!("processor: previous body lookup failed for {}: {e}", monitor.name);
                    None
                }
            }
        } else {
            None
        };

        if let Err(e) = self.store.insert_check_result(&monitor.id, &outcome) {
            // The raw row is droppable; state transitions below are not.
            warn!("processor: check result insert failed for {}: {e}", monitor.name);
        }

        let mut status = match self.store.get_monitor_status(&monitor.id) {
            Ok(Some(s)) => s,
            Ok(None) => MonitorStatus::new(&monitor.id),
            Err(e) => {
                warn!("processor: status load failed for {}: {e}", monitor.name);
                return;
            }
        };
        status.status = outcome.status;
        status.last_check_at = Some(now_iso());
        if outcome.status == Status::Up {
            status.consec_successes += 1;
            status.consec_fails = 0;
        } else {
            status.consec_fails += 1;
            status.consec_successes = 0;
        }

        if monitor.track_changes {
            if let Some(new_hash) = outcome.body_hash.clone().filter(|h| !h.is_empty()) {
                let old_hash = status.last_body_hash.clone().unwrap_or_default();
                if !old_hash.is_empty() && old_hash != new_hash {
                    let old_body = previous_body.unwrap_or_default();
                    let new_body = outcome.body.clone().unwrap_or_default();
                    let diff = diffing::unified(&old_body, &new_body);
                    match self.store.insert_content_change(&monitor.id, &old_hash, &new_hash, &diff) {
                        Ok(change) => {
                            info!("content change on {}", monitor.name);
                            self.notifier.emit_content_change(monitor, &change);
                        }
                        Err(e) => warn!("processor: content change insert failed: {e}"),
                    }
                }
                status.last_body_hash = Some(new_hash);
            }
        }

        if let Err(e) = self.store.upsert_monitor_status(&status) {
            warn!("processor: status persist failed for {}: {e}", monitor.name);
            return;
        }

        if self.adaptive_intervals {
            let prev = self.multipliers.get(&monitor.id).copied().unwrap_or(1.0);
            let next = adaptive::next_multiplier(status.consec_successes, status.consec_fails, prev);
            self.multipliers.insert(monitor.id.to_string(), next);
            let base = Duration::from_secs(monitor.interval_seconds as u64);
            self.scheduler
                .update_interval(&monitor.id, adaptive::effective_interval(base, next));
        }

        self.apply_incident_transitions(monitor, &status, &outcome);
    }

    fn apply_incident_transitions(
        &self,
        monitor: &Monitor,
        status: &MonitorStatus,
        outcome: &CheckOutcome,
    ) {
        let in_maintenance = self
            .store
            .is_monitor_in_maintenance(&monitor.id, &now_iso())
            .unwrap_or(false);

        if status.status != Status::Up && status.consec_fails >= monitor.failure_threshold {
            let cause = outcome
                .message
                .clone()
                .unwrap_or_else(|| format!("monitor is {}", status.status.as_str()));
            match self.incidents.process_failure(&monitor.id, &monitor.name, &cause) {
                Ok((incident, created)) => {
                    if created && !in_maintenance {
                        self.notifier.emit_incident(EventType::IncidentCreated, monitor, &incident);
                    } else if created {
                        debug!("maintenance window suppressed incident.created for {}", monitor.name);
                    }
                }
                Err(e) => warn!("processor: incident open failed for {}: {e}", monitor.name),
            }
            match self.incidents.maybe_remind(monitor) {
                Ok(Some(incident)) => {
                    if !in_maintenance {
                        self.notifier.emit_incident(EventType::IncidentReminder, monitor, &incident);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("processor: reminder check failed for {}: {e}", monitor.name),
            }
        } else if status.status == Status::Up && status.consec_successes >= monitor.success_threshold {
            match self.incidents.process_recovery(&monitor.id) {
                Ok(Some(incident)) => {
                    if !in_maintenance {
                        self.notifier.emit_incident(EventType::IncidentResolved, monitor, &incident);
                    } else {
                        debug!("maintenance window suppressed incident.resolved for {}", monitor.name);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("processor: incident resolve failed for {}: {e}", monitor.name),
            }
        }
    }
}

fn severity(status: Status) -> u8 {
    match status {
        Status::Up => 0,
        Status::Degraded => 1,
        Status::Down => 2,
    }
}

/// Synthetic up-result fed through the normal result path when a ping
/// arrives for a heartbeat monitor that was marked down.
pub fn heartbeat_recovery_outcome() -> CheckOutcome {
    CheckOutcome {
        message: Some("heartbeat received".to_string()),
        ..CheckOutcome::up(0)
    }
}
