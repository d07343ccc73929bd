use crate::models::{now_iso, ContentChange, EventType, Incident, Monitor, NotificationEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const NOTIFY_CAPACITY: usize = 100;

/// Emission side of the notification fan-out contract. Delivery is an
/// external collaborator reading the receiver; emission never blocks the
/// pipeline, a full channel drops the event and counts it.
pub struct Notifier {
    tx: mpsc::Sender<NotificationEvent>,
    dropped: AtomicU64,
}

impl Notifier {
    pub fn channel() -> (Arc<Notifier>, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        (Arc::new(Notifier { tx, dropped: AtomicU64::new(0) }), rx)
    }

    pub fn emit(&self, event: NotificationEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "notify channel full, dropped {} for monitor {} ({dropped} total)",
                    event.event_type.as_str(),
                    event.monitor_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!("notify channel closed, discarding {}", event.event_type.as_str());
            }
        }
    }

    pub fn emit_incident(&self, event_type: EventType, monitor: &Monitor, incident: &Incident) {
        self.emit(NotificationEvent {
            event_type,
            monitor_id: monitor.id.clone(),
            monitor: Some(monitor.clone()),
            incident: Some(incident.clone()),
            change: None,
            timestamp: now_iso(),
        });
    }

    pub fn emit_content_change(&self, monitor: &Monitor, change: &ContentChange) {
        self.emit(NotificationEvent {
            event_type: EventType::ContentChanged,
            monitor_id: monitor.id.clone(),
            monitor: Some(monitor.clone()),
            incident: None,
            change: Some(change.clone()),
            timestamp: now_iso(),
        });
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent {
            event_type: EventType::IncidentCreated,
            monitor_id: "m1".into(),
            monitor: None,
            incident: None,
            change: None,
            timestamp: now_iso(),
        }
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let (notifier, mut rx) = Notifier::channel();
        for _ in 0..NOTIFY_CAPACITY {
            notifier.emit(event());
        }
        assert_eq!(notifier.dropped(), 0);
        notifier.emit(event());
        assert_eq!(notifier.dropped(), 1);
        // Draining frees capacity again.
        let _ = rx.recv().await.unwrap();
        notifier.emit(event());
        assert_eq!(notifier.dropped(), 1);
    }
}
