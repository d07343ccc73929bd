use crate::config::Config;
use crate::db::Store;
use crate::error::Result;
use crate::heartbeat::HeartbeatWatcher;
use crate::incidents::IncidentManager;
use crate::models::{now_unix, NotificationEvent, Status, WorkerResult};
use crate::notify::Notifier;
use crate::pool;
use crate::processor::{heartbeat_recovery_outcome, Processor};
use crate::registry;
use crate::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Wires the probe pipeline together:
/// store → scheduler → jobs → workers → results → processor.
pub struct Pipeline;

impl Pipeline {
    /// Start every background task. The returned receiver carries
    /// notification events for the external notifier.
    pub fn start(cfg: &Config, store: Arc<Store>) -> (PipelineHandle, mpsc::Receiver<NotificationEvent>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel_depth = (cfg.workers * 2).max(2);
        let (jobs_tx, jobs_rx) = mpsc::channel(channel_depth);
        let (results_tx, results_rx) = mpsc::channel(channel_depth);
        let (notifier, notify_rx) = Notifier::channel();

        let registry = registry::default_registry(cfg);
        let scheduler = Scheduler::new(store.clone(), jobs_tx);
        let incidents = IncidentManager::new(store.clone());

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(scheduler.clone().run(shutdown_rx.clone())));
        tasks.extend(pool::spawn_workers(
            cfg.workers,
            registry,
            jobs_rx,
            results_tx.clone(),
            shutdown_rx.clone(),
        ));

        let processor = Processor::new(
            store.clone(),
            scheduler.clone(),
            incidents.clone(),
            notifier.clone(),
            cfg.adaptive_intervals,
        );
        tasks.push(tokio::spawn(processor.run(results_rx, shutdown_rx.clone())));

        let watcher = HeartbeatWatcher::new(
            store.clone(),
            incidents.clone(),
            notifier.clone(),
            cfg.heartbeat_check_interval,
        );
        tasks.push(tokio::spawn(watcher.run(shutdown_rx.clone())));

        tasks.push(tokio::spawn(crate::retention::run(store.clone(), cfg.clone(), shutdown_rx)));

        info!("pipeline started with {} workers", cfg.workers);
        let handle = PipelineHandle {
            store,
            scheduler,
            incidents,
            notifier,
            results_tx,
            shutdown: shutdown_tx,
            tasks,
            grace: cfg.shutdown_grace,
        };
        (handle, notify_rx)
    }
}

/// Control surface for the running pipeline, consumed by the binary and
/// the UI collaborator.
pub struct PipelineHandle {
    store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub incidents: Arc<IncidentManager>,
    notifier: Arc<Notifier>,
    results_tx: mpsc::Sender<WorkerResult>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    grace: Duration,
}

impl PipelineHandle {
    /// Ask the scheduler to diff-reload monitors from the store.
    pub fn trigger_reload(&self) {
        self.scheduler.trigger_reload();
    }

    /// Entry point for the external Ping endpoint. Updates the ping
    /// clock; a ping for a down heartbeat feeds a synthetic up result
    /// through the normal processor path.
    pub async fn record_heartbeat_ping(&self, monitor_id: &str) -> Result<()> {
        let previous = self.store.record_heartbeat_ping(monitor_id, now_unix())?;
        if previous == Status::Down {
            let monitor = self.store.get_monitor(monitor_id)?;
            let result = WorkerResult {
                monitor: Arc::new(monitor),
                outcome: heartbeat_recovery_outcome(),
            };
            if self.results_tx.send(result).await.is_err() {
                warn!("heartbeat recovery for {monitor_id} dropped: processor gone");
            }
        }
        Ok(())
    }

    pub fn dropped_jobs(&self) -> u64 {
        self.scheduler.dropped_jobs()
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.notifier.dropped()
    }

    /// Cooperative shutdown bounded by the configured grace; stragglers
    /// are aborted once the grace runs out.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.grace;
        let mut aborted = 0usize;
        for task in &mut self.tasks {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!("shutdown grace of {:?} exceeded, aborted {aborted} tasks", self.grace);
        }
        info!("pipeline stopped");
    }
}
