use crate::db::Store;
use crate::error::Result;
use crate::models::{Job, Monitor, MonitorKind};
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

struct Entry {
    monitor: Arc<Monitor>,
    effective_interval: Duration,
}

struct State {
    /// Min-heap on next-run time (nanos since scheduler start).
    queue: PriorityQueue<String, Reverse<i64>>,
    entries: HashMap<String, Entry>,
}

/// Decides which monitors to probe and when. Owns per-monitor scheduling
/// metadata in memory; the store stays the source of truth for monitor
/// config.
pub struct Scheduler {
    store: Arc<Store>,
    jobs: mpsc::Sender<Job>,
    state: Mutex<State>,
    reload: Notify,
    dropped_jobs: AtomicU64,
    epoch: Instant,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, jobs: mpsc::Sender<Job>) -> Arc<Self> {
        Arc::new(Scheduler {
            store,
            jobs,
            state: Mutex::new(State { queue: PriorityQueue::new(), entries: HashMap::new() }),
            reload: Notify::new(),
            dropped_jobs: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    fn now_nanos(&self) -> i64 {
        self.epoch.elapsed().as_nanos().min(i64::MAX as u128) as i64
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.reload_monitors() {
            warn!("scheduler: initial load failed: {e}");
        }
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.dispatch_due(),
                _ = self.reload.notified() => {
                    if let Err(e) = self.reload_monitors() {
                        warn!("scheduler: reload failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler: stopped");
                    return;
                }
            }
        }
    }

    /// Non-blocking signal; the scheduler diff-reloads on its next pass.
    pub fn trigger_reload(&self) {
        self.reload.notify_one();
    }

    fn dispatch_due(&self) {
        let now = self.now_nanos();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        loop {
            let id = match state.queue.peek() {
                Some((id, Reverse(next_run))) if *next_run <= now => id.clone(),
                _ => break,
            };
            state.queue.pop();
            let Some(entry) = state.entries.get(&id) else { continue };
            let next = now + entry.effective_interval.as_nanos().min(i64::MAX as u128) as i64;
            // Heartbeat monitors keep their scheduling slot but are never
            // dispatched; the watcher covers them.
            if entry.monitor.kind != MonitorKind::Heartbeat {
                match self.jobs.try_send(Job { monitor: entry.monitor.clone() }) {
                    Ok(()) => debug!("scheduler: dispatched {}", entry.monitor.name),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = self.dropped_jobs.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!("scheduler: jobs channel full, dropped check for {} ({dropped} total)", entry.monitor.name);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
            state.queue.push(id, Reverse(next));
        }
    }

    /// Diff the heap against the store's enabled monitors: add new ones
    /// due immediately, drop disabled/deleted ones, refresh config on the
    /// rest while keeping their effective interval and next run.
    pub fn reload_monitors(&self) -> Result<()> {
        let mut monitors = self.store.all_enabled_monitors()?;

        // Resolve proxies in one batch per reload.
        let proxy_ids: Vec<String> = monitors
            .iter()
            .filter_map(|m| m.proxy_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let proxies = self.store.get_proxies(&proxy_ids)?;
        for monitor in &mut monitors {
            monitor.proxy_url = monitor
                .proxy_id
                .as_ref()
                .and_then(|id| proxies.get(id))
                .map(|p| p.url());
        }

        let now = self.now_nanos();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let mut seen = HashSet::with_capacity(monitors.len());
        let mut added = 0usize;
        for monitor in monitors {
            seen.insert(monitor.id.clone());
            let base = Duration::from_secs(monitor.interval_seconds as u64);
            match state.entries.get_mut(&monitor.id) {
                Some(entry) => {
                    entry.monitor = Arc::new(monitor);
                }
                None => {
                    state.queue.push(monitor.id.clone(), Reverse(now));
                    state.entries.insert(
                        monitor.id.clone(),
                        Entry { monitor: Arc::new(monitor), effective_interval: base },
                    );
                    added += 1;
                }
            }
        }
        let stale: Vec<String> = state
            .entries
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            state.queue.remove(id);
            state.entries.remove(id);
        }
        info!(
            "scheduler: reloaded, {} scheduled ({added} added, {} removed)",
            state.entries.len(),
            stale.len()
        );
        Ok(())
    }

    /// Store a new effective interval; when it actually changes, the heap
    /// entry is re-timed to run the new interval from now.
    pub fn update_interval(&self, monitor_id: &str, interval: Duration) {
        let now = self.now_nanos();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(entry) = state.entries.get_mut(monitor_id) else { return };
        if entry.effective_interval == interval {
            return;
        }
        entry.effective_interval = interval;
        let next = now + interval.as_nanos().min(i64::MAX as u128) as i64;
        state.queue.change_priority(monitor_id, Reverse(next));
        debug!("scheduler: interval for {monitor_id} now {}s", interval.as_secs());
    }

    pub fn effective_interval(&self, monitor_id: &str) -> Option<Duration> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(monitor_id)
            .map(|e| e.effective_interval)
    }

    pub fn scheduled_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn dropped_jobs(&self) -> u64 {
        self.dropped_jobs.load(Ordering::Relaxed)
    }
}
