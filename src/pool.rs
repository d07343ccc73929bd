use crate::models::{CheckOutcome, Job, Monitor, WorkerResult};
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Fixed pool of probe workers. Workers hold no state; the pool exists
/// purely so slow probes overlap.
pub fn spawn_workers(
    count: usize,
    registry: Arc<Registry>,
    jobs: mpsc::Receiver<Job>,
    results: mpsc::Sender<WorkerResult>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let jobs = Arc::new(Mutex::new(jobs));
    (0..count.max(1))
        .map(|n| {
            let registry = registry.clone();
            let jobs = jobs.clone();
            let results = results.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(worker(n, registry, jobs, results, shutdown))
        })
        .collect()
}

async fn worker(
    n: usize,
    registry: Arc<Registry>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<WorkerResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.changed() => None,
            }
        };
        let Some(job) = job else {
            info!("worker {n}: stopped");
            return;
        };
        let outcome = run_check(&registry, &job.monitor).await;
        if results.send(WorkerResult { monitor: job.monitor, outcome }).await.is_err() {
            return;
        }
    }
}

/// Run one check under the monitor's deadline. Registry misses, timeouts
/// and panics all fold into a down outcome here so the processor only
/// ever sees results.
async fn run_check(registry: &Registry, monitor: &Arc<Monitor>) -> CheckOutcome {
    let checker = match registry.get(monitor.kind) {
        Ok(c) => c,
        Err(e) => return CheckOutcome::down(0, e.to_string()),
    };
    let timeout = Duration::from_secs(monitor.timeout_seconds as u64);
    let m = monitor.clone();
    // A separate task keeps a panicking checker from taking the worker out.
    let mut handle = tokio::spawn(async move { checker.check(&m).await });
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => {
            warn!("check for {} crashed: {join_err}", monitor.name);
            CheckOutcome::down(0, "internal error")
        }
        Err(_) => {
            handle.abort();
            CheckOutcome::down(
                (timeout.as_millis()).min(u32::MAX as u128) as u32,
                format!("check timed out after {}s", monitor.timeout_seconds),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitorKind, Status};
    use crate::registry::Checker;
    use async_trait::async_trait;

    struct PanicChecker;

    #[async_trait]
    impl Checker for PanicChecker {
        fn kind(&self) -> MonitorKind {
            MonitorKind::Tcp
        }
        async fn check(&self, _monitor: &Monitor) -> CheckOutcome {
            panic!("malformed input");
        }
    }

    struct SlowChecker;

    #[async_trait]
    impl Checker for SlowChecker {
        fn kind(&self) -> MonitorKind {
            MonitorKind::Tcp
        }
        async fn check(&self, _monitor: &Monitor) -> CheckOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            CheckOutcome::up(0)
        }
    }

    fn tcp_monitor() -> Arc<Monitor> {
        Arc::new(Monitor {
            id: "m1".into(),
            name: "m1".into(),
            description: None,
            kind: MonitorKind::Tcp,
            target: "example.com:80".into(),
            settings: serde_json::Value::Null,
            interval_seconds: 60,
            timeout_seconds: 1,
            enabled: true,
            failure_threshold: 1,
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
        })
    }

    #[tokio::test]
    async fn missing_checker_becomes_down_result() {
        let registry = Registry::new();
        let outcome = run_check(&registry, &tcp_monitor()).await;
        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.message.unwrap().contains("no checker registered"));
    }

    #[tokio::test]
    async fn panic_never_escapes_the_worker() {
        let registry = Registry::new();
        registry.register(Arc::new(PanicChecker));
        let outcome = run_check(&registry, &tcp_monitor()).await;
        assert_eq!(outcome.status, Status::Down);
        assert_eq!(outcome.message.as_deref(), Some("internal error"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_times_out() {
        let registry = Registry::new();
        registry.register(Arc::new(SlowChecker));
        let outcome = run_check(&registry, &tcp_monitor()).await;
        assert_eq!(outcome.status, Status::Down);
        assert!(outcome.message.unwrap().contains("timed out"));
    }
}
