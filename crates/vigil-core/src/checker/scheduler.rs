//! Periodic task fan-out onto a bounded worker pool.
//!
//! Three independent cadences: internal node checks every 30 s (aligned with
//! block time), external ring discovery every 10 s, and recovery + aggregate
//! metrics every 10 s. The scheduler never executes probes itself — each one
//! is submitted to a semaphore-bounded pool, and submission is non-blocking:
//! when the pool is saturated the tick's work is dropped and counted rather
//! than queued without bound. A panicking probe takes down only its own task;
//! its permit is released on unwind.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ApiChecker, Checker, ExternalChecker, GrpcChecker, RpcChecker};
use crate::config::ConfigHandle;
use crate::metrics;
use crate::storage::{ExternalEndpointStore, HeightStore};
use crate::types::Protocol;

/// Default worker pool size.
pub const DEFAULT_POOL_SIZE: usize = 100;

const INTERNAL_INTERVAL: Duration = Duration::from_secs(30);
const EXTERNAL_INTERVAL: Duration = Duration::from_secs(10);
const RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the checkers on fixed cadences.
pub struct Scheduler {
    config: Arc<ConfigHandle>,
    pool: Arc<Semaphore>,
    checkers: Vec<Arc<Checker>>,
    external: Arc<ExternalChecker>,
}

impl Scheduler {
    /// Builds the scheduler and its checkers.
    pub fn new(
        heights: Arc<HeightStore>,
        endpoints: Arc<ExternalEndpointStore>,
        config: Arc<ConfigHandle>,
    ) -> Result<Self, reqwest::Error> {
        let checkers = vec![
            Arc::new(Checker::Api(ApiChecker::new(heights.clone())?)),
            Arc::new(Checker::Rpc(RpcChecker::new(heights.clone())?)),
            Arc::new(Checker::Grpc(GrpcChecker::new(heights))),
        ];
        let external = Arc::new(ExternalChecker::new(endpoints)?);

        Ok(Self { config, pool: Arc::new(Semaphore::new(DEFAULT_POOL_SIZE)), checkers, external })
    }

    /// Spawns the three periodic loops. Each loop exits when the shutdown
    /// channel fires; in-flight probes abort at their next await point via
    /// their own deadlines.
    #[must_use]
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            pool_size = DEFAULT_POOL_SIZE,
            internal_interval_secs = INTERNAL_INTERVAL.as_secs(),
            external_interval_secs = EXTERNAL_INTERVAL.as_secs(),
            "scheduler started"
        );

        vec![
            self.spawn_loop(INTERNAL_INTERVAL, shutdown.subscribe(), |s| s.check_internal_nodes()),
            self.spawn_loop(EXTERNAL_INTERVAL, shutdown.subscribe(), |s| s.check_external_rings()),
            self.spawn_loop(RECOVERY_INTERVAL, shutdown.subscribe(), |s| s.recover_and_aggregate()),
        ]
    }

    fn spawn_loop<F>(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Scheduler>) + Send + Sync + 'static,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => tick(Arc::clone(&scheduler)),
                }
            }
        })
    }

    /// One internal tick: a probe per enabled protocol per configured node.
    fn check_internal_nodes(self: Arc<Self>) {
        let cfg = self.config.snapshot();
        let timeout = cfg.health_check_timeout();

        for node in &cfg.internals {
            for checker in &self.checkers {
                let protocol = checker.protocol();
                if !cfg.protocol_enabled(protocol) || node.endpoint(protocol).is_empty() {
                    continue;
                }

                let checker = Arc::clone(checker);
                let node = node.clone();
                try_dispatch(&self.pool, "internal", async move {
                    if let Err(e) = checker.check(&node, timeout).await {
                        tracing::debug!(
                            node = %node.name,
                            protocol = %protocol,
                            error = %e,
                            "internal check failed"
                        );
                    }
                });
            }
        }
    }

    /// One discovery tick: a probe per peer per monitored network.
    fn check_external_rings(self: Arc<Self>) {
        let cfg = self.config.snapshot();
        let timeout = cfg.health_check_timeout();

        for external in &cfg.externals {
            for network in cfg.all_networks() {
                let checker = Arc::clone(&self.external);
                let external = external.clone();
                try_dispatch(&self.pool, "external", async move {
                    if let Err(e) = checker.check_external(&external, &network, timeout).await {
                        tracing::debug!(
                            external = %external.name,
                            network = %network,
                            error = %e,
                            "external check failed"
                        );
                    }
                });
            }
        }
    }

    /// One recovery tick: probe failed endpoints, then refresh the aggregate
    /// gauges.
    fn recover_and_aggregate(self: Arc<Self>) {
        let timeout = self.config.snapshot().health_check_timeout();
        let checker = Arc::clone(&self.external);
        try_dispatch(&self.pool, "recovery", async move {
            checker.recover_failed(timeout).await;
            checker.update_endpoint_metrics();
        });
    }

    /// Closes pooled connections held by the checkers. Called after the
    /// loops have stopped and the pool has drained.
    pub fn close(&self) {
        self.external.close();
        for checker in &self.checkers {
            if let Checker::Grpc(c) = checker.as_ref() {
                c.close();
            }
        }
    }
}

impl Checker {
    fn protocol(&self) -> Protocol {
        match self {
            Checker::Api(_) => Protocol::Api,
            Checker::Rpc(_) => Protocol::Rpc,
            Checker::Grpc(_) => Protocol::Grpc,
        }
    }
}

/// Submits `work` to the pool without blocking: if no permit is free the work
/// is dropped for this tick and counted. A panic inside the work is caught
/// and logged through tracing; the permit is released either way and the
/// scheduler loops never see the unwind.
fn try_dispatch<F>(pool: &Arc<Semaphore>, task: &'static str, work: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match Arc::clone(pool).try_acquire_owned() {
        Ok(permit) => {
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
                    tracing::error!(task, panic = %panic_message(&panic), "probe task panicked");
                }
            });
            true
        }
        Err(_) => {
            metrics::scheduler_task_dropped(task);
            tracing::warn!(task, "worker pool saturated, dropping scheduled work");
            false
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_runs_work() {
        let pool = Arc::new(Semaphore::new(2));
        let (tx, rx) = tokio::sync::oneshot::channel();

        assert!(try_dispatch(&pool, "internal", async move {
            let _ = tx.send(());
        }));
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_saturated_pool_drops_work() {
        let pool = Arc::new(Semaphore::new(1));
        let blocker = Arc::clone(&pool).try_acquire_owned().unwrap();

        assert!(!try_dispatch(&pool, "internal", async {}));

        drop(blocker);
        assert!(try_dispatch(&pool, "internal", async {}));
    }

    #[tokio::test]
    async fn test_panicking_task_releases_permit() {
        let pool = Arc::new(Semaphore::new(1));

        assert!(try_dispatch(&pool, "internal", async {
            panic!("probe blew up");
        }));

        // The panic is caught and logged inside the task; the permit must
        // come back and the pool stays usable.
        for _ in 0..50 {
            if pool.available_permits() == 1 {
                assert!(try_dispatch(&pool, "internal", async {}));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("permit was not released after task panic");
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn std::any::Any + Send> = Box::new("owned message".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
