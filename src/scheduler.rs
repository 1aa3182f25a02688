//! Recurring cycles with explicit start and stop.
//!
//! Each scheduler is a long-lived task owning its own tick timer. A tick that
//! arrives while the previous run is still going is skipped, so runs of one
//! cycle never overlap or queue up.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// One unit of recurring work.
#[async_trait]
pub trait Cycle: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one cycle to completion.
    async fn tick(&self);
}

/// At-most-one-run flag for a cycle.
#[derive(Debug, Default)]
pub struct CycleGuard {
    running: AtomicBool,
}

/// Marks a run in progress until dropped.
pub struct CycleToken<'a> {
    guard: &'a CycleGuard,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the cycle, or `None` if a run is already in progress.
    pub fn try_enter(&self) -> Option<CycleToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CycleToken<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Handle for stopping a spawned scheduler.
pub struct SchedulerHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the in-flight run to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("{} scheduler ended abnormally: {}", self.name, e);
        }
    }
}

/// Spawn a task that runs `cycle` every `every`, starting immediately.
pub fn spawn_recurring<C: Cycle>(cycle: Arc<C>, every: Duration) -> SchedulerHandle {
    let name = cycle.name();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!("Starting {} scheduler with {}s interval", name, every.as_secs());

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if in_flight.as_ref().is_some_and(|run| !run.is_finished()) {
                        debug!("{} cycle still running, skipping tick", name);
                        continue;
                    }
                    let cycle = Arc::clone(&cycle);
                    in_flight = Some(tokio::spawn(async move { cycle.tick().await }));
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(run) = in_flight {
            if let Err(e) = run.await {
                warn!("{} cycle ended abnormally: {}", name, e);
            }
        }
        info!("{} scheduler shut down", name);
    });

    SchedulerHandle {
        name,
        shutdown_tx,
        task,
    }
}
