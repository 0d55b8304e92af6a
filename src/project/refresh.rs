//! Periodic liveness checks of a project's active protocols.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{Project, StatusChange};
use crate::config::SchedulerConfig;

/// Sleep granularity while waiting, so cancellation is noticed quickly.
const TICK: Duration = Duration::from_millis(100);

/// Cancels a running [`Refresher`] from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Calls [`Project::refresh`] after an initial wait, then on every interval.
///
/// With auto refresh disabled a single refresh runs after the initial wait.
#[derive(Debug, Clone)]
pub struct Refresher {
    initial_wait: Duration,
    interval: Duration,
    auto_refresh: bool,
    cancel: CancelHandle,
}

impl Refresher {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            initial_wait: config.initial_refresh_wait(),
            interval: config.steps_check_interval(),
            auto_refresh: config.auto_refresh,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_interval(mut self, initial_wait: Duration, interval: Duration) -> Self {
        self.initial_wait = initial_wait;
        self.interval = interval;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs until cancelled and returns every status change observed.
    ///
    /// Refresh errors are logged and retried on the next interval.
    pub fn run(&self, project: &mut Project) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        if !self.wait(self.initial_wait) {
            return changes;
        }

        loop {
            match project.refresh() {
                Ok(found) => {
                    for change in &found {
                        info!("Protocol '{}': {} -> {}", change.id, change.from, change.to);
                    }
                    changes.extend(found);
                }
                Err(e) => warn!("Refresh failed: {}", e),
            }

            if !self.auto_refresh {
                debug!("Auto refresh disabled, stopping after one pass");
                break;
            }
            if !self.wait(self.interval) {
                break;
            }
        }
        changes
    }

    /// Sleeps for `duration`; false if cancelled meanwhile.
    fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(TICK.min(deadline - now));
        }
    }
}
