//! Cancellable delayed actions.
//!
//! [`Scheduler`] runs futures after a delay on the Tokio runtime. Shutting
//! the scheduler down cuts every pending delay short: the actions still run,
//! just immediately, so no timer outlives the owning session and no delayed
//! settlement is lost. A single task can still be cancelled outright.

use std::{future::Future, time::Duration};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

/// Spawns delayed actions bound to one owner's lifetime.
#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Handle for a single scheduled action.
#[derive(Clone, Debug)]
pub struct ScheduledTask(CancellationToken);

impl ScheduledTask {
    /// Prevent the action from running if it has not fired yet.
    ///
    /// Has no effect once the scheduler has been shut down.
    pub fn cancel(&self) { self.0.cancel(); }

    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.0.is_cancelled() }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Run `action` once `delay` has elapsed.
    ///
    /// The action runs at once if the scheduler is shut down before the delay
    /// elapses, or already was. Must be called from within a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = task_token.cancelled() => {
                    debug!(?delay, "scheduled action cancelled");
                    return;
                }
                () = shutdown.cancelled() => {
                    debug!(?delay, "scheduler shut down; running action early");
                }
                () = tokio::time::sleep(delay) => {}
            }
            action.await;
        });
        ScheduledTask(token)
    }

    /// Run every pending action now and skip the delay of any scheduled later.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool { self.shutdown.is_cancelled() }

    /// Number of actions that have not finished yet.
    #[must_use]
    pub fn pending(&self) -> usize { self.tracker.len() }

    /// Wait until every action has finished or been cancelled.
    ///
    /// Only returns after [`Scheduler::shutdown`] has been called.
    pub async fn drained(&self) { self.tracker.wait().await; }
}
