//! Delivery of "continuation requested" results from `advance`.
//!
//! The driver never calls itself back. Whoever receives
//! [`AdvanceOutcome::Continue`](crate::AdvanceOutcome::Continue) hands the
//! session id to a [`Scheduler`], which decides when the next `advance` runs.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tracing::{error, info, warn};

use crate::driver::StepDriver;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduler queue is closed")]
    Closed,
    #[error("no async runtime available to run the next step")]
    NoRuntime,
}

pub trait Scheduler: Send + Sync {
    /// Request another `advance` for `session_id`. Must not block.
    fn schedule(&self, session_id: String) -> Result<(), ScheduleError>;
}

pub type DynScheduler = Arc<dyn Scheduler>;

/// Runs follow-up steps on the current tokio runtime, at most `max_active`
/// sessions at a time.
#[derive(Clone)]
pub struct SpawnScheduler {
    driver: StepDriver,
    permits: Arc<Semaphore>,
}

impl SpawnScheduler {
    pub fn new(driver: StepDriver, max_active: usize) -> Self {
        Self {
            driver,
            permits: Arc::new(Semaphore::new(max_active.max(1))),
        }
    }
}

impl Scheduler for SpawnScheduler {
    fn schedule(&self, session_id: String) -> Result<(), ScheduleError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ScheduleError::NoRuntime)?;
        let driver = self.driver.clone();
        let permits = self.permits.clone();

        handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(%session_id, "scheduler shut down before the step could run");
                return;
            };
            for _ in 0..driver.settings().max_steps() {
                match driver.advance(&session_id).await {
                    Ok(outcome) if outcome.should_continue() => continue,
                    Ok(outcome) => {
                        info!(%session_id, ?outcome, "background run finished");
                        return;
                    }
                    Err(err) => {
                        error!(%session_id, error = %err, "background advance failed");
                        return;
                    }
                }
            }
            warn!(%session_id, "background run hit the step guard");
        });
        Ok(())
    }
}

/// Hands session ids to an external worker through an unbounded channel.
#[derive(Clone)]
pub struct QueueScheduler {
    sender: mpsc::UnboundedSender<String>,
}

impl QueueScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, session_id: String) -> Result<(), ScheduleError> {
        self.sender
            .send(session_id)
            .map_err(|_| ScheduleError::Closed)
    }
}

/// Drain `receiver`, advancing each session once and re-queueing it while it
/// asks to continue. Returns when every sender has been dropped.
pub async fn run_queue_worker(
    driver: StepDriver,
    scheduler: QueueScheduler,
    mut receiver: mpsc::UnboundedReceiver<String>,
) {
    // Holding only a weak handle lets the loop end once producers go away.
    let requeue = scheduler.sender.downgrade();
    drop(scheduler);

    while let Some(session_id) = receiver.recv().await {
        match driver.advance(&session_id).await {
            Ok(outcome) if outcome.should_continue() => {
                let Some(sender) = requeue.upgrade() else {
                    warn!(%session_id, "queue closed; dropping continuation");
                    continue;
                };
                if sender.send(session_id.clone()).is_err() {
                    warn!(%session_id, "queue closed; dropping continuation");
                }
            }
            Ok(outcome) => info!(%session_id, ?outcome, "queued session settled"),
            Err(err) => error!(%session_id, error = %err, "queued advance failed"),
        }
    }
}
