use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, instrument};

use crate::driver::{AdvanceOutcome, SkipReason, StepDriver};
use crate::error::DeepDiveError;
use crate::session::ResearchSession;

const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// Drive `advance` in a tight loop until the session is terminal.
///
/// The loop is capped by [`DriverSettings::max_steps`](crate::DriverSettings::max_steps)
/// so a misbehaving collaborator cannot spin it forever. `on_step` sees the
/// persisted session after every committed step.
#[instrument(name = "worker.run_to_completion", skip(driver, on_step))]
pub async fn run_to_completion_with<F>(
    driver: &StepDriver,
    session_id: &str,
    mut on_step: F,
) -> Result<ResearchSession, DeepDiveError>
where
    F: FnMut(&ResearchSession),
{
    let guard = driver.settings().max_steps();
    let mut steps = 0;

    while steps < guard {
        let outcome = driver.advance(session_id).await?;
        match outcome {
            AdvanceOutcome::Skipped(SkipReason::Busy) => {
                debug!(session_id, "session busy; backing off");
                tokio::time::sleep(BUSY_BACKOFF).await;
                continue;
            }
            AdvanceOutcome::Continue => {
                steps += 1;
                if let Some(session) = driver.store().load_session(session_id).await? {
                    on_step(&session);
                }
            }
            AdvanceOutcome::Completed
            | AdvanceOutcome::Failed { .. }
            | AdvanceOutcome::Skipped(_) => break,
        }
    }

    let session = driver
        .store()
        .load_session(session_id)
        .await?
        .ok_or_else(|| DeepDiveError::SessionNotFound(session_id.to_string()))?;
    if !session.status.is_terminal() {
        return Err(DeepDiveError::Other(anyhow!(
            "session {session_id} did not finish within {guard} steps"
        )));
    }
    Ok(session)
}

pub async fn run_to_completion(
    driver: &StepDriver,
    session_id: &str,
) -> Result<ResearchSession, DeepDiveError> {
    run_to_completion_with(driver, session_id, |_| {}).await
}
