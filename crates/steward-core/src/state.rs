//! Job status state machine.
//!
//! Validates and executes execution-status transitions, enforcing the
//! allowed transition graph and optimistic locking. The launch lifecycle
//! (`LaunchState`) is managed separately by the claim/lease queries.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use steward_db::models::JobStatus;
use steward_db::queries::jobs as db;

/// The job execution state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued     -> active | stalled | failed
/// stalled    -> queued | active | failed
/// active     -> announcing | completed | failed
/// announcing -> completed | failed
/// failed     -> retrying | failed_permanent
/// ```
///
/// `completed`, `failed_permanent`, and `retrying` are terminal for the
/// record; a retry continues under a new job id.
pub struct JobStateMachine;

impl JobStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
        matches!(
            (from, to),
            (JobStatus::Queued, JobStatus::Active)
                | (JobStatus::Queued, JobStatus::Stalled)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Stalled, JobStatus::Queued)
                | (JobStatus::Stalled, JobStatus::Active)
                | (JobStatus::Stalled, JobStatus::Failed)
                | (JobStatus::Active, JobStatus::Announcing)
                | (JobStatus::Active, JobStatus::Completed)
                | (JobStatus::Active, JobStatus::Failed)
                | (JobStatus::Announcing, JobStatus::Completed)
                | (JobStatus::Announcing, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Retrying)
                | (JobStatus::Failed, JobStatus::FailedPermanent)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Sets `completed_at` when transitioning into `completed` or `failed`,
    /// and stores the optional error/result extras.
    ///
    /// Returns an error if:
    /// - The transition is not a valid edge.
    /// - The current status in the store does not match `from`
    ///   (optimistic lock failure).
    /// - The job does not exist.
    pub async fn transition(
        pool: &PgPool,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
        result: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid status transition: {from} -> {to} for job {job_id}");
        }

        let set_completed_at = matches!(to, JobStatus::Completed | JobStatus::Failed);

        let rows = db::transition_job_status(pool, job_id, from, to, error, result, set_completed_at)
            .await
            .with_context(|| format!("failed to transition job {job_id} from {from} to {to}"))?;

        if rows == 0 {
            // Either the job does not exist or the status did not match.
            let job = db::get_job(pool, job_id).await?;
            match job {
                None => bail!("job {job_id} not found"),
                Some(j) => bail!(
                    "optimistic lock failed: job {job_id} has status {}, expected {from}",
                    j.status
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_accepted() {
        let valid = [
            (JobStatus::Queued, JobStatus::Active),
            (JobStatus::Queued, JobStatus::Stalled),
            (JobStatus::Queued, JobStatus::Failed),
            (JobStatus::Stalled, JobStatus::Queued),
            (JobStatus::Stalled, JobStatus::Active),
            (JobStatus::Stalled, JobStatus::Failed),
            (JobStatus::Active, JobStatus::Announcing),
            (JobStatus::Active, JobStatus::Completed),
            (JobStatus::Active, JobStatus::Failed),
            (JobStatus::Announcing, JobStatus::Completed),
            (JobStatus::Announcing, JobStatus::Failed),
            (JobStatus::Failed, JobStatus::Retrying),
            (JobStatus::Failed, JobStatus::FailedPermanent),
        ];
        for (from, to) in &valid {
            assert!(
                JobStateMachine::is_valid_transition(*from, *to),
                "expected {from} -> {to} to be valid"
            );
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let terminals = [
            JobStatus::Completed,
            JobStatus::FailedPermanent,
            JobStatus::Retrying,
        ];
        let all = [
            JobStatus::Queued,
            JobStatus::Active,
            JobStatus::Announcing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::FailedPermanent,
            JobStatus::Retrying,
            JobStatus::Stalled,
        ];
        for from in &terminals {
            for to in &all {
                assert!(
                    !JobStateMachine::is_valid_transition(*from, *to),
                    "terminal {from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn no_backwards_completion() {
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::Completed,
            JobStatus::Queued
        ));
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::Failed,
            JobStatus::Active
        ));
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::Failed,
            JobStatus::Queued
        ));
        assert!(!JobStateMachine::is_valid_transition(
            JobStatus::Queued,
            JobStatus::Completed
        ));
    }
}
