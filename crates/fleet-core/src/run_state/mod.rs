//! Run state machine transitions.
//!
//! Validates and executes state transitions for runs, enforcing the
//! allowed transition graph and optimistic locking. All callers funnel
//! through this module rather than calling `fleet_db::queries::runs`
//! directly, so illegal transitions are rejected in one place.

use anyhow::{Context, Result};
use fleet_db::models::RunStatus;
use fleet_db::queries::runs as db;
use sqlx::PgPool;
use uuid::Uuid;

/// The run state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued   -> assigned
/// assigned -> running
/// assigned -> queued    (reclaim)
/// running  -> queued    (reclaim)
/// running  -> done
/// running  -> failed
/// queued | assigned | running -> cancelled
/// ```
pub struct RunStateMachine;

/// Outcome of a transition attempt that did not raise an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was applied.
    Applied,
    /// The row no longer matched the expected `from` status -- a
    /// concurrent writer already moved it. Per the spec this is a normal
    /// race-loss, not an error: the fast path and the reconciler both
    /// expect to lose this race sometimes.
    Conflict,
}

impl RunStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (from, to),
            (Queued, Assigned)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Running, Queued)
                | (Running, Done)
                | (Running, Failed)
                | (Queued, Cancelled)
                | (Assigned, Cancelled)
                | (Running, Cancelled)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Returns an error only when the transition is not a legal edge in
    /// the graph. A legal transition that loses the optimistic-lock race
    /// resolves to [`TransitionOutcome::Conflict`] rather than an error.
    pub async fn transition(
        pool: &PgPool,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<TransitionOutcome> {
        anyhow::ensure!(
            Self::is_valid_transition(from, to),
            "invalid run state transition: {from} -> {to} for run {run_id}"
        );

        let rows = db::transition_run_status(pool, run_id, from, to)
            .await
            .with_context(|| format!("failed to transition run {run_id} from {from} to {to}"))?;

        Ok(if rows == 0 {
            TransitionOutcome::Conflict
        } else {
            TransitionOutcome::Applied
        })
    }

    /// Assign a queued run to a node. Returns `Conflict` if the run was
    /// no longer `queued` (another scheduler tick or the reconciler won
    /// the race first).
    pub async fn assign(pool: &PgPool, run_id: Uuid, node_id: &str) -> Result<TransitionOutcome> {
        let rows = db::assign_run(pool, run_id, node_id)
            .await
            .with_context(|| format!("failed to assign run {run_id} to node {node_id}"))?;

        Ok(if rows == 0 {
            TransitionOutcome::Conflict
        } else {
            TransitionOutcome::Applied
        })
    }

    /// Reclaim a run held by a node that has stopped heartbeating.
    /// Increments the run's reclaim counter; requeues it, or fails it
    /// permanently once it has been reclaimed three times in a row.
    pub async fn reclaim(
        pool: &PgPool,
        run_id: Uuid,
        from: RunStatus,
    ) -> Result<Option<RunStatus>> {
        db::reclaim_run(pool, run_id, from)
            .await
            .with_context(|| format!("failed to reclaim run {run_id}"))
    }

    /// Cancel a run from any non-terminal status.
    pub async fn cancel(pool: &PgPool, run_id: Uuid) -> Result<TransitionOutcome> {
        let rows = db::cancel_run(pool, run_id)
            .await
            .with_context(|| format!("failed to cancel run {run_id}"))?;

        Ok(if rows == 0 {
            TransitionOutcome::Conflict
        } else {
            TransitionOutcome::Applied
        })
    }

    /// Transition a run the way a node reports it, guarded additionally
    /// by `node_id` so a late report from a superseded node cannot
    /// clobber a newer assignment (spec scenario: node failure mid-run).
    pub async fn transition_from_node(
        pool: &PgPool,
        run_id: Uuid,
        node_id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<TransitionOutcome> {
        anyhow::ensure!(
            Self::is_valid_transition(from, to),
            "invalid run state transition: {from} -> {to} for run {run_id}"
        );

        let rows = db::transition_run_status_from_node(pool, run_id, node_id, from, to)
            .await
            .with_context(|| {
                format!(
                    "failed to transition run {run_id} from {from} to {to} reported by node {node_id}"
                )
            })?;

        Ok(if rows == 0 {
            TransitionOutcome::Conflict
        } else {
            TransitionOutcome::Applied
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(RunStateMachine::is_valid_transition(
            RunStatus::Queued,
            RunStatus::Assigned
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunStatus::Assigned,
            RunStatus::Running
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunStatus::Running,
            RunStatus::Done
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunStatus::Running,
            RunStatus::Failed
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunStatus::Assigned,
            RunStatus::Queued
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunStatus::Running,
            RunStatus::Queued
        ));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!RunStateMachine::is_valid_transition(
            RunStatus::Queued,
            RunStatus::Running
        ));
        assert!(!RunStateMachine::is_valid_transition(
            RunStatus::Done,
            RunStatus::Queued
        ));
        assert!(!RunStateMachine::is_valid_transition(
            RunStatus::Cancelled,
            RunStatus::Queued
        ));
    }
}
