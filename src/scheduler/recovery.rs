//! Startup reconciliation of the persisted schedule against reality.
//!
//! The process may have been down for days, the config may have changed
//! while it was down, or the state file may carry values that no longer
//! make sense. `restore` folds all of that into a schedule the tracker
//! can run with directly.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::policy::{PolicyError, UpdatePolicy};
use super::state::ScheduleState;

/// Slack added on top of the policy's own maximum step before a stored
/// next-run time is considered implausible.
const PLAUSIBILITY_SLACK: Duration = Duration::days(1);

/// Reconcile a previously persisted state with the currently configured
/// policy. Returns the state the scheduler should start from.
pub fn restore(
    saved: ScheduleState,
    configured: UpdatePolicy,
    now: DateTime<Utc>,
) -> Result<ScheduleState, PolicyError> {
    if saved.policy != configured {
        info!(
            "update policy changed ({} -> {}), rescheduling",
            saved.policy, configured
        );
        let fresh = ScheduleState::first_run(configured, now)?;
        return Ok(ScheduleState {
            last_run_at: saved.last_run_at,
            ..fresh
        });
    }

    if let Some(reason) = implausibility(&saved, now) {
        warn!("stored schedule looks wrong ({reason}), recomputing from now");
        let fresh = ScheduleState::first_run(configured, now)?;
        return Ok(ScheduleState {
            last_run_at: saved.last_run_at,
            consecutive_failures: saved.consecutive_failures,
            ..fresh
        });
    }

    if saved.next_run_at <= now {
        info!(
            "missed scheduled update at {}, running as soon as possible",
            saved.next_run_at
        );
    }

    Ok(saved)
}

fn implausibility(state: &ScheduleState, now: DateTime<Utc>) -> Option<String> {
    if let Some(last) = state.last_run_at {
        if state.next_run_at < last {
            return Some(format!(
                "next run {} precedes last run {}",
                state.next_run_at, last
            ));
        }
    }
    let horizon = now + state.policy.max_step() + PLAUSIBILITY_SLACK;
    if state.next_run_at > horizon {
        return Some(format!(
            "next run {} is beyond the policy horizon {}",
            state.next_run_at, horizon
        ));
    }
    None
}
