//! The update tracker: owns the schedule state, gates concurrent runs and
//! drives the periodic update loop.
//!
//! Exactly one update attempt may be in flight at any time, whether it was
//! started by the timer or forced through a command. A forced run does not
//! abort anything; callers get [`TrackerError::AlreadyRunning`] and can try
//! again later.

use std::cmp;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use super::clock::Clock;
use super::policy::{PolicyError, UpdatePolicy};
use super::recovery;
use super::state::{ScheduleState, UpdateOutcome, UpdateStatus};
use super::store::ScheduleStore;

/// Longest single sleep inside [`UpdateTracker::wait_until_due`]. Keeps the
/// loop responsive to reschedules even if a wakeup is missed.
const WAIT_CHUNK: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("an update run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// What started the run currently holding the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Scheduled,
    Manual,
}

/// Executes one full update attempt. Implemented by the orchestrator; test
/// code substitutes stubs.
#[async_trait]
pub trait UpdateRunner: Send + Sync {
    async fn run_update(&self) -> UpdateOutcome;
}

/// Snapshot of the scheduler for status commands and logs.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub policy: UpdatePolicy,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub running: bool,
}

pub struct UpdateTracker {
    state: Mutex<ScheduleState>,
    active_run: Mutex<Option<RunKind>>,
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    /// Pinged whenever `next_run_at` may have moved.
    wake: Notify,
    /// Pinged when a run releases the slot.
    run_done: Notify,
}

impl UpdateTracker {
    /// Build the tracker from the persisted state, reconciled against the
    /// configured policy. Falls back to a fresh schedule when nothing was
    /// stored or the file could not be read.
    pub async fn restore(
        policy: UpdatePolicy,
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, TrackerError> {
        policy.validate()?;
        let now = clock.now();

        let state = match store.load().await {
            Ok(Some(saved)) => recovery::restore(saved, policy, now)?,
            Ok(None) => ScheduleState::first_run(policy, now)?,
            Err(e) => {
                warn!("could not load schedule state ({e}), starting fresh");
                ScheduleState::first_run(policy, now)?
            }
        };
        info!(
            "schedule ready: updates {}, next run at {}",
            state.policy, state.next_run_at
        );

        if let Err(e) = store.save(&state).await {
            warn!("could not persist schedule state: {e}");
        }

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            active_run: Mutex::new(None),
            store,
            clock,
            wake: Notify::new(),
            run_done: Notify::new(),
        }))
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().await;
        SchedulerStatus {
            policy: state.policy,
            last_run_at: state.last_run_at,
            next_run_at: state.next_run_at,
            consecutive_failures: state.consecutive_failures,
            running: self.active_run.lock().await.is_some(),
        }
    }

    /// Sleep until `next_run_at` is due. Returns immediately when it is
    /// already in the past. Reschedules through `wake` cut the sleep short;
    /// the chunked sleep bounds how stale a missed wakeup can leave us.
    pub async fn wait_until_due(&self) {
        loop {
            let next = self.state.lock().await.next_run_at;
            let remaining = next - self.clock.now();
            if remaining <= Duration::zero() {
                return;
            }
            let sleep_for = cmp::min(
                remaining.to_std().unwrap_or(StdDuration::ZERO),
                WAIT_CHUNK,
            );
            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = self.wake.notified() => {}
            }
        }
    }

    /// Run updates forever: wait for the slot to come due, claim the run
    /// slot and execute. If a manual run got there first, wait for it to
    /// finish (it advances the schedule) and re-evaluate.
    pub async fn run_scheduled_loop(self: Arc<Self>, runner: Arc<dyn UpdateRunner>) {
        info!(
            "update loop started, next run at {}",
            self.state.lock().await.next_run_at
        );
        loop {
            self.wait_until_due().await;
            match self.try_begin(RunKind::Scheduled).await {
                Ok(()) => {
                    info!("scheduled update due, starting run");
                    let outcome = runner.run_update().await;
                    self.record_outcome(&outcome).await;
                }
                Err(_) => {
                    let done = self.run_done.notified();
                    tokio::pin!(done);
                    done.as_mut().enable();
                    if self.active_run.lock().await.is_some() {
                        done.await;
                    }
                }
            }
        }
    }

    /// Run one update immediately on behalf of a command. Fails fast when a
    /// run is already in flight. A successful forced run counts as the last
    /// run but leaves a still-future `next_run_at` untouched.
    pub async fn force_update_now(
        &self,
        runner: Arc<dyn UpdateRunner>,
    ) -> Result<UpdateOutcome, TrackerError> {
        self.try_begin(RunKind::Manual).await?;
        info!("manual update requested, starting run");
        let outcome = runner.run_update().await;
        self.record_outcome(&outcome).await;
        Ok(outcome)
    }

    /// Swap in a new policy and recompute the next run from now. Run
    /// history is kept; the failure streak belonged to the old cadence and
    /// resets. Any in-progress wait is cut short so the new time takes
    /// effect immediately.
    pub async fn reschedule(&self, new_policy: UpdatePolicy) -> Result<(), TrackerError> {
        let next = new_policy.first_run(self.clock.now())?;

        let mut state = self.state.lock().await;
        state.policy = new_policy;
        state.next_run_at = next;
        state.consecutive_failures = 0;

        info!(
            "schedule changed: updates {}, next run at {}",
            state.policy, state.next_run_at
        );

        if let Err(e) = self.store.save(&state).await {
            warn!("could not persist schedule state: {e}");
        }
        drop(state);

        self.wake.notify_waiters();
        Ok(())
    }

    async fn try_begin(&self, kind: RunKind) -> Result<(), TrackerError> {
        let mut active = self.active_run.lock().await;
        if active.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }
        *active = Some(kind);
        Ok(())
    }

    /// Fold a finished attempt into the schedule and release the run slot.
    /// The schedule always moves forward, whatever the outcome was.
    async fn record_outcome(&self, outcome: &UpdateOutcome) {
        let kind = self.active_run.lock().await.take();
        let Some(kind) = kind else {
            warn!("outcome {} reported with no run in flight", outcome.run_id);
            return;
        };

        let now = self.clock.now();
        let mut state = self.state.lock().await;

        state.last_run_at = Some(outcome.completed_at);
        match outcome.status {
            UpdateStatus::Failure => state.consecutive_failures += 1,
            _ => state.consecutive_failures = 0,
        }

        let must_advance = match kind {
            RunKind::Scheduled => true,
            // A manual run only consumes the slot when it has already passed.
            RunKind::Manual => state.next_run_at <= now,
        };
        if must_advance {
            state.next_run_at = match state.policy.advance(state.next_run_at, now) {
                Ok(next) => next,
                Err(e) => {
                    error!("could not advance schedule ({e}), retrying in one day");
                    outcome.completed_at + Duration::days(1)
                }
            };
        }

        info!(
            "run {} finished with {}: posted {}, failed {}, next run at {}",
            outcome.run_id,
            outcome.status,
            outcome.charts_posted,
            outcome.charts_failed,
            state.next_run_at
        );

        if let Err(e) = self.store.save(&state).await {
            warn!("could not persist schedule state: {e}");
        }
        drop(state);

        self.wake.notify_waiters();
        self.run_done.notify_waiters();
    }
}
