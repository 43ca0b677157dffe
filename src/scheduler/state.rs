//! Persisted schedule record and per-attempt outcome types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::{PolicyError, UpdatePolicy};

/// On-disk format version, bumped on incompatible layout changes.
pub const STATE_FORMAT_VERSION: &str = "1.0";

/// The single durable record the scheduler owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    /// Completion time of the most recent attempt, absent before the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub policy: UpdatePolicy,
    /// Attempts since the last success, kept for status reporting only.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl ScheduleState {
    /// Fresh state for a first startup with no persisted file.
    pub fn first_run(policy: UpdatePolicy, now: DateTime<Utc>) -> Result<Self, PolicyError> {
        Ok(Self {
            last_run_at: None,
            next_run_at: policy.first_run(now)?,
            policy,
            consecutive_failures: 0,
        })
    }
}

/// Envelope written to the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSchedule {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub state: ScheduleState,
}

impl PersistedSchedule {
    pub fn new(state: ScheduleState) -> Self {
        Self {
            version: STATE_FORMAT_VERSION.to_string(),
            saved_at: Utc::now(),
            state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Every enabled chart rendered and posted.
    Success,
    /// At least one chart made it out, at least one did not.
    PartialFailure,
    /// Nothing usable was produced.
    Failure,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Success => "success",
            UpdateStatus::PartialFailure => "partial failure",
            UpdateStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one orchestrator attempt, reported back to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub run_id: Uuid,
    pub status: UpdateStatus,
    pub completed_at: DateTime<Utc>,
    pub charts_posted: u32,
    pub charts_failed: u32,
}

impl UpdateOutcome {
    /// Outcome for an attempt that produced nothing, e.g. a failed fetch.
    pub fn failure(run_id: Uuid, completed_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: UpdateStatus::Failure,
            completed_at,
            charts_posted: 0,
            charts_failed: 0,
        }
    }

    /// Classify from per-chart tallies.
    pub fn classified(
        run_id: Uuid,
        completed_at: DateTime<Utc>,
        charts_posted: u32,
        charts_failed: u32,
    ) -> Self {
        let status = if charts_posted > 0 && charts_failed == 0 {
            UpdateStatus::Success
        } else if charts_posted > 0 {
            UpdateStatus::PartialFailure
        } else {
            UpdateStatus::Failure
        };
        Self {
            run_id,
            status,
            completed_at,
            charts_posted,
            charts_failed,
        }
    }

    /// Human-readable one-liner for command replies and logs.
    pub fn summary(&self) -> String {
        match self.status {
            UpdateStatus::Success => {
                format!("Update complete: posted {} chart(s).", self.charts_posted)
            }
            UpdateStatus::PartialFailure => format!(
                "Update partially complete: posted {} chart(s), {} failed.",
                self.charts_posted, self.charts_failed
            ),
            UpdateStatus::Failure => "Update failed: no charts were posted.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_classification_table() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id = Uuid::now_v7();

        assert_eq!(
            UpdateOutcome::classified(id, at, 6, 0).status,
            UpdateStatus::Success
        );
        assert_eq!(
            UpdateOutcome::classified(id, at, 2, 4).status,
            UpdateStatus::PartialFailure
        );
        assert_eq!(
            UpdateOutcome::classified(id, at, 0, 6).status,
            UpdateStatus::Failure
        );
        assert_eq!(
            UpdateOutcome::classified(id, at, 0, 0).status,
            UpdateStatus::Failure
        );
        assert_eq!(UpdateOutcome::failure(id, at).status, UpdateStatus::Failure);
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let state = ScheduleState {
            last_run_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()),
            next_run_at: Utc.with_ymd_and_hms(2024, 1, 8, 10, 0, 0).unwrap(),
            policy: UpdatePolicy::Interval { days: 7 },
            consecutive_failures: 2,
        };
        let json = serde_json::to_string(&PersistedSchedule::new(state.clone())).unwrap();
        let parsed: PersistedSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, state);
        assert_eq!(parsed.version, STATE_FORMAT_VERSION);
    }

    #[test]
    fn test_state_tolerates_missing_optional_fields() {
        let json = r#"{
            "version": "1.0",
            "savedAt": "2024-01-01T00:00:00Z",
            "state": {
                "nextRunAt": "2024-01-08T10:00:00Z",
                "policy": { "kind": "interval", "days": 7 }
            }
        }"#;
        let parsed: PersistedSchedule = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.state.last_run_at, None);
        assert_eq!(parsed.state.consecutive_failures, 0);
    }
}
