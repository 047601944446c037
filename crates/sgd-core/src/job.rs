//! Job state machine. States are totally ordered within one job's lifetime:
//! `queued < running < preview_ready < completed|failed|cancelled`.

use crate::result::RenderResult;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    PreviewReady,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// States reachable directly from this one. `preview_ready` is optional
    /// in the overall lifecycle (sync renders skip it) but once observed it
    /// may only be followed by a terminal state or `running` again if the
    /// worker moves on to the final pass.
    pub fn valid_transitions(self) -> &'static [JobState] {
        match self {
            JobState::Queued => &[JobState::Running, JobState::Cancelled],
            JobState::Running => &[
                JobState::PreviewReady,
                JobState::Completed,
                JobState::Failed,
                JobState::Cancelled,
            ],
            JobState::PreviewReady => &[JobState::Completed, JobState::Failed, JobState::Cancelled],
            JobState::Completed | JobState::Failed | JobState::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Result(RenderResult),
    Error { error: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: Uuid,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub outcome: Option<JobOutcome>,
    /// Signed URL for the smaller, n=1 preview image, set when the job
    /// reaches (or has passed through) `preview_ready`.
    #[serde(default)]
    pub preview_url: Option<String>,
}

impl Job {
    pub fn new(content_hash: String, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Job {
            id: Uuid::new_v4(),
            content_hash,
            payload,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            outcome: None,
            preview_url: None,
        }
    }

    /// Attempt a state transition, enforcing monotonic state transitions.
    /// Returns an error describing the rejected transition rather than a
    /// generic bool so callers can surface a useful diagnostic.
    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<(), String> {
        if self.state.is_terminal() {
            return Err(format!(
                "job {} is terminal in state {:?}, cannot move to {next:?}",
                self.id, self.state
            ));
        }
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "job {} cannot transition from {:?} to {next:?}",
                self.id, self.state
            ));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}
