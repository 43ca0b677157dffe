//! Off-loop execution of CPU-bound render jobs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use super::ChartKind;

/// Failure of a single chart render.
///
/// `expected` marks outcomes that are part of normal operation, like a
/// chart with no data in range, as opposed to bugs and infrastructure
/// trouble. The orchestrator logs the two classes at different levels.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RenderError {
    message: String,
    expected: bool,
}

impl RenderError {
    pub fn expected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected: true,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected: false,
        }
    }

    pub fn is_expected(&self) -> bool {
        self.expected
    }
}

/// One chart render, self-contained and ready to run on a worker thread.
pub struct RenderJob {
    pub chart: ChartKind,
    job: Box<dyn FnOnce() -> Result<PathBuf, RenderError> + Send + 'static>,
}

impl RenderJob {
    pub fn new(
        chart: ChartKind,
        job: impl FnOnce() -> Result<PathBuf, RenderError> + Send + 'static,
    ) -> Self {
        Self {
            chart,
            job: Box::new(job),
        }
    }

    pub fn execute(self) -> Result<PathBuf, RenderError> {
        (self.job)()
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("render exceeded its {budget_secs}s budget")]
    Timeout { budget_secs: u64 },

    #[error("render worker failed: {0}")]
    Worker(String),
}

impl TaskError {
    /// Timeouts and worker crashes always count as unexpected.
    pub fn is_expected(&self) -> bool {
        matches!(self, TaskError::Render(e) if e.is_expected())
    }
}

/// Executes render jobs without stalling the event loop.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, job: RenderJob) -> Result<PathBuf, TaskError>;
}

/// Runs jobs on the blocking thread pool with a per-job deadline. A job
/// that overruns keeps its worker thread busy until it finishes on its
/// own; only the result is abandoned.
pub struct BlockingTaskRunner {
    budget: Duration,
}

impl BlockingTaskRunner {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }
}

#[async_trait]
impl TaskRunner for BlockingTaskRunner {
    async fn run(&self, job: RenderJob) -> Result<PathBuf, TaskError> {
        let chart = job.chart;
        let handle = tokio::task::spawn_blocking(move || job.execute());
        match tokio::time::timeout(self.budget, handle).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join)) => {
                let reason = if join.is_panic() {
                    format!("render of {chart} panicked")
                } else {
                    format!("render of {chart} was cancelled")
                };
                Err(TaskError::Worker(reason))
            }
            Err(_) => {
                warn!(
                    "render of {chart} still running after {}s, giving up on it",
                    self.budget.as_secs()
                );
                Err(TaskError::Timeout {
                    budget_secs: self.budget.as_secs(),
                })
            }
        }
    }
}
