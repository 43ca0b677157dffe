//! One full update: fetch history, render every enabled chart, post the
//! results and report how it went.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::discord::Poster;
use crate::scheduler::clock::Clock;
use crate::scheduler::state::UpdateOutcome;
use crate::scheduler::tracker::UpdateRunner;

use super::data::{DataFetcher, FetchError};
use super::render::ChartRenderer;
use super::runner::{RenderJob, TaskError, TaskRunner};
use super::ChartKind;

/// Per-run knobs, fixed at startup from the config.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub charts: Vec<ChartKind>,
    pub channel_id: u64,
    pub time_range_days: u32,
    pub keep_days: u32,
    pub output_dir: PathBuf,
}

pub struct UpdateOrchestrator {
    settings: UpdateSettings,
    fetcher: Arc<dyn DataFetcher>,
    renderer: Arc<ChartRenderer>,
    poster: Arc<dyn Poster>,
    runner: Arc<dyn TaskRunner>,
    clock: Arc<dyn Clock>,
}

impl UpdateOrchestrator {
    pub fn new(
        settings: UpdateSettings,
        fetcher: Arc<dyn DataFetcher>,
        renderer: Arc<ChartRenderer>,
        poster: Arc<dyn Poster>,
        runner: Arc<dyn TaskRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            renderer,
            poster,
            runner,
            clock,
        }
    }

    /// Render the per-user charts for a stats request. Charts without data
    /// are skipped; anything unexpected is logged and skipped as well, so
    /// one bad chart never swallows the rest.
    pub async fn render_user_charts(
        &self,
        user_id: u64,
    ) -> Result<Vec<(ChartKind, PathBuf)>, FetchError> {
        let history = Arc::new(
            self.fetcher
                .fetch_for_user(self.settings.time_range_days, user_id)
                .await?,
        );

        let results = join_all(ChartKind::PER_USER.iter().map(|&chart| {
            let renderer = Arc::clone(&self.renderer);
            let history = Arc::clone(&history);
            async move {
                let job =
                    RenderJob::new(chart, move || renderer.render_for_user(chart, user_id, &history));
                (chart, self.runner.run(job).await)
            }
        }))
        .await;

        let mut paths = Vec::new();
        for (chart, result) in results {
            match result {
                Ok(path) => paths.push((chart, path)),
                Err(e) if e.is_expected() => {
                    info!("skipping {chart} for user {user_id}: {e}");
                }
                Err(e) => {
                    error!("render of {chart} for user {user_id} failed: {e}");
                }
            }
        }
        Ok(paths)
    }

    /// Delete chart files older than the retention window. Best effort;
    /// files that refuse to die are left for the next run.
    async fn prune_old_charts(&self) -> std::io::Result<()> {
        let dir = &self.settings.output_dir;
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return Ok(());
        }

        let cutoff = self.clock.now() - Duration::days(i64::from(self.settings.keep_days));
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut removed = 0u32;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            if file_older_than(&entry, cutoff).await && tokio::fs::remove_file(&path).await.is_ok()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(
                "pruned {removed} chart file(s) older than {} days",
                self.settings.keep_days
            );
        }
        Ok(())
    }
}

async fn file_older_than(entry: &tokio::fs::DirEntry, cutoff: DateTime<Utc>) -> bool {
    let Ok(meta) = entry.metadata().await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    DateTime::<Utc>::from(modified) < cutoff
}

#[async_trait]
impl UpdateRunner for UpdateOrchestrator {
    async fn run_update(&self) -> UpdateOutcome {
        let run_id = Uuid::now_v7();
        info!(
            "update run {run_id} started, {} chart(s) over {} days",
            self.settings.charts.len(),
            self.settings.time_range_days
        );

        let history = match self.fetcher.fetch(self.settings.time_range_days).await {
            Ok(history) => Arc::new(history),
            Err(e) => {
                error!("update run {run_id} aborted, history fetch failed: {e}");
                return UpdateOutcome::failure(run_id, self.clock.now());
            }
        };
        info!(
            "fetched {} play(s) for update run {run_id}",
            history.records.len()
        );

        let render_results = join_all(self.settings.charts.iter().map(|&chart| {
            let renderer = Arc::clone(&self.renderer);
            let history = Arc::clone(&history);
            async move {
                let job = RenderJob::new(chart, move || renderer.render(chart, &history));
                (chart, self.runner.run(job).await)
            }
        }))
        .await;

        let mut posted = 0u32;
        let mut failed = 0u32;
        for (chart, result) in render_results {
            match result {
                Ok(path) => {
                    let content = format!("**{}**", chart.title());
                    match self
                        .poster
                        .post_file(self.settings.channel_id, &path, &content)
                        .await
                    {
                        Ok(()) => posted += 1,
                        Err(e) => {
                            failed += 1;
                            error!("posting {chart} failed: {e}");
                        }
                    }
                }
                Err(TaskError::Render(e)) if e.is_expected() => {
                    failed += 1;
                    warn!("skipped {chart}: {e}");
                }
                Err(e) => {
                    failed += 1;
                    error!("render of {chart} failed: {e}");
                }
            }
        }

        // Housekeeping only follows runs that delivered something.
        if posted > 0 {
            if let Err(e) = self.prune_old_charts().await {
                warn!("chart pruning failed: {e}");
            }
        }

        let outcome = UpdateOutcome::classified(run_id, self.clock.now(), posted, failed);
        info!("update run {run_id} finished: {}", outcome.summary());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::data::{MediaKind, PlayHistory, PlayRecord, ResolvedUser};
    use crate::graphs::runner::{BlockingTaskRunner, RenderError};
    use crate::discord::PostError;
    use crate::scheduler::clock::ManualClock;
    use crate::scheduler::state::UpdateStatus;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn records() -> Vec<PlayRecord> {
        let mut out = Vec::new();
        for day in 5..10 {
            out.push(PlayRecord {
                watched_at: at(2024, 3, day, 20),
                user_id: 1,
                user: "ann".to_string(),
                platform: "Roku".to_string(),
                media: MediaKind::Movie,
            });
            out.push(PlayRecord {
                watched_at: at(2024, 3, day, 21),
                user_id: 2,
                user: "bob".to_string(),
                platform: "Web".to_string(),
                media: MediaKind::Tv,
            });
        }
        out
    }

    struct CannedFetcher {
        records: Vec<PlayRecord>,
        fail: bool,
    }

    #[async_trait]
    impl DataFetcher for CannedFetcher {
        async fn fetch(&self, range_days: u32) -> Result<PlayHistory, FetchError> {
            if self.fail {
                return Err(FetchError::Api("connection refused".to_string()));
            }
            Ok(PlayHistory::new(
                range_days,
                at(2024, 3, 10, 12),
                self.records.clone(),
            ))
        }

        async fn fetch_for_user(
            &self,
            range_days: u32,
            user_id: u64,
        ) -> Result<PlayHistory, FetchError> {
            let records = self
                .records
                .iter()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect();
            Ok(PlayHistory::new(range_days, at(2024, 3, 10, 12), records))
        }

        async fn find_user_by_email(
            &self,
            _email: &str,
        ) -> Result<Option<ResolvedUser>, FetchError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingPoster {
        posts: Mutex<Vec<(u64, PathBuf)>>,
        fail: bool,
    }

    #[async_trait]
    impl Poster for RecordingPoster {
        async fn post_file(
            &self,
            channel_id: u64,
            path: &Path,
            _content: &str,
        ) -> Result<(), PostError> {
            if self.fail {
                return Err(PostError::Api {
                    status: 500,
                    message: "server error".to_string(),
                });
            }
            self.posts
                .lock()
                .await
                .push((channel_id, path.to_path_buf()));
            Ok(())
        }

        async fn create_dm(&self, _user_id: u64) -> Result<u64, PostError> {
            Ok(1)
        }
    }

    /// Fails one chart kind, delegates the rest to a real runner.
    struct FailOneRunner {
        victim: ChartKind,
        inner: BlockingTaskRunner,
    }

    #[async_trait]
    impl TaskRunner for FailOneRunner {
        async fn run(&self, job: RenderJob) -> Result<PathBuf, TaskError> {
            if job.chart == self.victim {
                return Err(TaskError::Render(RenderError::unexpected("boom")));
            }
            self.inner.run(job).await
        }
    }

    struct Setup {
        orchestrator: UpdateOrchestrator,
        poster: Arc<RecordingPoster>,
        clock: Arc<ManualClock>,
        _tmp: TempDir,
    }

    fn setup(fetcher: CannedFetcher, poster: RecordingPoster, runner: Arc<dyn TaskRunner>) -> Setup {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(at(2024, 3, 10, 12)));
        let poster = Arc::new(poster);
        let settings = UpdateSettings {
            charts: ChartKind::ALL.to_vec(),
            channel_id: 42,
            time_range_days: 30,
            keep_days: 7,
            output_dir: tmp.path().to_path_buf(),
        };
        let orchestrator = UpdateOrchestrator::new(
            settings,
            Arc::new(fetcher),
            Arc::new(ChartRenderer::new(tmp.path(), "#1f77b4", "#ff7f0e", false)),
            poster.clone(),
            runner,
            clock.clone(),
        );
        Setup {
            orchestrator,
            poster,
            clock,
            _tmp: tmp,
        }
    }

    fn real_runner() -> Arc<dyn TaskRunner> {
        Arc::new(BlockingTaskRunner::new(StdDuration::from_secs(30)))
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_run() {
        let setup = setup(
            CannedFetcher {
                records: records(),
                fail: true,
            },
            RecordingPoster::default(),
            real_runner(),
        );

        let outcome = setup.orchestrator.run_update().await;
        assert_eq!(outcome.status, UpdateStatus::Failure);
        assert_eq!(outcome.charts_posted, 0);
        assert_eq!(outcome.charts_failed, 0);
        assert!(setup.poster.posts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_successful_run_posts_every_chart() {
        let setup = setup(
            CannedFetcher {
                records: records(),
                fail: false,
            },
            RecordingPoster::default(),
            real_runner(),
        );

        let outcome = setup.orchestrator.run_update().await;
        assert_eq!(outcome.status, UpdateStatus::Success);
        assert_eq!(outcome.charts_posted, 6);
        assert_eq!(outcome.charts_failed, 0);

        let posts = setup.poster.posts.lock().await;
        assert_eq!(posts.len(), 6);
        assert!(posts.iter().all(|(channel, _)| *channel == 42));
    }

    #[tokio::test]
    async fn test_single_chart_failure_is_contained() {
        let setup = setup(
            CannedFetcher {
                records: records(),
                fail: false,
            },
            RecordingPoster::default(),
            Arc::new(FailOneRunner {
                victim: ChartKind::Top10Users,
                inner: BlockingTaskRunner::new(StdDuration::from_secs(30)),
            }),
        );

        let outcome = setup.orchestrator.run_update().await;
        assert_eq!(outcome.status, UpdateStatus::PartialFailure);
        assert_eq!(outcome.charts_posted, 5);
        assert_eq!(outcome.charts_failed, 1);
    }

    #[tokio::test]
    async fn test_post_failures_yield_failure_outcome() {
        let setup = setup(
            CannedFetcher {
                records: records(),
                fail: false,
            },
            RecordingPoster {
                posts: Mutex::new(Vec::new()),
                fail: true,
            },
            real_runner(),
        );

        let outcome = setup.orchestrator.run_update().await;
        assert_eq!(outcome.status, UpdateStatus::Failure);
        assert_eq!(outcome.charts_posted, 0);
        assert_eq!(outcome.charts_failed, 6);
    }

    #[tokio::test]
    async fn test_empty_history_fails_without_posting() {
        let setup = setup(
            CannedFetcher {
                records: Vec::new(),
                fail: false,
            },
            RecordingPoster::default(),
            real_runner(),
        );

        let outcome = setup.orchestrator.run_update().await;
        assert_eq!(outcome.status, UpdateStatus::Failure);
        assert_eq!(outcome.charts_posted, 0);
        assert_eq!(outcome.charts_failed, 6);
        assert!(setup.poster.posts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_user_charts_cover_per_user_set() {
        let setup = setup(
            CannedFetcher {
                records: records(),
                fail: false,
            },
            RecordingPoster::default(),
            real_runner(),
        );

        let charts = setup.orchestrator.render_user_charts(1).await.unwrap();
        assert_eq!(charts.len(), ChartKind::PER_USER.len());
        for (chart, path) in charts {
            assert!(ChartKind::PER_USER.contains(&chart));
            assert!(path.exists());
        }
    }

    #[tokio::test]
    async fn test_prune_respects_retention_window() {
        let setup = setup(
            CannedFetcher {
                records: records(),
                fail: false,
            },
            RecordingPoster::default(),
            real_runner(),
        );
        let dir = setup.orchestrator.settings.output_dir.clone();
        let png = dir.join("daily_play_count_20240101_000000.png");
        let note = dir.join("notes.txt");
        std::fs::write(&png, b"png").unwrap();
        std::fs::write(&note, b"keep me").unwrap();

        // Young enough to keep.
        setup.clock.set(Utc::now() + Duration::days(3));
        setup.orchestrator.prune_old_charts().await.unwrap();
        assert!(png.exists());

        // Well past the 7-day window.
        setup.clock.set(Utc::now() + Duration::days(30));
        setup.orchestrator.prune_old_charts().await.unwrap();
        assert!(!png.exists());
        assert!(note.exists());
    }
}
