use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use tgraph_bot::config::Config;
use tgraph_bot::discord::{self, DiscordPoster, InteractionState, Poster};
use tgraph_bot::graphs::data::DataFetcher;
use tgraph_bot::graphs::orchestrator::{UpdateOrchestrator, UpdateSettings};
use tgraph_bot::graphs::runner::TaskRunner;
use tgraph_bot::graphs::{BlockingTaskRunner, ChartRenderer};
use tgraph_bot::logging;
use tgraph_bot::scheduler::clock::{Clock, SystemClock};
use tgraph_bot::scheduler::tracker::UpdateRunner;
use tgraph_bot::scheduler::{FileScheduleStore, UpdateTracker};
use tgraph_bot::tautulli::TautulliClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("TGRAPH_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::from_file(&config_path)?;

    let _logging_guard = logging::init_logging("logs", "tgraph-bot", &config.log_level)?;

    info!("tgraph-bot v{} starting", env!("CARGO_PKG_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FileScheduleStore::new(&config.scheduler.state_file));

    let fetcher: Arc<dyn DataFetcher> = Arc::new(TautulliClient::new(
        &config.tautulli.url,
        &config.tautulli.api_key,
        clock.clone(),
    )?);

    let renderer = Arc::new(ChartRenderer::new(
        &config.graphs.output_dir,
        &config.graphs.colors.tv,
        &config.graphs.colors.movie,
        config.graphs.censor_usernames,
    ));

    let poster: Arc<dyn Poster> = Arc::new(DiscordPoster::new(&config.discord.token)?);

    let runner: Arc<dyn TaskRunner> = Arc::new(BlockingTaskRunner::new(Duration::from_secs(
        config.graphs.render_timeout_secs,
    )));

    let settings = UpdateSettings {
        charts: config.graphs.enabled.clone(),
        channel_id: config.discord.channel_id,
        time_range_days: config.graphs.time_range_days,
        keep_days: config.graphs.keep_days,
        output_dir: PathBuf::from(&config.graphs.output_dir),
    };
    let orchestrator = Arc::new(UpdateOrchestrator::new(
        settings,
        fetcher.clone(),
        renderer,
        poster.clone(),
        runner,
        clock.clone(),
    ));

    let tracker = UpdateTracker::restore(config.scheduler.policy, store, clock.clone()).await?;

    if let Err(e) =
        discord::interactions::register_commands(&config.discord.token, config.discord.application_id)
            .await
    {
        warn!("could not register slash commands: {e:#}");
    }

    let state = InteractionState::new(
        &config.discord.public_key,
        config.discord.application_id,
        tracker.clone(),
        orchestrator.clone(),
        fetcher,
        poster,
        clock,
    )?;

    let loop_runner: Arc<dyn UpdateRunner> = orchestrator;
    tokio::spawn(tracker.run_scheduled_loop(loop_runner));

    let webhook_port = config.discord.webhook_port;
    tokio::spawn(async move {
        if let Err(e) = discord::serve(state, webhook_port).await {
            error!("interactions server error: {e:#}");
        }
    });
    info!("interactions endpoint starting on port {webhook_port}");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    Ok(())
}
