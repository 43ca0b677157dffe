//! Slash-command endpoint for Discord interactions.
//!
//! Discord POSTs every interaction to this webhook and requires the
//! Ed25519 signature check on each request; replies that need real work
//! are deferred and filled in through the followup endpoint once the work
//! is done.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::graphs::data::DataFetcher;
use crate::graphs::UpdateOrchestrator;
use crate::scheduler::clock::Clock;
use crate::scheduler::tracker::{TrackerError, UpdateRunner, UpdateTracker};

use super::poster::Poster;
use super::DISCORD_API_URL;

const INTERACTION_PING: u8 = 1;
const INTERACTION_APPLICATION_COMMAND: u8 = 2;

const RESPONSE_PONG: u8 = 1;
const RESPONSE_MESSAGE: u8 = 4;
const RESPONSE_DEFERRED: u8 = 5;

const FLAG_EPHEMERAL: u64 = 64;
const PERMISSION_ADMINISTRATOR: u64 = 0x8;

/// Personal stats rendering is expensive; one request per user per window.
const STATS_COOLDOWN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
struct Interaction {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    token: String,
    #[serde(default)]
    data: Option<CommandData>,
    #[serde(default)]
    member: Option<Member>,
    #[serde(default)]
    user: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommandData {
    name: String,
    #[serde(default)]
    options: Vec<CommandOption>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommandOption {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct Member {
    /// Resolved permission bits, sent as a decimal string.
    #[serde(default)]
    permissions: String,
    #[serde(default)]
    user: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
struct User {
    id: String,
    #[serde(default)]
    username: String,
}

pub struct InteractionState {
    verify_key: VerifyingKey,
    application_id: u64,
    tracker: Arc<UpdateTracker>,
    orchestrator: Arc<UpdateOrchestrator>,
    fetcher: Arc<dyn DataFetcher>,
    poster: Arc<dyn Poster>,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    stats_requests: Mutex<HashMap<u64, DateTime<Utc>>>,
    http: reqwest::Client,
}

impl InteractionState {
    pub fn new(
        public_key_hex: &str,
        application_id: u64,
        tracker: Arc<UpdateTracker>,
        orchestrator: Arc<UpdateOrchestrator>,
        fetcher: Arc<dyn DataFetcher>,
        poster: Arc<dyn Poster>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Arc<Self>> {
        let verify_key = parse_public_key(public_key_hex)?;
        let started_at = clock.now();
        Ok(Arc::new(Self {
            verify_key,
            application_id,
            tracker,
            orchestrator,
            fetcher,
            poster,
            clock,
            started_at,
            stats_requests: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }))
    }
}

/// Decode the application public key Discord shows in the developer
/// portal.
pub fn parse_public_key(hex_key: &str) -> anyhow::Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim()).context("discord public key is not valid hex")?;
    let key_bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("discord public key must be 32 bytes, got {}", bytes.len()))?;
    VerifyingKey::from_bytes(&key_bytes).context("discord public key is not a valid ed25519 key")
}

/// Check the `X-Signature-Ed25519` header over `timestamp + body`.
fn verify_signature(
    key: &VerifyingKey,
    sig_hex: &str,
    timestamp: &str,
    body: &str,
) -> anyhow::Result<()> {
    let sig_bytes = hex::decode(sig_hex).map_err(|e| anyhow!("bad signature hex: {e}"))?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|e| anyhow!("bad signature format: {e}"))?;

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body.as_bytes());

    key.verify(&message, &signature)
        .map_err(|e| anyhow!("signature mismatch: {e}"))
}

async fn handle_interaction(
    State(state): State<Arc<InteractionState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let sig_header = headers
        .get("X-Signature-Ed25519")
        .and_then(|v| v.to_str().ok());
    let timestamp_header = headers
        .get("X-Signature-Timestamp")
        .and_then(|v| v.to_str().ok());

    let (sig_hex, timestamp) = match (sig_header, timestamp_header) {
        (Some(s), Some(t)) => (s, t),
        _ => {
            warn!("interaction without signature headers");
            return (StatusCode::UNAUTHORIZED, "Missing signature headers").into_response();
        }
    };

    if let Err(e) = verify_signature(&state.verify_key, sig_hex, timestamp, &body) {
        warn!("interaction signature rejected: {e}");
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }

    let interaction: Interaction = match serde_json::from_str(&body) {
        Ok(i) => i,
        Err(e) => {
            error!("could not parse interaction: {e}");
            return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response();
        }
    };

    match interaction.kind {
        INTERACTION_PING => Json(json!({ "type": RESPONSE_PONG })).into_response(),
        INTERACTION_APPLICATION_COMMAND => dispatch_command(state, interaction).await,
        other => {
            warn!("unsupported interaction type {other}");
            (StatusCode::BAD_REQUEST, "Unsupported interaction type").into_response()
        }
    }
}

async fn dispatch_command(state: Arc<InteractionState>, interaction: Interaction) -> Response {
    let Some(data) = interaction.data.clone() else {
        return (StatusCode::BAD_REQUEST, "Missing command data").into_response();
    };

    let requester = requester(&interaction);
    info!(
        "command /{} from {}",
        data.name,
        requester
            .as_ref()
            .map(|(_, name)| name.as_str())
            .unwrap_or("unknown")
    );

    match data.name.as_str() {
        "update_graphs" => handle_update_graphs(state, interaction),
        "my_stats" => handle_my_stats(state, interaction, &data).await,
        "next_update" => handle_next_update(&state).await,
        "uptime" => handle_uptime(&state),
        "about" => reply(&about_text()),
        other => {
            warn!("unknown command /{other}");
            reply_ephemeral("Unknown command.")
        }
    }
}

fn handle_update_graphs(state: Arc<InteractionState>, interaction: Interaction) -> Response {
    if !has_admin_permission(&interaction) {
        return reply_ephemeral("You need the Administrator permission to run this.");
    }

    let token = interaction.token.clone();
    tokio::spawn(async move {
        let runner: Arc<dyn UpdateRunner> = state.orchestrator.clone();
        let content = match state.tracker.force_update_now(runner).await {
            Ok(outcome) => outcome.summary(),
            Err(TrackerError::AlreadyRunning) => {
                "An update is already in progress, try again when it finishes.".to_string()
            }
            Err(e) => {
                error!("manual update failed to start: {e}");
                "The update could not be started.".to_string()
            }
        };
        edit_original(&state, &token, &content).await;
    });

    deferred(false)
}

async fn handle_my_stats(
    state: Arc<InteractionState>,
    interaction: Interaction,
    data: &CommandData,
) -> Response {
    let Some(email) = option_str(data, "email").map(str::to_string) else {
        return reply_ephemeral("Give the email tied to your Plex account.");
    };
    let Some((discord_user_id, _)) = requester(&interaction) else {
        return reply_ephemeral("Could not tell who sent this command.");
    };

    if let Some(minutes) = stats_cooldown_remaining(&state, discord_user_id).await {
        return reply_ephemeral(&format!(
            "You asked for stats recently. Try again in about {minutes} minute(s)."
        ));
    }

    let token = interaction.token.clone();
    tokio::spawn(async move {
        let content = run_my_stats(&state, &email, discord_user_id).await;
        edit_original(&state, &token, &content).await;
    });

    deferred(true)
}

/// Stamps the request when the user is clear to go; otherwise returns the
/// minutes left on their cooldown.
async fn stats_cooldown_remaining(state: &InteractionState, user_id: u64) -> Option<i64> {
    let now = state.clock.now();
    let mut requests = state.stats_requests.lock().await;
    let left = cooldown_minutes_left(requests.get(&user_id), now);
    if left.is_none() {
        requests.insert(user_id, now);
    }
    left
}

fn cooldown_minutes_left(last: Option<&DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    let last = last?;
    let window = Duration::minutes(STATS_COOLDOWN_MINUTES);
    let elapsed = now - *last;
    if elapsed >= window {
        return None;
    }
    Some(((window - elapsed).num_seconds() as u64).div_ceil(60) as i64)
}

/// The slow half of `/my_stats`: resolve the user, render their charts and
/// DM them over. Returns the followup text.
async fn run_my_stats(state: &InteractionState, email: &str, discord_user_id: u64) -> String {
    let user = match state.fetcher.find_user_by_email(email).await {
        Ok(Some(user)) => user,
        Ok(None) => return "No Plex user matches that email.".to_string(),
        Err(e) => {
            error!("user lookup failed: {e}");
            return "Could not reach Tautulli, try again later.".to_string();
        }
    };

    let charts = match state.orchestrator.render_user_charts(user.user_id).await {
        Ok(charts) if charts.is_empty() => {
            return format!("No plays found for {} in the current range.", user.username);
        }
        Ok(charts) => charts,
        Err(e) => {
            error!("stats render for {} failed: {e}", user.username);
            return "Could not build your charts, try again later.".to_string();
        }
    };

    let dm_channel = match state.poster.create_dm(discord_user_id).await {
        Ok(id) => id,
        Err(e) => {
            warn!("could not open dm with {discord_user_id}: {e}");
            return "Could not open a DM with you. Do you allow DMs from members of this server?"
                .to_string();
        }
    };

    let mut sent = 0;
    for (chart, path) in &charts {
        match state
            .poster
            .post_file(dm_channel, path, &format!("**{}**", chart.title()))
            .await
        {
            Ok(()) => sent += 1,
            Err(e) => error!("dm post of {chart} failed: {e}"),
        }
    }
    format!("Sent {sent} chart(s) to your DMs.")
}

async fn handle_next_update(state: &InteractionState) -> Response {
    let status = state.tracker.status().await;
    let mut content = format!(
        "Next update: {} ({}).",
        status.next_run_at.format("%Y-%m-%d %H:%M UTC"),
        status.policy
    );
    if status.running {
        content.push_str(" An update is running right now.");
    }
    if let Some(last) = status.last_run_at {
        content.push_str(&format!(
            " Last run finished {}.",
            last.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    if status.consecutive_failures > 0 {
        content.push_str(&format!(
            " {} consecutive failure(s) so far.",
            status.consecutive_failures
        ));
    }
    reply_ephemeral(&content)
}

fn handle_uptime(state: &InteractionState) -> Response {
    let up = state.clock.now() - state.started_at;
    reply_ephemeral(&format!("Up for {}.", format_duration(up)))
}

fn about_text() -> String {
    format!(
        "tgraph-bot v{} - posts Plex watch-statistics charts from Tautulli on a schedule. \
         Commands: /update_graphs, /my_stats, /next_update, /uptime, /about.",
        env!("CARGO_PKG_VERSION")
    )
}

/// Edit the deferred response once the real answer exists. Best effort;
/// the interaction token expires after 15 minutes anyway.
async fn edit_original(state: &InteractionState, token: &str, content: &str) {
    let url = format!(
        "{DISCORD_API_URL}/webhooks/{}/{token}/messages/@original",
        state.application_id
    );
    match state
        .http
        .patch(&url)
        .json(&json!({ "content": content }))
        .send()
        .await
    {
        Ok(response) if !response.status().is_success() => {
            warn!("followup edit failed with {}", response.status());
        }
        Err(e) => warn!("followup edit failed: {e}"),
        _ => {}
    }
}

fn has_admin_permission(interaction: &Interaction) -> bool {
    interaction
        .member
        .as_ref()
        .and_then(|m| m.permissions.parse::<u64>().ok())
        .is_some_and(|bits| bits & PERMISSION_ADMINISTRATOR != 0)
}

/// Discord id and username of whoever invoked the command, whether it came
/// from a guild or a DM.
fn requester(interaction: &Interaction) -> Option<(u64, String)> {
    let user = interaction
        .member
        .as_ref()
        .and_then(|m| m.user.as_ref())
        .or(interaction.user.as_ref())?;
    let id = user.id.parse().ok()?;
    Some((id, user.username.clone()))
}

fn option_str<'a>(data: &'a CommandData, name: &str) -> Option<&'a str> {
    data.options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_str())
}

fn reply(content: &str) -> Response {
    Json(json!({
        "type": RESPONSE_MESSAGE,
        "data": { "content": content },
    }))
    .into_response()
}

fn reply_ephemeral(content: &str) -> Response {
    Json(json!({
        "type": RESPONSE_MESSAGE,
        "data": { "content": content, "flags": FLAG_EPHEMERAL },
    }))
    .into_response()
}

fn deferred(ephemeral: bool) -> Response {
    let mut data = json!({});
    if ephemeral {
        data = json!({ "flags": FLAG_EPHEMERAL });
    }
    Json(json!({ "type": RESPONSE_DEFERRED, "data": data })).into_response()
}

fn format_duration(d: chrono::Duration) -> String {
    let days = d.num_days();
    let hours = d.num_hours() % 24;
    let minutes = d.num_minutes() % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// The commands this bot answers, in the bulk-overwrite shape Discord
/// expects.
fn command_catalog() -> Vec<serde_json::Value> {
    vec![
        json!({
            "name": "update_graphs",
            "description": "Render and post fresh charts now",
            "default_member_permissions": PERMISSION_ADMINISTRATOR.to_string(),
        }),
        json!({
            "name": "my_stats",
            "description": "Get your personal watch stats by DM",
            "options": [{
                "type": 3,
                "name": "email",
                "description": "Email on your Plex account",
                "required": true,
            }],
        }),
        json!({
            "name": "next_update",
            "description": "When the next scheduled update runs",
        }),
        json!({
            "name": "uptime",
            "description": "How long the bot has been running",
        }),
        json!({
            "name": "about",
            "description": "What this bot does",
        }),
    ]
}

/// Bulk-overwrite the application's global slash commands.
pub async fn register_commands(token: &str, application_id: u64) -> anyhow::Result<()> {
    let commands = command_catalog();
    let url = format!("{DISCORD_API_URL}/applications/{application_id}/commands");

    let response = reqwest::Client::new()
        .put(&url)
        .header("Authorization", format!("Bot {token}"))
        .json(&commands)
        .send()
        .await
        .context("command registration request failed")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("command registration failed with {status}: {body}");
    }

    info!("registered {} slash commands", commands.len());
    Ok(())
}

/// Serve the interactions endpoint until the process exits.
pub async fn serve(state: Arc<InteractionState>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/interactions", post(handle_interaction))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    info!("interactions endpoint listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
