//! Posting chart files to Discord channels and DMs over the REST API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::DISCORD_API_URL;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PostError {
    #[error("discord request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("discord rejected the bot credentials: {0}")]
    Auth(String),

    #[error("discord rate limit hit, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("discord api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("could not read attachment: {0}")]
    Attachment(#[from] std::io::Error),
}

/// Outbound message delivery. Implemented against the Discord REST API;
/// tests substitute recorders.
#[async_trait]
pub trait Poster: Send + Sync {
    /// Upload a file into a channel, with `content` as the message text.
    async fn post_file(
        &self,
        channel_id: u64,
        path: &Path,
        content: &str,
    ) -> Result<(), PostError>;

    /// Open (or reuse) the DM channel with a user, returning its id.
    async fn create_dm(&self, user_id: u64) -> Result<u64, PostError>;
}

#[derive(Serialize)]
struct CreateDmRequest {
    recipient_id: String,
}

#[derive(Deserialize)]
struct ChannelRef {
    id: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

pub struct DiscordPoster {
    http: reqwest::Client,
    token: String,
}

impl DiscordPoster {
    pub fn new(token: impl Into<String>) -> Result<Self, PostError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn check(response: Response) -> Result<Response, PostError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .json::<RateLimitBody>()
                .await
                .map(|b| b.retry_after)
                .unwrap_or(1.0);
            return Err(PostError::RateLimited { retry_after_secs });
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PostError::Auth(message));
        }
        Err(PostError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// The JSON half of a file-upload message, referencing the multipart file
/// by index as the API requires.
fn message_payload(content: &str, filename: &str) -> serde_json::Value {
    serde_json::json!({
        "content": content,
        "attachments": [{ "id": 0, "filename": filename }],
    })
}

#[async_trait]
impl Poster for DiscordPoster {
    async fn post_file(
        &self,
        channel_id: u64,
        path: &Path,
        content: &str,
    ) -> Result<(), PostError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("chart.png")
            .to_string();

        let part = Part::bytes(bytes)
            .file_name(filename.clone())
            .mime_str("image/png")?;
        let form = Form::new()
            .text(
                "payload_json",
                message_payload(content, &filename).to_string(),
            )
            .part("files[0]", part);

        let response = self
            .http
            .post(format!("{DISCORD_API_URL}/channels/{channel_id}/messages"))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await?;

        debug!("posted {filename} to channel {channel_id}");
        Ok(())
    }

    async fn create_dm(&self, user_id: u64) -> Result<u64, PostError> {
        let response = self
            .http
            .post(format!("{DISCORD_API_URL}/users/@me/channels"))
            .header("Authorization", self.auth_header())
            .json(&CreateDmRequest {
                recipient_id: user_id.to_string(),
            })
            .send()
            .await?;
        let channel: ChannelRef = Self::check(response).await?.json().await?;

        channel.id.parse().map_err(|_| PostError::Api {
            status: 200,
            message: format!("unparseable dm channel id {:?}", channel.id),
        })
    }
}
