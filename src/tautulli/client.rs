//! HTTP client for Tautulli with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::graphs::data::{DataFetcher, FetchError, PlayHistory, ResolvedUser};
use crate::scheduler::clock::Clock;

use super::types::{ApiEnvelope, HistoryEntry, HistoryPage, TautulliUser};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 3;
/// Rows requested per history call. Tautulli caps responses anyway; one
/// large page is plenty for the chart ranges we draw.
const HISTORY_PAGE_LENGTH: u32 = 1000;

pub struct TautulliClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl TautulliClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_retries: MAX_RETRIES,
            clock,
        })
    }

    /// One `/api/v2` call with retries on transport failures. API-level
    /// rejections (bad key, bad command) are returned immediately.
    async fn api_get<T: DeserializeOwned>(
        &self,
        cmd: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_request(cmd, params).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt <= self.max_retries && e.is_retryable() => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        "tautulli {cmd} attempt {attempt} failed ({e}), retrying in {}s",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_request<T: DeserializeOwned>(
        &self,
        cmd: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("apikey", self.api_key.clone()),
            ("cmd", cmd.to_string()),
        ];
        query.extend(params.iter().map(|(k, v)| (*k, v.clone())));

        // The api key rides in the query string; never log the full URL.
        debug!("tautulli request: cmd={cmd}");
        let response = self
            .http
            .get(format!("{}/api/v2", self.base_url))
            .query(&query)
            .send()
            .await?
            .error_for_status()?;

        let envelope: ApiEnvelope<T> = response.json().await?;
        unwrap_envelope(envelope, cmd)
    }

    async fn history(
        &self,
        range_days: u32,
        user_id: Option<u64>,
    ) -> Result<PlayHistory, FetchError> {
        let mut params = vec![
            ("length", HISTORY_PAGE_LENGTH.to_string()),
            ("order_column", "date".to_string()),
            ("order_dir", "desc".to_string()),
        ];
        if let Some(id) = user_id {
            params.push(("user_id", id.to_string()));
        }

        let page: HistoryPage = self.api_get("get_history", &params).await?;
        debug!(
            "tautulli returned {} of {} history rows",
            page.data.len(),
            page.records_filtered
        );

        let records = page.data.iter().filter_map(HistoryEntry::to_record).collect();
        Ok(PlayHistory::new(range_days, self.clock.now(), records))
    }
}

/// Pull the payload out of the response envelope, mapping Tautulli's
/// in-band errors onto [`FetchError`].
fn unwrap_envelope<T>(envelope: ApiEnvelope<T>, cmd: &str) -> Result<T, FetchError> {
    let response = envelope.response;
    if response.result != "success" {
        return Err(FetchError::Api(
            response
                .message
                .unwrap_or_else(|| format!("{cmd} failed with result {:?}", response.result)),
        ));
    }
    response
        .data
        .ok_or_else(|| FetchError::InvalidResponse(format!("{cmd} returned no data")))
}

#[async_trait]
impl DataFetcher for TautulliClient {
    async fn fetch(&self, range_days: u32) -> Result<PlayHistory, FetchError> {
        self.history(range_days, None).await
    }

    async fn fetch_for_user(
        &self,
        range_days: u32,
        user_id: u64,
    ) -> Result<PlayHistory, FetchError> {
        self.history(range_days, Some(user_id)).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<ResolvedUser>, FetchError> {
        let users: Vec<TautulliUser> = self.api_get("get_users", &[]).await?;
        Ok(users
            .into_iter()
            .find(|u| {
                u.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .map(|u| ResolvedUser {
                user_id: u.user_id,
                username: u.username,
            }))
    }
}
