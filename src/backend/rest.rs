//! Fetcher for a PostgREST endpoint exposing the `pomodoro_rooms` and
//! `user_stats` tables.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;

use crate::error::{TimerError, TimerResult};
use crate::models::{ParticipantId, RoomSnapshot, Session, UserStatsSnapshot};
use crate::settings::BackendSettings;

use super::rows::{DurationUnit, RoomRow, UserStatsRow};
use super::SnapshotFetcher;

const ROOMS_TABLE: &str = "pomodoro_rooms";
const STATS_TABLE: &str = "user_stats";
const MAX_LOG_BODY_CHARS: usize = 512;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

fn classify_transport(err: reqwest::Error) -> TimerError {
    if is_retryable_transport_error(&err) {
        TimerError::Transient(err.to_string())
    } else {
        TimerError::Backend(err.to_string())
    }
}

fn log_response(table: &str, status: reqwest::StatusCode, body: &str) {
    if status.is_success() {
        debug!("{table} response status: {status}");
        return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("{table} response error ({status}): {preview}");
}

#[derive(Debug, Clone)]
pub struct RestFetcher {
    client: reqwest::Client,
    base_url: String,
    room_id: Option<i64>,
    duration_unit: DurationUnit,
}

impl RestFetcher {
    pub fn new(backend: &BackendSettings, session: &Session, timeout: Duration) -> Result<Self> {
        let base_url = backend.url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("backend url is not configured");
        }
        if backend.anon_key.trim().is_empty() {
            bail!("backend anon key is not configured");
        }

        let bearer = session
            .access_token
            .as_deref()
            .unwrap_or(backend.anon_key.as_str());

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&backend.anon_key).context("anon key is not a valid header")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer}"))
                .context("access token is not a valid header")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            room_id: backend.room_id,
            duration_unit: backend.duration_unit,
        })
    }

    fn room_query(&self) -> Vec<(&'static str, String)> {
        match self.room_id {
            Some(room_id) => vec![("select", "*".into()), ("room_id", format!("eq.{room_id}"))],
            None => vec![
                ("select", "*".into()),
                ("order", "started_at.desc".into()),
                ("limit", "1".into()),
            ],
        }
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&'static str, String)],
    ) -> TimerResult<Vec<T>> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        log_response(table, status, &body);

        if !status.is_success() {
            let message = format!("{table} returned {status}");
            return Err(if is_retryable_status(status.as_u16()) {
                TimerError::Transient(message)
            } else {
                TimerError::Backend(message)
            });
        }

        serde_json::from_str(&body)
            .map_err(|err| TimerError::invalid(format!("{table} rows did not decode: {err}")))
    }
}

#[async_trait]
impl SnapshotFetcher for RestFetcher {
    async fn fetch_room_snapshot(&self) -> TimerResult<Option<RoomSnapshot>> {
        let rows: Vec<RoomRow> = self.get_rows(ROOMS_TABLE, &self.room_query()).await?;
        rows.into_iter()
            .next()
            .map(|row| row.into_snapshot(self.duration_unit))
            .transpose()
    }

    async fn fetch_user_stats(
        &self,
        participant: &ParticipantId,
    ) -> TimerResult<Option<UserStatsSnapshot>> {
        let query = [
            ("select", "*".to_string()),
            ("user_id", format!("eq.{participant}")),
        ];
        let rows: Vec<UserStatsRow> = self.get_rows(STATS_TABLE, &query).await?;
        rows.into_iter()
            .next()
            .map(|row| row.into_stats(participant.clone()))
            .transpose()
    }
}
