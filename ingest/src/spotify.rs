use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::SpotifyConfig;
use crate::error::IngestError;
use crate::history::{HistoryPage, PageFetcher};
use crate::models::RawRecord;

pub const REQUIRED_SCOPE: &str = "user-read-recently-played";

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 500;
/// Upper bound on any single backoff, whatever `Retry-After` asks for.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Tokens closer than this to expiry are refreshed instead of used.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (self.expires_at - now).num_seconds() > EXPIRY_MARGIN_SECS
    }
}

/// Yields a bearer token for the history API.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken, IngestError>;
}

/// On-disk token cache, compatible with the `.cache-<username>` files
/// written by spotipy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenCache {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    expires_at: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth refresh-token grant against the accounts service.
pub struct SpotifyCredentials {
    http: Client,
    config: SpotifyConfig,
    current: Mutex<Option<AccessToken>>,
}

impl SpotifyCredentials {
    pub fn new(http: Client, config: SpotifyConfig) -> Self {
        Self {
            http,
            config,
            current: Mutex::new(None),
        }
    }

    async fn resolve(&self) -> Result<AccessToken, IngestError> {
        let cache = match &self.config.token_cache {
            Some(path) => read_token_cache(path)
                .await
                .map_err(|e| IngestError::Authentication(format!("{:#}", e)))?,
            None => None,
        };

        if let Some(cache) = &cache {
            if let Some(token) = usable_cached_token(cache, Utc::now())? {
                tracing::debug!("using cached access token");
                return Ok(token);
            }
        }

        let refresh_token = self
            .config
            .refresh_token
            .clone()
            .or_else(|| cache.as_ref().and_then(|c| c.refresh_token.clone()))
            .ok_or_else(|| IngestError::Authentication("no refresh token available".to_string()))?;

        let response = self.refresh(&refresh_token).await?;
        check_scope(response.scope.as_deref())?;

        let expires_at = Utc::now() + chrono::Duration::seconds(response.expires_in);
        let token = AccessToken {
            value: response.access_token.clone(),
            expires_at,
        };

        if let Some(path) = &self.config.token_cache {
            let updated = TokenCache {
                access_token: response.access_token,
                token_type: response.token_type,
                expires_in: Some(response.expires_in),
                scope: response.scope,
                expires_at: expires_at.timestamp(),
                refresh_token: response.refresh_token.or(Some(refresh_token)),
            };
            if let Err(e) = write_token_cache(path, &updated).await {
                tracing::warn!("failed to update token cache: {:#}", e);
            }
        }

        tracing::info!("refreshed spotify access token");
        Ok(token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, IngestError> {
        let auth = format!("{}:{}", self.config.client_id, self.config.client_secret);
        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, auth.as_bytes());

        let response = self
            .http
            .post(format!("{}/api/token", self.config.accounts_base))
            .header("Authorization", format!("Basic {}", encoded))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Authentication(format!(
                "token refresh rejected: {} {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(IngestError::Fetch(format!("token endpoint returned {}", status)));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CredentialProvider for SpotifyCredentials {
    async fn access_token(&self) -> Result<AccessToken, IngestError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let token = self.resolve().await?;
        *current = Some(token.clone());
        Ok(token)
    }
}

fn check_scope(scope: Option<&str>) -> Result<(), IngestError> {
    match scope {
        Some(scope) if !scope.split_whitespace().any(|s| s == REQUIRED_SCOPE) => {
            Err(IngestError::Authentication(format!(
                "token scope '{}' does not include {}",
                scope, REQUIRED_SCOPE
            )))
        }
        _ => Ok(()),
    }
}

fn usable_cached_token(
    cache: &TokenCache,
    now: DateTime<Utc>,
) -> Result<Option<AccessToken>, IngestError> {
    check_scope(cache.scope.as_deref())?;

    let Some(expires_at) = DateTime::<Utc>::from_timestamp(cache.expires_at, 0) else {
        return Ok(None);
    };
    let token = AccessToken {
        value: cache.access_token.clone(),
        expires_at,
    };

    Ok(token.is_fresh(now).then_some(token))
}

async fn read_token_cache(path: &Path) -> anyhow::Result<Option<TokenCache>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let cache: TokenCache =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(cache))
}

async fn write_token_cache(path: &Path, cache: &TokenCache) -> anyhow::Result<()> {
    let data = serde_json::to_string(cache)?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Unauthorized,
    Retryable,
    Failed,
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ResponseClass::Unauthorized
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ResponseClass::Retryable
    } else {
        ResponseClass::Failed
    }
}

fn retry_delay(retry_after: Option<&HeaderValue>, attempt: u32) -> Duration {
    retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_millis(BASE_DELAY_MS * 2_u64.pow(attempt)))
        .min(MAX_RETRY_DELAY)
}

pub fn build_http_client(config: &SpotifyConfig) -> Result<Client, IngestError> {
    Client::builder()
        .timeout(config.http_timeout)
        .user_agent(concat!("recent-plays/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| IngestError::Config(format!("failed to build http client: {}", e)))
}

/// Pages through `/me/player/recently-played`.
pub struct SpotifyClient<C> {
    http: Client,
    api_base: String,
    credentials: C,
}

impl<C: CredentialProvider> SpotifyClient<C> {
    pub fn new(http: Client, api_base: impl Into<String>, credentials: C) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            credentials,
        }
    }
}

#[async_trait]
impl<C: CredentialProvider> PageFetcher for SpotifyClient<C> {
    async fn fetch_page(&self, cursor: Option<&str>, limit: u32) -> Result<HistoryPage, IngestError> {
        let token = self.credentials.access_token().await?;

        for attempt in 0..MAX_ATTEMPTS {
            let request = match cursor {
                Some(next) => self.http.get(next),
                None => self
                    .http
                    .get(format!("{}/me/player/recently-played", self.api_base))
                    .query(&[("limit", limit)]),
            };

            let response = request.bearer_auth(&token.value).send().await?;
            let status = response.status();

            match classify_status(status) {
                ResponseClass::Success => {
                    let page: RecentlyPlayedResponse = response
                        .json()
                        .await
                        .map_err(|e| IngestError::Fetch(format!("undecodable page: {}", e)))?;
                    return Ok(HistoryPage {
                        items: page.items.into_iter().map(RawRecord).collect(),
                        next: page.next,
                    });
                }
                ResponseClass::Unauthorized => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(IngestError::Authentication(format!(
                        "history request rejected: {} {}",
                        status, body
                    )));
                }
                ResponseClass::Retryable if attempt + 1 < MAX_ATTEMPTS => {
                    let delay = retry_delay(response.headers().get(RETRY_AFTER), attempt);
                    tracing::warn!(
                        "history request attempt {}/{} returned {}, retrying in {:?}",
                        attempt + 1,
                        MAX_ATTEMPTS,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(IngestError::Fetch(format!("{} {}", status, body)));
                }
            }
        }

        Err(IngestError::Fetch(format!(
            "history request failed after {} attempts",
            MAX_ATTEMPTS
        )))
    }
}
