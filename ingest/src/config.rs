use std::path::PathBuf;
use std::time::Duration;

use crate::dedup::IdentityPolicy;
use crate::error::IngestError;

/// Largest page the recently-played endpoint will serve.
pub const MAX_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
    pub token_cache: Option<PathBuf>,
    pub api_base: String,
    pub accounts_base: String,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

/// Everything a run needs, read once at startup.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub spotify: SpotifyConfig,
    pub database: DatabaseConfig,
    pub identity_policy: IdentityPolicy,
    pub page_limit: u32,
    pub max_pages: usize,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| IngestError::Config(format!("{} is not set", key)))
        };

        let refresh_token = lookup("SPOTIFY_REFRESH_TOKEN");
        let token_cache = lookup("SPOTIFY_TOKEN_CACHE")
            .map(PathBuf::from)
            .or_else(|| lookup("SPOTIFY_USERNAME").map(|user| PathBuf::from(format!(".cache-{}", user))));

        if refresh_token.is_none() && token_cache.is_none() {
            return Err(IngestError::Config(
                "set SPOTIFY_REFRESH_TOKEN, SPOTIFY_TOKEN_CACHE or SPOTIFY_USERNAME".to_string(),
            ));
        }

        let spotify = SpotifyConfig {
            client_id: required("SPOTIFY_CLIENT_ID")?,
            client_secret: required("SPOTIFY_CLIENT_SECRET")?,
            refresh_token,
            token_cache,
            api_base: lookup("SPOTIFY_API_BASE")
                .unwrap_or_else(|| "https://api.spotify.com/v1".to_string()),
            accounts_base: lookup("SPOTIFY_ACCOUNTS_BASE")
                .unwrap_or_else(|| "https://accounts.spotify.com".to_string()),
            http_timeout: Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECS", 20)?),
        };

        let database = DatabaseConfig {
            url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgresql://localhost/recent_plays".to_string()),
            connect_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DATABASE_CONNECT_TIMEOUT_SECS",
                30,
            )?),
        };

        let identity_policy = match lookup("IDENTITY_POLICY") {
            Some(value) => value.parse().map_err(IngestError::Config)?,
            None => {
                tracing::warn!("IDENTITY_POLICY not set, defaulting to 'timestamp'");
                IdentityPolicy::Timestamp
            }
        };

        let requested: u32 = parse_or(&lookup, "HISTORY_PAGE_LIMIT", MAX_PAGE_LIMIT)?;
        let page_limit = requested.clamp(1, MAX_PAGE_LIMIT);
        if page_limit != requested {
            tracing::warn!(
                "HISTORY_PAGE_LIMIT {} out of range, using {}",
                requested,
                page_limit
            );
        }

        let max_pages: usize = parse_or(&lookup, "HISTORY_MAX_PAGES", 20)?;
        if max_pages == 0 {
            return Err(IngestError::Config(
                "HISTORY_MAX_PAGES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            spotify,
            database,
            identity_policy,
            page_limit,
            max_pages,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, IngestError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| IngestError::Config(format!("{} must be a number, got '{}'", key, value))),
        None => Ok(default),
    }
}
