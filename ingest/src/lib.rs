use tracing_subscriber::EnvFilter;

pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod history;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod spotify;

#[cfg(test)]
mod testing;

use config::IngestConfig;
use db::PgStoreConnector;
use error::IngestError;
use history::PagedHistory;
use models::IngestionReport;
use pipeline::IngestionPipeline;
use spotify::{build_http_client, SpotifyClient, SpotifyCredentials};

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("recent_plays=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Perform exactly one ingestion run with configuration from the environment.
pub async fn run() -> Result<IngestionReport, IngestError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = IngestConfig::from_env()?;
    run_with_config(config).await
}

pub async fn run_with_config(config: IngestConfig) -> Result<IngestionReport, IngestError> {
    tracing::info!(
        "starting ingestion run (identity policy: {}, page limit: {})",
        config.identity_policy,
        config.page_limit
    );

    let http = build_http_client(&config.spotify)?;
    let credentials = SpotifyCredentials::new(http.clone(), config.spotify.clone());
    let client = SpotifyClient::new(http, config.spotify.api_base.clone(), credentials);
    let source = PagedHistory::new(client, config.max_pages);

    let connector = PgStoreConnector::new(config.database.clone(), config.identity_policy);

    IngestionPipeline::new(source, connector, config.page_limit)
        .run()
        .await
}
