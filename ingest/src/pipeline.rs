use crate::db::{PlaySession, StoreConnector};
use crate::dedup::DeduplicationOracle;
use crate::error::IngestError;
use crate::history::HistorySource;
use crate::models::{IngestionReport, InsertOutcome, RawRecord, RecordOutcome};
use crate::normalize::normalize;

/// One ingestion run: fetch, normalize, check, insert.
///
/// Records are handled one at a time in ascending `played_at` order. Only a
/// failed fetch or a failed connection ends the run early; every per-record
/// problem is logged, counted and skipped.
pub struct IngestionPipeline<S, C> {
    source: S,
    connector: C,
    limit_per_page: u32,
}

impl<S: HistorySource, C: StoreConnector> IngestionPipeline<S, C> {
    pub fn new(source: S, connector: C, limit_per_page: u32) -> Self {
        Self {
            source,
            connector,
            limit_per_page,
        }
    }

    pub async fn run(&self) -> Result<IngestionReport, IngestError> {
        let history = self.source.fetch_history(self.limit_per_page).await?;

        let mut report = IngestionReport {
            fetched: history.len(),
            ..Default::default()
        };

        if history.is_empty() {
            tracing::info!("no recent tracks found, nothing to ingest");
            return Ok(report);
        }

        let mut session = self.connector.connect().await?;
        let oracle = DeduplicationOracle::new(self.connector.identity_policy());

        for raw in &history {
            let outcome = ingest_one(&mut session, &oracle, raw).await;
            report.record(outcome);
        }

        if let Err(e) = session.close().await {
            tracing::warn!("failed to close database connection: {}", e);
        }

        tracing::info!(
            "ingestion finished: fetched={} inserted={} skipped={} malformed={} failed={}",
            report.fetched,
            report.inserted,
            report.skipped,
            report.malformed,
            report.failed
        );

        Ok(report)
    }
}

async fn ingest_one<P: PlaySession>(
    session: &mut P,
    oracle: &DeduplicationOracle,
    raw: &RawRecord,
) -> RecordOutcome {
    let record = match normalize(raw) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("skipping {}", e);
            return RecordOutcome::Malformed;
        }
    };

    match oracle.exists(session, &record).await {
        Ok(true) => {
            tracing::info!(
                "skipping {} by {} played at {}, already exists",
                record.track_name,
                record.artist(),
                record.played_at
            );
            return RecordOutcome::Duplicate;
        }
        Ok(false) => {}
        // The insert below is idempotent, so a failed check only costs a
        // redundant write attempt.
        Err(e) => tracing::warn!(
            "existence check failed for {} at {}: {}",
            record.track_id,
            record.played_at,
            e
        ),
    }

    match session.insert_if_absent(&record).await {
        Ok(InsertOutcome::Inserted) => {
            tracing::debug!(
                "inserted {} by {} played at {}",
                record.track_name,
                record.artist(),
                record.played_at
            );
            RecordOutcome::Inserted
        }
        Ok(InsertOutcome::Skipped) => {
            tracing::info!(
                "skipping {} played at {}, inserted concurrently",
                record.track_id,
                record.played_at
            );
            RecordOutcome::Duplicate
        }
        Err(e) => {
            tracing::error!(
                "failed to insert {} played at {}: {}",
                record.track_id,
                record.played_at,
                e
            );
            RecordOutcome::Failed
        }
    }
}
