use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::Connection;

use crate::config::DatabaseConfig;
use crate::dedup::{IdentityPolicy, PlayIdentity};
use crate::error::{IngestError, StoreError};
use crate::models::{InsertOutcome, PlayRecord};

/// Opens the single connection a run writes through.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Session: PlaySession;

    /// The policy enforced by this store's unique constraint. The pipeline
    /// derives its existence check from it.
    fn identity_policy(&self) -> IdentityPolicy;

    async fn connect(&self) -> Result<Self::Session, IngestError>;
}

/// An open store connection, owned by one run.
#[async_trait]
pub trait PlaySession: Send {
    async fn exists(&mut self, identity: &PlayIdentity) -> Result<bool, StoreError>;

    /// Insert in its own transaction; a conflicting row is a silent no-op.
    async fn insert_if_absent(&mut self, record: &PlayRecord) -> Result<InsertOutcome, StoreError>;

    async fn close(self) -> Result<(), StoreError>;
}

pub struct PgStoreConnector {
    config: DatabaseConfig,
    policy: IdentityPolicy,
}

impl PgStoreConnector {
    pub fn new(config: DatabaseConfig, policy: IdentityPolicy) -> Self {
        Self { config, policy }
    }
}

#[async_trait]
impl StoreConnector for PgStoreConnector {
    type Session = PgPlaySession;

    fn identity_policy(&self) -> IdentityPolicy {
        self.policy
    }

    async fn connect(&self) -> Result<PgPlaySession, IngestError> {
        let timeout = self.config.connect_timeout;
        let mut conn =
            match tokio::time::timeout(timeout, PgConnection::connect(&self.config.url)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(IngestError::Connection(e.into())),
                Err(_) => {
                    return Err(IngestError::Connection(StoreError::Timeout(
                        timeout.as_secs(),
                    )))
                }
            };

        if let Err(e) = ensure_schema(&mut conn, self.policy).await {
            if let Err(close_err) = conn.close().await {
                tracing::warn!("failed to close connection after schema error: {}", close_err);
            }
            return Err(e);
        }

        tracing::info!("database connection established");

        Ok(PgPlaySession {
            conn,
            insert_sql: insert_statement(self.policy),
        })
    }
}

fn insert_statement(policy: IdentityPolicy) -> String {
    format!(
        r#"
        INSERT INTO tracks_recent (id, track_name, artist, album, played_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT ({}) DO NOTHING
        "#,
        policy.conflict_columns()
    )
}

/// Advisory lock held while the identity index is checked and created.
const SCHEMA_LOCK_KEY: i64 = 0x7265_6370_6c61_7973;

/// Run migrations and install the unique index for `policy`, refusing a table
/// that is already constrained by the other policy.
async fn ensure_schema(conn: &mut PgConnection, policy: IdentityPolicy) -> Result<(), IngestError> {
    sqlx::migrate!("./migrations")
        .run_direct(&mut *conn)
        .await
        .map_err(|e| IngestError::Schema(format!("migration failed: {}", e)))?;

    // Concurrent first runs queue here; the loser then finds the index built.
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| IngestError::Connection(e.into()))?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(|e| IngestError::Connection(e.into()))?;

    let conflicting: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM pg_indexes
            WHERE schemaname = current_schema()
              AND tablename = 'tracks_recent'
              AND indexname = $1
        )
        "#,
    )
    .bind(policy.other().unique_index_name())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| IngestError::Connection(e.into()))?;

    if conflicting {
        return Err(IngestError::Schema(format!(
            "tracks_recent is constrained by the '{}' identity policy but '{}' is configured",
            policy.other(),
            policy
        )));
    }

    let ddl = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON tracks_recent ({})",
        policy.unique_index_name(),
        policy.conflict_columns()
    );
    sqlx::query(&ddl)
        .execute(&mut *tx)
        .await
        .map_err(|e| IngestError::Schema(format!("failed to create {}: {}", policy.unique_index_name(), e)))?;

    tx.commit()
        .await
        .map_err(|e| IngestError::Schema(format!("failed to commit schema changes: {}", e)))?;

    Ok(())
}

pub struct PgPlaySession {
    conn: PgConnection,
    insert_sql: String,
}

#[async_trait]
impl PlaySession for PgPlaySession {
    async fn exists(&mut self, identity: &PlayIdentity) -> Result<bool, StoreError> {
        let found = match identity {
            PlayIdentity::Timestamp(played_at) => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM tracks_recent WHERE played_at = $1)",
                )
                .bind(played_at)
                .fetch_one(&mut self.conn)
                .await?
            }
            PlayIdentity::TrackAndTimestamp {
                track_id,
                played_at,
            } => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS (SELECT 1 FROM tracks_recent WHERE id = $1 AND played_at = $2)",
                )
                .bind(track_id)
                .bind(played_at)
                .fetch_one(&mut self.conn)
                .await?
            }
        };

        Ok(found)
    }

    async fn insert_if_absent(&mut self, record: &PlayRecord) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.conn.begin().await?;

        let result = sqlx::query(&self.insert_sql)
            .bind(&record.track_id)
            .bind(&record.track_name)
            .bind(record.artist())
            .bind(&record.album_name)
            .bind(record.played_at)
            .execute(&mut *tx)
            .await;

        match result {
            Ok(done) => {
                tx.commit().await?;
                if done.rows_affected() == 0 {
                    Ok(InsertOutcome::Skipped)
                } else {
                    Ok(InsertOutcome::Inserted)
                }
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(
                        "failed to roll back insert for {} at {}: {}",
                        record.track_id,
                        record.played_at,
                        rollback_err
                    );
                }
                Err(e.into())
            }
        }
    }

    async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}
