use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::db::PlaySession;
use crate::models::PlayRecord;

/// Which fields make two play events the same event.
///
/// `Timestamp` treats any two plays at the same instant as one, which also
/// absorbs upstream id anomalies. `TrackAndTimestamp` only collapses the
/// same track at the same instant, and is the safer choice when the same
/// track can legitimately be queued back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    Timestamp,
    TrackAndTimestamp,
}

impl IdentityPolicy {
    /// Columns of the unique index that enforces this policy.
    pub fn conflict_columns(&self) -> &'static str {
        match self {
            IdentityPolicy::Timestamp => "played_at",
            IdentityPolicy::TrackAndTimestamp => "id, played_at",
        }
    }

    pub fn unique_index_name(&self) -> &'static str {
        match self {
            IdentityPolicy::Timestamp => "tracks_recent_played_at_key",
            IdentityPolicy::TrackAndTimestamp => "tracks_recent_id_played_at_key",
        }
    }

    pub fn other(&self) -> IdentityPolicy {
        match self {
            IdentityPolicy::Timestamp => IdentityPolicy::TrackAndTimestamp,
            IdentityPolicy::TrackAndTimestamp => IdentityPolicy::Timestamp,
        }
    }

    pub fn identity_of(&self, record: &PlayRecord) -> PlayIdentity {
        match self {
            IdentityPolicy::Timestamp => PlayIdentity::Timestamp(record.played_at),
            IdentityPolicy::TrackAndTimestamp => PlayIdentity::TrackAndTimestamp {
                track_id: record.track_id.clone(),
                played_at: record.played_at,
            },
        }
    }
}

impl FromStr for IdentityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" | "played_at" => Ok(IdentityPolicy::Timestamp),
            "track_timestamp" | "track_and_timestamp" | "id_played_at" => {
                Ok(IdentityPolicy::TrackAndTimestamp)
            }
            other => Err(format!(
                "unknown identity policy '{}', expected 'timestamp' or 'track_timestamp'",
                other
            )),
        }
    }
}

impl fmt::Display for IdentityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityPolicy::Timestamp => write!(f, "timestamp"),
            IdentityPolicy::TrackAndTimestamp => write!(f, "track_timestamp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlayIdentity {
    Timestamp(DateTime<Utc>),
    TrackAndTimestamp {
        track_id: String,
        played_at: DateTime<Utc>,
    },
}

impl PlayIdentity {
    pub fn matches(&self, record: &PlayRecord) -> bool {
        match self {
            PlayIdentity::Timestamp(played_at) => record.played_at == *played_at,
            PlayIdentity::TrackAndTimestamp {
                track_id,
                played_at,
            } => record.track_id == *track_id && record.played_at == *played_at,
        }
    }
}

/// Best-effort "already stored?" check.
///
/// Only saves work and log noise; the unique index behind
/// `insert_if_absent` is what actually prevents duplicates.
#[derive(Debug, Clone, Copy)]
pub struct DeduplicationOracle {
    policy: IdentityPolicy,
}

impl DeduplicationOracle {
    pub fn new(policy: IdentityPolicy) -> Self {
        Self { policy }
    }

    pub async fn exists<S: PlaySession>(
        &self,
        session: &mut S,
        record: &PlayRecord,
    ) -> Result<bool, crate::error::StoreError> {
        let identity = self.policy.identity_of(record);
        session.exists(&identity).await
    }
}
