//! Fakes for the upstream feed and the store, shared by the unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use crate::db::{PlaySession, StoreConnector};
use crate::dedup::{IdentityPolicy, PlayIdentity};
use crate::error::{IngestError, StoreError};
use crate::history::{HistoryPage, PageFetcher};
use crate::models::{InsertOutcome, PlayRecord, RawRecord};

pub fn play(track_id: &str, played_at: &str) -> RawRecord {
    RawRecord(json!({
        "played_at": played_at,
        "track": {
            "id": track_id,
            "name": format!("Song {}", track_id),
            "artists": [{"name": "Artist"}],
            "album": {"name": "Album"}
        }
    }))
}

/// `n` seconds after a fixed base instant, in the provider's format.
pub fn stamp(n: usize) -> String {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    (base + Duration::seconds(n as i64))
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

#[derive(Default)]
struct FakePagesState {
    pages: Vec<Vec<RawRecord>>,
    looping: bool,
    error: Option<IngestError>,
    requests: Vec<Option<String>>,
    limits: Vec<u32>,
}

/// Serves canned pages linked by `page-N` cursors.
#[derive(Clone, Default)]
pub struct FakePages {
    state: Arc<Mutex<FakePagesState>>,
}

impl FakePages {
    pub fn new(pages: Vec<Vec<RawRecord>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakePagesState {
                pages,
                ..Default::default()
            })),
        }
    }

    /// `pages` pages of `per_page` distinct plays, newest first like the
    /// real feed.
    pub fn generated(pages: usize, per_page: usize) -> Self {
        let total = pages * per_page;
        let items: Vec<RawRecord> = (0..total)
            .map(|i| {
                let n = total - 1 - i;
                play(&format!("track-{}", n), &stamp(n))
            })
            .collect();
        Self::new(items.chunks(per_page).map(|c| c.to_vec()).collect())
    }

    /// Always answers with the same page and the same cursor.
    pub fn looping(items: Vec<RawRecord>) -> Self {
        let fake = Self::new(vec![items]);
        fake.state.lock().unwrap().looping = true;
        fake
    }

    pub fn failing(error: IngestError) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().error = Some(error);
        fake
    }

    pub fn requests(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn limits(&self) -> Vec<u32> {
        self.state.lock().unwrap().limits.clone()
    }
}

#[async_trait]
impl PageFetcher for FakePages {
    async fn fetch_page(&self, cursor: Option<&str>, limit: u32) -> Result<HistoryPage, IngestError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(cursor.map(String::from));
        state.limits.push(limit);

        if let Some(error) = state.error.take() {
            return Err(error);
        }
        if state.looping {
            return Ok(HistoryPage {
                items: state.pages[0].clone(),
                next: Some("page-loop".to_string()),
            });
        }

        let index = match cursor {
            None => 0,
            Some(c) => c
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| IngestError::Fetch(format!("unknown cursor {}", c)))?,
        };
        let items = state.pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < state.pages.len()).then(|| format!("page-{}", index + 1));

        Ok(HistoryPage { items, next })
    }
}

#[derive(Default)]
pub struct MemoryState {
    pub rows: Vec<PlayRecord>,
    pub connections: usize,
    pub closed: usize,
    pub exists_checks: usize,
    pub refuse_connections: bool,
    pub failing_exists: bool,
    pub fail_track_ids: HashSet<String>,
    pub fail_after_inserts: Option<usize>,
}

/// In-memory table enforcing the same uniqueness rule as the real index.
#[derive(Clone)]
pub struct MemoryConnector {
    policy: IdentityPolicy,
    pub state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new(policy: IdentityPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn rows(&self) -> Vec<PlayRecord> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn exists_checks(&self) -> usize {
        self.state.lock().unwrap().exists_checks
    }

    /// Number of rows sharing an identity with an earlier row.
    pub fn identity_violations(&self) -> usize {
        let rows = self.rows();
        let mut seen = HashSet::new();
        rows.iter()
            .filter(|r| !seen.insert(self.policy.identity_of(r)))
            .count()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Session = MemorySession;

    fn identity_policy(&self) -> IdentityPolicy {
        self.policy
    }

    async fn connect(&self) -> Result<MemorySession, IngestError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connections {
            return Err(IngestError::Connection(StoreError::Rejected(
                "connection refused".to_string(),
            )));
        }
        state.connections += 1;
        Ok(MemorySession {
            policy: self.policy,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MemorySession {
    policy: IdentityPolicy,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl PlaySession for MemorySession {
    async fn exists(&mut self, identity: &PlayIdentity) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.exists_checks += 1;
        if state.failing_exists {
            return Err(StoreError::Rejected("exists check failed".to_string()));
        }
        Ok(state.rows.iter().any(|r| identity.matches(r)))
    }

    async fn insert_if_absent(&mut self, record: &PlayRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().unwrap();
        let exhausted = state
            .fail_after_inserts
            .is_some_and(|limit| state.rows.len() >= limit);
        if exhausted || state.fail_track_ids.contains(&record.track_id) {
            return Err(StoreError::Rejected(format!(
                "simulated failure for {}",
                record.track_id
            )));
        }

        let identity = self.policy.identity_of(record);
        if state.rows.iter().any(|r| identity.matches(r)) {
            return Ok(InsertOutcome::Skipped);
        }
        state.rows.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn close(self) -> Result<(), StoreError> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }
}
