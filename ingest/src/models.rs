use chrono::{DateTime, Utc};

/// One item of the recently-played feed, exactly as the provider sent it.
///
/// Kept as loose JSON so that a single oddly shaped item cannot fail the
/// decoding of a whole page; the normalizer picks the fields it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord(pub serde_json::Value);

impl RawRecord {
    pub fn played_at(&self) -> Option<&str> {
        self.0.get("played_at").and_then(|v| v.as_str())
    }

    pub fn get(&self, path: &[&str]) -> Option<&serde_json::Value> {
        let mut current = &self.0;
        for key in path {
            current = current.get(*key)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }
}

/// Canonical play event as stored in `tracks_recent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub track_id: String,
    pub track_name: String,
    pub artist_names: Vec<String>,
    pub album_name: Option<String>,
    pub played_at: DateTime<Utc>,
}

impl PlayRecord {
    /// Artists as stored in the `artist` column.
    pub fn artist(&self) -> String {
        self.artist_names.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Duplicate,
    Malformed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionReport {
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl IngestionReport {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::Duplicate => self.skipped += 1,
            RecordOutcome::Malformed => self.malformed += 1,
            RecordOutcome::Failed => self.failed += 1,
        }
    }
}
