use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::MalformedRecord;
use crate::models::{PlayRecord, RawRecord};

const PLAYED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const MAX_FRACTION_DIGITS: usize = 6;

/// Parse a provider timestamp of the form `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
///
/// The fraction must be present and have between one and six digits; the
/// zone must be a literal `Z`.
pub fn parse_played_at(value: &str) -> Result<DateTime<Utc>, String> {
    let body = value
        .strip_suffix('Z')
        .ok_or_else(|| format!("played_at '{}' is not a UTC 'Z' timestamp", value))?;

    let (seconds, fraction) = body
        .split_once('.')
        .ok_or_else(|| format!("played_at '{}' has no fractional seconds", value))?;

    if seconds.len() != 19 || seconds.as_bytes()[10] != b'T' {
        return Err(format!("played_at '{}' is not YYYY-MM-DDTHH:MM:SS", value));
    }
    if fraction.is_empty()
        || fraction.len() > MAX_FRACTION_DIGITS
        || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(format!(
            "played_at '{}' must have 1 to {} fractional digits",
            value, MAX_FRACTION_DIGITS
        ));
    }

    NaiveDateTime::parse_from_str(body, PLAYED_AT_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("played_at '{}': {}", value, e))
}

/// Map one raw history item onto the canonical record.
///
/// Only `track.id` and `played_at` are required. Podcast episodes carry a
/// `show` instead of an `album` and have no artists.
pub fn normalize(raw: &RawRecord) -> Result<PlayRecord, MalformedRecord> {
    let played_at_raw = raw.played_at();
    let played_at_str =
        played_at_raw.ok_or_else(|| MalformedRecord::new(None, "missing played_at"))?;

    let track_id = raw
        .get_str(&["track", "id"])
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MalformedRecord::new(played_at_raw, "missing track.id"))?;

    let played_at =
        parse_played_at(played_at_str).map_err(|reason| MalformedRecord::new(played_at_raw, reason))?;

    let track_name = raw.get_str(&["track", "name"]).unwrap_or_default();

    let artist_names = raw
        .get(&["track", "artists"])
        .and_then(|v| v.as_array())
        .map(|artists| {
            artists
                .iter()
                .filter_map(|a| a.get("name").and_then(|n| n.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let album_name = raw
        .get_str(&["track", "album", "name"])
        .or_else(|| raw.get_str(&["track", "show", "name"]))
        .map(String::from);

    Ok(PlayRecord {
        track_id: track_id.to_string(),
        track_name: track_name.to_string(),
        artist_names,
        album_name,
        played_at,
    })
}
