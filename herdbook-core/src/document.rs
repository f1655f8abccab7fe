//! Document and replication wire types shared by the client and the backend.
//!
//! Revision timestamps are kept at microsecond precision so that their
//! RFC 3339 text form sorts the same way the timestamps do. Both SQLite
//! databases store and compare `updated_at` as text.

use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A record in a local or remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDocument {
    /// Stable primary key within the collection
    pub id: String,
    /// Domain payload (opaque to the sync layer)
    #[serde(default)]
    pub data: serde_json::Value,
    /// Revision timestamp, advanced on every write
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag; deleted rows are kept so deletions replicate
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
}

impl LocalDocument {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            updated_at: now(),
            deleted: false,
        }
    }

    /// Returns true if this revision should replace `other` under
    /// last-write-wins. Equal timestamps keep the existing revision.
    pub fn supersedes(&self, other: &LocalDocument) -> bool {
        self.updated_at > other.updated_at
    }
}

/// Position in a remote collection up to which documents have been pulled.
///
/// The backend stamps every change it accepts with the next value of one
/// monotonic sequence and serves pulls in that order. Revision timestamps
/// only decide last-write-wins: a revision written offline hours ago still
/// gets a sequence after every cursor handed out before it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
}

/// One page of a pull.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullBatch {
    pub documents: Vec<LocalDocument>,
    /// Cursor after the last document of this batch, or the request cursor
    /// when the batch is empty.
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub documents: Vec<LocalDocument>,
}

/// Outcome of a push; `rejected` revisions lost last-write-wins on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Identity returned by the backend's `/me` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub farm_id: String,
}

/// Current time truncated to microseconds.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Next revision timestamp after `previous`, never going backwards even if
/// the wall clock does.
pub fn next_revision(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let current = now();
    match previous {
        Some(prev) if prev >= current => prev + Duration::microseconds(1),
        _ => current,
    }
}

/// Canonical text form used for storage and comparisons.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| truncate(dt.with_timezone(&Utc)))
}

fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    let micros = ts.nanosecond() / 1_000 * 1_000;
    ts.with_nanosecond(micros).unwrap_or(ts)
}

/// Collection names double as URL path segments and table keys.
pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deleted_serializes_as_underscore_field() {
        let doc = LocalDocument::new("cow-1", json!({"name": "Bessie"}));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_deleted"], json!(false));
        assert!(value.get("deleted").is_none());
    }

    #[test]
    fn test_missing_deleted_defaults_to_false() {
        let doc: LocalDocument = serde_json::from_value(json!({
            "id": "a",
            "data": {},
            "updated_at": "2025-03-01T10:00:00.000000Z"
        }))
        .unwrap();
        assert!(!doc.deleted);
    }

    #[test]
    fn test_supersedes_requires_strictly_newer() {
        let older = LocalDocument::new("a", json!({}));
        let mut newer = older.clone();
        newer.updated_at = older.updated_at + Duration::seconds(1);

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!older.supersedes(&older.clone()));
    }

    #[test]
    fn test_checkpoint_wire_form() {
        let cp: Checkpoint = serde_json::from_value(json!({"sequence": 7})).unwrap();
        assert_eq!(cp, Checkpoint { sequence: 7 });
        assert!(Checkpoint { sequence: 2 } < cp);
    }

    #[test]
    fn test_next_revision_is_monotonic() {
        let future = now() + Duration::hours(1);
        let next = next_revision(Some(future));
        assert!(next > future);

        let past = now() - Duration::hours(1);
        assert!(next_revision(Some(past)) > past);
    }

    #[test]
    fn test_timestamp_text_sorts_like_time() {
        let a = parse_timestamp("2025-03-01T10:00:00.5Z").unwrap();
        let b = parse_timestamp("2025-03-01T10:00:00.25Z").unwrap();
        assert!(b < a);
        assert!(format_timestamp(&b) < format_timestamp(&a));
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(is_valid_collection_name("animals"));
        assert!(is_valid_collection_name("reproduction_events"));
        assert!(!is_valid_collection_name(""));
        assert!(!is_valid_collection_name("../etc"));
        assert!(!is_valid_collection_name("Animals"));
    }
}
