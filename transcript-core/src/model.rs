//! Transcript data model
//!
//! Two layers live here:
//! - Wire records (`TranscriptFile`, `MomentRecord`, ...) that are stored in
//!   the container with PascalCase field names.
//! - Replay types (`Moment`, `MomentInfo`) that carry the derived `Index` and
//!   `Duration` a reader computes after global ordering.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Top-level `transcript.json` object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranscriptFile {
    /// User entries and aggregate statistics
    pub header: TranscriptHeader,

    /// One reference per shard in the container
    pub moment_references: Vec<ShardReference>,
}

/// Archive-level metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranscriptHeader {
    /// Aggregates over every shard
    pub common: CommonHeader,

    /// User-supplied keyed entries, in insertion order
    pub entries: Vec<HeaderEntry>,
}

impl TranscriptHeader {
    /// Find the raw encoded value for a key
    pub fn entry(&self, key: &str) -> Option<&HeaderEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

/// Aggregate statistics over a sequence of moments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonHeader {
    /// Number of distinct timestamps
    pub number_of_moments: u64,

    /// Sum of events over all moments
    pub number_of_events: u64,

    /// Utc of the first moment, `None` when empty
    pub earliest_utc: Option<DateTime<Utc>>,

    /// Utc of the last moment, `None` when empty
    pub latest_utc: Option<DateTime<Utc>>,
}

impl CommonHeader {
    /// Fold one moment into the statistics
    pub fn observe(&mut self, utc: DateTime<Utc>, events: usize) {
        self.number_of_moments += 1;
        self.number_of_events += events as u64;
        self.earliest_utc = Some(self.earliest_utc.map_or(utc, |e| e.min(utc)));
        self.latest_utc = Some(self.latest_utc.map_or(utc, |l| l.max(utc)));
    }

    /// Recompute statistics from a moment stream
    pub fn from_moments<'a>(moments: impl IntoIterator<Item = &'a Moment>) -> Self {
        let mut common = Self::default();
        for moment in moments {
            common.observe(moment.utc, moment.events.len());
        }
        common
    }

    /// Whether no moment has been observed
    pub fn is_empty(&self) -> bool {
        self.number_of_moments == 0
    }
}

/// A user-supplied header entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeaderEntry {
    pub key: String,

    /// JSON encoding of the value
    pub value: String,
}

/// Location and statistics of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardReference {
    /// Archive entry holding the shard's moment lines
    pub moments_file: String,

    #[serde(flatten)]
    pub stats: CommonHeader,
}

/// One line of a shard entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MomentRecord {
    pub utc: DateTime<Utc>,
    pub events: Vec<EventRecord>,
}

/// An encoded event inside a moment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Tag naming the payload's registered type
    #[serde(rename = "Type")]
    pub type_tag: String,

    /// JSON encoding of the payload
    #[serde(rename = "Payload")]
    pub payload: String,
}

/// A moment in the globally ordered replay stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moment {
    pub utc: DateTime<Utc>,

    /// Position in the global timeline, `0..N-1`
    pub index: u64,

    /// Time until the next moment; `None` for the last one
    pub duration: Option<TimeDelta>,

    pub events: Vec<EventRecord>,
}

impl Moment {
    /// Metadata handed to moment and event handlers
    pub fn info(&self) -> MomentInfo {
        MomentInfo {
            utc: self.utc,
            index: self.index,
            duration: self.duration,
            event_count: self.events.len(),
        }
    }
}

/// Moment-level metadata passed to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MomentInfo {
    pub utc: DateTime<Utc>,
    pub index: u64,
    pub duration: Option<TimeDelta>,
    pub event_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_transcript_file_field_names() {
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut stats = CommonHeader::default();
        stats.observe(utc, 2);

        let file = TranscriptFile {
            header: TranscriptHeader {
                common: stats,
                entries: vec![HeaderEntry {
                    key: "testHeader".to_string(),
                    value: "\"abc\"".to_string(),
                }],
            },
            moment_references: vec![ShardReference {
                moments_file: "moments/a.jsonl".to_string(),
                stats,
            }],
        };

        let json: serde_json::Value = serde_json::to_value(&file).unwrap();
        assert_eq!(json["Header"]["Common"]["NumberOfMoments"], 1);
        assert_eq!(json["Header"]["Common"]["NumberOfEvents"], 2);
        assert_eq!(json["Header"]["Entries"][0]["Key"], "testHeader");
        assert_eq!(json["MomentReferences"][0]["MomentsFile"], "moments/a.jsonl");
        assert_eq!(json["MomentReferences"][0]["NumberOfEvents"], 2);
        assert!(json["MomentReferences"][0]["EarliestUtc"].is_string());

        let parsed: TranscriptFile = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn test_moment_record_line_shape() {
        let record = MomentRecord {
            utc: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            events: vec![EventRecord {
                type_tag: "String".to_string(),
                payload: "\"12345\"".to_string(),
            }],
        };
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"Utc\""));
        assert!(line.contains("\"Type\":\"String\""));
        assert!(line.contains("\"Payload\""));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_common_header_observe() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = t0 + TimeDelta::seconds(3);
        let mut common = CommonHeader::default();
        assert!(common.is_empty());

        common.observe(t1, 1);
        common.observe(t0, 2);

        assert_eq!(common.number_of_moments, 2);
        assert_eq!(common.number_of_events, 3);
        assert_eq!(common.earliest_utc, Some(t0));
        assert_eq!(common.latest_utc, Some(t1));
    }
}
