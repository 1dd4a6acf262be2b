//! Moment grouping and time-ordered merging
//!
//! Writer side: buffered events are sorted by `(utc, seq)` where `seq` is the
//! writer's insertion sequence number, so ties on identical timestamps keep
//! insertion order. Sorted runs (in-memory remainder plus spilled buckets)
//! are k-way merged and consecutive equal-Utc events become one moment.
//!
//! Reader side: each shard is an ascending moment stream. [`MomentTimeline`]
//! merges shards by Utc, folds equal-Utc moments of different shards into
//! one (shard order decides event order), assigns indices and derives each
//! moment's duration from its successor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::iter::Peekable;

use crate::error::{Result, TranscriptError};
use crate::model::{EventRecord, Moment, MomentRecord};

/// An event waiting in a writer's buffer or spill bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Insertion sequence number, unique per writer
    pub seq: u64,
    pub utc: DateTime<Utc>,
    pub type_tag: String,
    pub payload: String,
}

impl BufferedEvent {
    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.utc, self.seq)
    }

    fn into_record(self) -> EventRecord {
        EventRecord {
            type_tag: self.type_tag,
            payload: self.payload,
        }
    }
}

/// Sort a run of events into timeline order
pub fn sort_events(events: &mut [BufferedEvent]) {
    events.sort_by_key(BufferedEvent::sort_key);
}

/// A sorted run of buffered events
pub type EventSource = Box<dyn Iterator<Item = Result<BufferedEvent>> + Send>;

/// K-way merge of individually sorted event runs
pub struct MergedEvents {
    sources: Vec<EventSource>,
    heads: BinaryHeap<Reverse<((DateTime<Utc>, u64), usize)>>,
    slots: Vec<Option<BufferedEvent>>,
    pending_error: Option<TranscriptError>,
}

impl MergedEvents {
    /// Build a merge over sorted sources
    pub fn new(sources: Vec<EventSource>) -> Self {
        let slots = sources.iter().map(|_| None).collect();
        let mut merged = Self {
            sources,
            heads: BinaryHeap::new(),
            slots,
            pending_error: None,
        };
        for idx in 0..merged.sources.len() {
            if let Err(e) = merged.refill(idx) {
                merged.pending_error.get_or_insert(e);
            }
        }
        merged
    }

    fn refill(&mut self, idx: usize) -> Result<()> {
        if let Some(next) = self.sources[idx].next() {
            let event = next?;
            self.heads.push(Reverse((event.sort_key(), idx)));
            self.slots[idx] = Some(event);
        }
        Ok(())
    }
}

impl Iterator for MergedEvents {
    type Item = Result<BufferedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let Reverse((_, idx)) = self.heads.pop()?;
        let event = self.slots[idx].take()?;
        if let Err(e) = self.refill(idx) {
            self.pending_error = Some(e);
        }
        Some(Ok(event))
    }
}

/// Groups a timeline-ordered event stream into moment records
pub struct MomentGrouper<I: Iterator<Item = Result<BufferedEvent>>> {
    events: Peekable<I>,
}

impl<I: Iterator<Item = Result<BufferedEvent>>> MomentGrouper<I> {
    pub fn new(events: I) -> Self {
        Self {
            events: events.peekable(),
        }
    }
}

impl<I: Iterator<Item = Result<BufferedEvent>>> Iterator for MomentGrouper<I> {
    type Item = Result<MomentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.events.next()? {
            Ok(event) => event,
            Err(e) => return Some(Err(e)),
        };
        let utc = first.utc;
        let mut events = vec![first.into_record()];

        while let Some(Ok(peeked)) = self.events.peek() {
            if peeked.utc != utc {
                break;
            }
            if let Some(Ok(event)) = self.events.next() {
                events.push(event.into_record());
            }
        }

        Some(Ok(MomentRecord { utc, events }))
    }
}

/// Group an in-memory batch of events into moments
pub fn group_moments(mut events: Vec<BufferedEvent>) -> Vec<MomentRecord> {
    sort_events(&mut events);
    MomentGrouper::new(events.into_iter().map(Ok))
        .filter_map(Result::ok)
        .collect()
}

struct ShardCursor<S: Iterator<Item = MomentRecord>> {
    shard: usize,
    moments: Peekable<S>,
    last_utc: Option<DateTime<Utc>>,
}

impl<S: Iterator<Item = MomentRecord>> ShardCursor<S> {
    /// Peek the next moment, discarding any that break the shard's ascending order
    fn peek_utc(&mut self) -> Option<DateTime<Utc>> {
        loop {
            let utc = self.moments.peek()?.utc;
            match self.last_utc {
                Some(last) if utc <= last => {
                    tracing::warn!(
                        shard = self.shard,
                        utc = %utc,
                        previous = %last,
                        "Skipping out-of-order moment in shard"
                    );
                    self.moments.next();
                }
                _ => return Some(utc),
            }
        }
    }

    fn take(&mut self) -> Option<MomentRecord> {
        let moment = self.moments.next()?;
        self.last_utc = Some(moment.utc);
        Some(moment)
    }
}

/// Time-ascending merge of shard moment streams with index and duration
pub struct MomentTimeline<S: Iterator<Item = MomentRecord>> {
    shards: Vec<ShardCursor<S>>,
    lookahead: Option<MomentRecord>,
    next_index: u64,
}

impl<S: Iterator<Item = MomentRecord>> MomentTimeline<S> {
    /// Merge shards; their order decides event order within shared timestamps
    pub fn new(shards: impl IntoIterator<Item = S>) -> Self {
        let shards = shards
            .into_iter()
            .enumerate()
            .map(|(shard, moments)| ShardCursor {
                shard,
                moments: moments.peekable(),
                last_utc: None,
            })
            .collect();
        Self {
            shards,
            lookahead: None,
            next_index: 0,
        }
    }

    /// Pull the earliest moment across shards, folding equal timestamps
    fn pull(&mut self) -> Option<MomentRecord> {
        let earliest = self
            .shards
            .iter_mut()
            .filter_map(|cursor| cursor.peek_utc())
            .min()?;

        let mut merged: Option<MomentRecord> = None;
        for cursor in &mut self.shards {
            if cursor.peek_utc() != Some(earliest) {
                continue;
            }
            if let Some(moment) = cursor.take() {
                match merged.as_mut() {
                    Some(acc) => acc.events.extend(moment.events),
                    None => merged = Some(moment),
                }
            }
        }
        merged
    }
}

impl<S: Iterator<Item = MomentRecord>> Iterator for MomentTimeline<S> {
    type Item = Moment;

    fn next(&mut self) -> Option<Moment> {
        let current = match self.lookahead.take() {
            Some(moment) => moment,
            None => self.pull()?,
        };
        self.lookahead = self.pull();

        let duration = self
            .lookahead
            .as_ref()
            .map(|next| next.utc - current.utc);
        let index = self.next_index;
        self.next_index += 1;

        Some(Moment {
            utc: current.utc,
            index,
            duration,
            events: current.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn event(seq: u64, secs: i64, payload: &str) -> BufferedEvent {
        BufferedEvent {
            seq,
            utc: t(secs),
            type_tag: "String".to_string(),
            payload: payload.to_string(),
        }
    }

    fn record(secs: i64, payloads: &[&str]) -> MomentRecord {
        MomentRecord {
            utc: t(secs),
            events: payloads
                .iter()
                .map(|p| EventRecord {
                    type_tag: "String".to_string(),
                    payload: p.to_string(),
                })
                .collect(),
        }
    }

    fn payloads(record: &MomentRecord) -> Vec<&str> {
        record.events.iter().map(|e| e.payload.as_str()).collect()
    }

    #[test]
    fn test_grouping_merges_equal_timestamps_in_insertion_order() {
        let moments = group_moments(vec![
            event(0, 0, "a"),
            event(1, 2, "b"),
            event(2, 1, "c"),
            event(3, 1, "d"),
        ]);

        assert_eq!(moments.len(), 3);
        assert_eq!(payloads(&moments[0]), vec!["a"]);
        assert_eq!(payloads(&moments[1]), vec!["c", "d"]);
        assert_eq!(payloads(&moments[2]), vec!["b"]);
        assert!(moments.windows(2).all(|w| w[0].utc < w[1].utc));
    }

    #[test]
    fn test_grouping_empty() {
        assert!(group_moments(Vec::new()).is_empty());
    }

    #[test]
    fn test_merged_events_interleaves_runs() {
        let run_a: EventSource = Box::new(vec![event(0, 0, "a0"), event(3, 5, "a1")].into_iter().map(Ok::<_, TranscriptError>));
        let run_b: EventSource = Box::new(vec![event(1, 1, "b0"), event(2, 5, "b1")].into_iter().map(Ok::<_, TranscriptError>));

        let merged: Vec<_> = MergedEvents::new(vec![run_a, run_b])
            .map(|e| e.unwrap().payload)
            .collect();

        // equal utc: lower seq first
        assert_eq!(merged, vec!["a0", "b0", "b1", "a1"]);
    }

    #[test]
    fn test_timeline_indices_and_durations() {
        let shard = vec![record(0, &["x"]), record(1, &["y", "z"]), record(4, &["w"])];
        let moments: Vec<Moment> = MomentTimeline::new(vec![shard.into_iter()]).collect();

        assert_eq!(moments.len(), 3);
        assert_eq!(
            moments.iter().map(|m| m.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(moments[0].duration, Some(TimeDelta::seconds(1)));
        assert_eq!(moments[1].duration, Some(TimeDelta::seconds(3)));
        assert_eq!(moments[2].duration, None);
        assert_eq!(moments[1].events.len(), 2);
    }

    #[test]
    fn test_timeline_merges_shards_by_time_not_order() {
        let late = vec![record(5, &["late-5"]), record(7, &["late-7"])];
        let early = vec![record(1, &["early-1"]), record(5, &["early-5"]), record(6, &["early-6"])];

        let moments: Vec<Moment> =
            MomentTimeline::new(vec![late.into_iter(), early.into_iter()]).collect();

        let utcs: Vec<_> = moments.iter().map(|m| m.utc).collect();
        assert_eq!(utcs, vec![t(1), t(5), t(6), t(7)]);

        // shared timestamp folds into one moment, shard order first
        let shared: Vec<_> = moments[1].events.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(shared, vec!["late-5", "early-5"]);
        assert_eq!(moments.last().unwrap().index, 3);
    }

    #[test]
    fn test_timeline_skips_out_of_order_moment() {
        let shard = vec![record(2, &["a"]), record(1, &["bad"]), record(3, &["b"])];
        let moments: Vec<Moment> = MomentTimeline::new(vec![shard.into_iter()]).collect();

        assert_eq!(moments.len(), 2);
        assert_eq!(moments[0].utc, t(2));
        assert_eq!(moments[1].utc, t(3));
    }

    #[test]
    fn test_timeline_empty() {
        let moments: Vec<Moment> =
            MomentTimeline::new(Vec::<std::vec::IntoIter<MomentRecord>>::new()).collect();
        assert!(moments.is_empty());
    }
}
