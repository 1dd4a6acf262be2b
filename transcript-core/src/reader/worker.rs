//! Decode-ahead worker
//!
//! A background thread streams every shard of an extracted container,
//! merges them into the global timeline and pushes finished moments into a
//! bounded channel. The reader only ever `try_recv`s, so `next()` never waits
//! on decoding.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{Receiver, channel};

use crate::container::read_shard;
use crate::error::Result;
use crate::grouping::MomentTimeline;
use crate::model::Moment;

pub(crate) struct DecodeAhead {
    moments: Receiver<Moment>,
    handle: Option<JoinHandle<()>>,
}

impl DecodeAhead {
    /// Start decoding `shards` (entry names relative to `root`)
    pub(crate) fn spawn(root: PathBuf, shards: Vec<String>, capacity: usize) -> Result<Self> {
        let (tx, moments) = channel(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("transcript-decode".to_string())
            .spawn(move || {
                let mut streams = Vec::with_capacity(shards.len());
                for shard in &shards {
                    match File::open(root.join(shard)) {
                        Ok(file) => streams.push(read_shard(BufReader::new(file), shard)),
                        Err(e) => {
                            tracing::warn!(shard = %shard, error = %e, "Skipping unreadable shard");
                        }
                    }
                }

                let mut decoded = 0u64;
                for moment in MomentTimeline::new(streams) {
                    if tx.blocking_send(moment).is_err() {
                        tracing::debug!(moments = decoded, "Replay stopped before end of stream");
                        return;
                    }
                    decoded += 1;
                }
                tracing::debug!(moments = decoded, "Decode-ahead finished");
            })?;

        Ok(Self {
            moments,
            handle: Some(handle),
        })
    }

    /// Next decoded moment, if one is ready
    pub(crate) fn try_next(&mut self) -> Option<Moment> {
        match self.moments.try_recv() {
            Ok(moment) => Some(moment),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// The worker is done and every decoded moment was consumed
    pub(crate) fn is_exhausted(&self) -> bool {
        self.moments.is_closed() && self.moments.is_empty()
    }

    /// Stop the worker and wait for it to exit
    pub(crate) fn shutdown(&mut self) {
        self.moments.close();
        while self.moments.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Decode-ahead worker panicked");
            }
        }
    }
}

impl Drop for DecodeAhead {
    fn drop(&mut self) {
        self.shutdown();
    }
}
