//! Transcript replay
//!
//! A [`TranscriptReader`] opens a sealed container, exposes its header and
//! artifacts, and replays every moment in global time order to registered
//! handlers.
//!
//! # Example
//!
//! ```rust,no_run
//! use transcript_core::reader::TranscriptReader;
//!
//! # fn main() -> transcript_core::error::Result<()> {
//! let mut reader = TranscriptReader::open("run.transcript")?;
//! let run_id: String = reader.get_header("RunId")?;
//!
//! reader.add_moment_handler(|moment| {
//!     println!("#{} at {} ({} events)", moment.index, moment.utc, moment.event_count);
//! })?;
//! reader.add_event_handler::<String>(move |_, line| {
//!     println!("[{}] {}", run_id, line);
//! })?;
//!
//! reader.replay_all()?;
//! reader.close()?;
//! # Ok(())
//! # }
//! ```

mod handlers;
mod worker;

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::ReaderConfig;
use crate::container::ContainerReader;
use crate::error::{Result, TranscriptError};
use crate::model::{CommonHeader, EventRecord, MomentInfo, ShardReference, TranscriptFile, TranscriptHeader};
use crate::payload::EventPayload;

use handlers::Handlers;
use worker::DecodeAhead;

/// Replays a transcript archive
pub struct TranscriptReader {
    source: PathBuf,
    transcript: TranscriptFile,
    archive: Option<ContainerReader>,
    artifacts: Vec<String>,
    handlers: Handlers,
    poll_interval: Duration,
    replayed: u64,
    worker: Option<DecodeAhead>,
    scratch: Option<TempDir>,
}

impl TranscriptReader {
    /// Open with default [`ReaderConfig`]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, ReaderConfig::default())
    }

    /// Open a transcript and start decoding ahead
    ///
    /// # Errors
    ///
    /// `Io` if the file is missing or its shards cannot be extracted,
    /// `Format` if it is not a transcript archive. Artifacts stay in the
    /// archive until requested.
    pub fn open_with_config(path: impl AsRef<Path>, config: ReaderConfig) -> Result<Self> {
        let source = path.as_ref().to_path_buf();
        let mut container = ContainerReader::open(&source)?;

        let scratch = match &config.working_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                tempfile::Builder::new()
                    .prefix("transcript-replay-")
                    .tempdir_in(parent)?
            }
            None => tempfile::Builder::new()
                .prefix("transcript-replay-")
                .tempdir()?,
        };
        container.extract_shards(scratch.path())?;

        let artifacts = container.artifact_names();
        let transcript = container.transcript().clone();
        let shards = transcript
            .moment_references
            .iter()
            .map(|r| r.moments_file.clone())
            .collect();
        let worker = DecodeAhead::spawn(scratch.path().to_path_buf(), shards, config.read_ahead)?;

        tracing::info!(
            path = %source.display(),
            moments = transcript.header.common.number_of_moments,
            events = transcript.header.common.number_of_events,
            shards = transcript.moment_references.len(),
            "Opened transcript"
        );

        Ok(Self {
            source,
            transcript,
            archive: Some(container),
            artifacts,
            handlers: Handlers::default(),
            poll_interval: config.poll_interval,
            replayed: 0,
            worker: Some(worker),
            scratch: Some(scratch),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.scratch.is_none() {
            return Err(TranscriptError::closed());
        }
        Ok(())
    }

    /// Archive header: user entries and aggregate statistics
    pub fn header(&self) -> Result<&TranscriptHeader> {
        self.ensure_open()?;
        Ok(&self.transcript.header)
    }

    /// Aggregate statistics recorded at finalize
    pub fn common(&self) -> Result<CommonHeader> {
        self.ensure_open()?;
        Ok(self.transcript.header.common)
    }

    /// Shard references in container order
    pub fn shards(&self) -> Result<&[ShardReference]> {
        self.ensure_open()?;
        Ok(&self.transcript.moment_references)
    }

    /// Decode the header entry stored under `key`
    ///
    /// # Errors
    ///
    /// `Validation` if the key is absent, `Format` if the stored value does
    /// not decode as `T`.
    pub fn get_header<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.ensure_open()?;
        let entry = self.transcript.header.entry(key).ok_or_else(|| {
            TranscriptError::Validation(format!("header key '{}' not found", key))
        })?;
        serde_json::from_str(&entry.value).map_err(|e| {
            TranscriptError::Format(format!("header '{}' does not decode: {}", key, e))
        })
    }

    /// Names of included artifacts, sorted
    pub fn artifacts(&self) -> Result<&[String]> {
        self.ensure_open()?;
        Ok(&self.artifacts)
    }

    /// Bytes of an included artifact, read from the archive on demand
    ///
    /// # Errors
    ///
    /// `Validation` if no artifact is named `name`.
    pub fn read_artifact(&mut self, name: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let archive = self.archive.as_mut().ok_or_else(TranscriptError::closed)?;
        archive.read_artifact(name)
    }

    /// Called once per moment, before its event handlers
    pub fn add_moment_handler(
        &mut self,
        handler: impl FnMut(&MomentInfo) + Send + 'static,
    ) -> Result<()> {
        self.ensure_open()?;
        self.handlers.add_moment_handler(handler);
        Ok(())
    }

    /// Called for every event whose tag is `T::TYPE_TAG`, with the payload
    /// decoded as `T`. Events that fail to decode are logged and skipped.
    ///
    /// # Errors
    ///
    /// `Validation` if a handler for another type with the same tag exists.
    pub fn add_event_handler<T: EventPayload>(
        &mut self,
        handler: impl FnMut(&MomentInfo, &T) + Send + 'static,
    ) -> Result<()> {
        self.ensure_open()?;
        self.handlers.add_event_handler::<T>(handler)
    }

    /// Called for every event with its undecoded record
    pub fn add_raw_event_handler(
        &mut self,
        handler: impl FnMut(&MomentInfo, &EventRecord) + Send + 'static,
    ) -> Result<()> {
        self.ensure_open()?;
        self.handlers.add_raw_event_handler(handler);
        Ok(())
    }

    /// Deliver the next moment if one is decoded
    ///
    /// Returns `false` without blocking when nothing is ready yet; use
    /// [`is_exhausted`](Self::is_exhausted) to tell that apart from the end.
    pub fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let Some(moment) = self.worker.as_mut().and_then(DecodeAhead::try_next) else {
            return Ok(false);
        };
        self.handlers.dispatch(&moment);
        self.replayed += 1;
        Ok(true)
    }

    /// Every moment has been delivered
    pub fn is_exhausted(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.worker.as_ref().is_none_or(DecodeAhead::is_exhausted))
    }

    /// Moments delivered so far
    pub fn replayed(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.replayed)
    }

    /// Deliver every remaining moment, waiting on the decoder as needed
    ///
    /// Returns the number of moments delivered by this call.
    pub fn replay_all(&mut self) -> Result<u64> {
        let mut delivered = 0;
        loop {
            if self.next()? {
                delivered += 1;
            } else if self.is_exhausted()? {
                break;
            } else {
                std::thread::sleep(self.poll_interval);
            }
        }
        tracing::debug!(moments = delivered, total = self.replayed, "Replay finished");
        Ok(delivered)
    }

    /// Stop decoding and remove the extracted files
    ///
    /// Every later call, `close` included, fails with a state error.
    pub fn close(&mut self) -> Result<()> {
        let Some(scratch) = self.scratch.take() else {
            return Err(TranscriptError::closed());
        };
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.archive = None;
        scratch.close()?;
        tracing::debug!(path = %self.source.display(), "Closed transcript");
        Ok(())
    }
}

impl Drop for TranscriptReader {
    fn drop(&mut self) {
        // stop the worker before the scratch directory goes away
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl std::fmt::Debug for TranscriptReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptReader")
            .field("source", &self.source)
            .field("common", &self.transcript.header.common)
            .field("replayed", &self.replayed)
            .field("closed", &self.scratch.is_none())
            .finish()
    }
}
