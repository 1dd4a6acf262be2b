//! Transcript writer
//!
//! Accumulates header entries, timestamped events and artifacts, then seals
//! them into a container exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use transcript_core::writer::TranscriptWriter;
//!
//! let writer = TranscriptWriter::new()?;
//! writer.add_header("testHeader", &serde_json::json!({"HeaderData": "abcdef"}))?;
//! writer.add(Utc::now(), &"node started".to_string())?;
//! writer.finalize("run.transcript")?;
//! # Ok::<(), transcript_core::error::TranscriptError>(())
//! ```
//!
//! The writer takes `&self` everywhere, so producers on many threads can share
//! it through an `Arc`. A single mutex guards the buffer; `add` and
//! `add_header` never do I/O while holding it.

mod buffer;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

use crate::config::WriterConfig;
use crate::container::{self, ContainerWriter};
use crate::error::{Result, TranscriptError};
use crate::grouping::{MergedEvents, MomentGrouper};
use crate::model::{HeaderEntry, TranscriptHeader};
use crate::payload::{self, EventPayload};

use buffer::{BUCKETS_DIR, EventBuffer};

/// Where spill buckets live until the writer is sealed
enum Scratch {
    Private(TempDir),
    Explicit(PathBuf),
}

impl Scratch {
    fn create(working_dir: Option<&Path>) -> Result<Self> {
        match working_dir {
            None => Ok(Scratch::Private(
                tempfile::Builder::new().prefix("transcript-").tempdir()?,
            )),
            Some(dir) => {
                if dir.exists() && std::fs::read_dir(dir)?.next().is_some() {
                    return Err(TranscriptError::Validation(format!(
                        "working directory '{}' is not empty",
                        dir.display()
                    )));
                }
                std::fs::create_dir_all(dir)?;
                Ok(Scratch::Explicit(dir.to_path_buf()))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Scratch::Private(dir) => dir.path(),
            Scratch::Explicit(dir) => dir,
        }
    }

    /// Fail if anything other than our own bucket folder appeared in the directory
    fn ensure_clean(&self) -> Result<()> {
        if !self.path().exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(self.path())? {
            let entry = entry?;
            if entry.file_name() != BUCKETS_DIR || !entry.file_type()?.is_dir() {
                return Err(TranscriptError::Validation(format!(
                    "working directory '{}' is not empty: found '{}'",
                    self.path().display(),
                    entry.file_name().to_string_lossy()
                )));
            }
        }
        Ok(())
    }

    fn remove(self) -> Result<()> {
        match self {
            Scratch::Private(dir) => dir.close()?,
            Scratch::Explicit(dir) => {
                if dir.exists() {
                    std::fs::remove_dir_all(dir)?;
                }
            }
        }
        Ok(())
    }
}

struct WriterState {
    sealed: bool,
    entries: Vec<HeaderEntry>,
    artifacts: Vec<(String, PathBuf)>,
    buffer: EventBuffer,
    scratch: Option<Scratch>,
}

/// Accumulates events and seals them into a transcript container
pub struct TranscriptWriter {
    state: Mutex<WriterState>,
}

impl TranscriptWriter {
    /// Create an empty writer with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(WriterConfig::default())
    }

    /// Create an empty writer
    ///
    /// # Errors
    ///
    /// `Validation` if `config.working_dir` exists and is not empty.
    pub fn with_config(config: WriterConfig) -> Result<Self> {
        let scratch = Scratch::create(config.working_dir.as_deref())?;
        let buffer = EventBuffer::new(config.bucket_size, scratch.path().join(BUCKETS_DIR));
        Ok(Self {
            state: Mutex::new(WriterState {
                sealed: false,
                entries: Vec::new(),
                artifacts: Vec::new(),
                buffer,
                scratch: Some(scratch),
            }),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, WriterState>> {
        self.state
            .lock()
            .map_err(|_| TranscriptError::State("transcript writer lock poisoned".to_string()))
    }

    /// Store a header entry
    ///
    /// # Errors
    ///
    /// `State` once sealed, `Validation` if `key` was already added.
    pub fn add_header<V: Serialize + ?Sized>(&self, key: impl Into<String>, value: &V) -> Result<()> {
        let key = key.into();
        let value = payload::encode(value)?;

        let mut state = self.state()?;
        if state.sealed {
            return Err(TranscriptError::sealed());
        }
        if state.entries.iter().any(|e| e.key == key) {
            return Err(TranscriptError::Validation(format!(
                "header '{}' is already set",
                key
            )));
        }
        state.entries.push(HeaderEntry { key, value });
        Ok(())
    }

    /// Buffer an event; arrival order does not matter
    ///
    /// # Errors
    ///
    /// `State` once sealed.
    pub fn add<T: EventPayload>(&self, utc: DateTime<Utc>, payload: &T) -> Result<()> {
        let encoded = payload::encode(payload)?;

        let mut state = self.state()?;
        if state.sealed {
            return Err(TranscriptError::sealed());
        }
        state.buffer.push(utc, T::TYPE_TAG, encoded)
    }

    /// Include a file verbatim in the archive's artifact folder at finalize
    ///
    /// # Errors
    ///
    /// `Io` if `path` does not exist, `Validation` if an artifact with the same
    /// file name is already included, `State` once sealed.
    pub fn include_artifact(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(TranscriptError::Validation(format!(
                "artifact '{}' is not a file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TranscriptError::Validation(format!("artifact '{}' has no file name", path.display()))
            })?;

        let mut state = self.state()?;
        if state.sealed {
            return Err(TranscriptError::sealed());
        }
        if state.artifacts.iter().any(|(existing, _)| *existing == name) {
            return Err(TranscriptError::Validation(format!(
                "artifact name '{}' is already included",
                name
            )));
        }
        state.artifacts.push((name, path.to_path_buf()));
        Ok(())
    }

    /// Number of events added so far
    pub fn event_count(&self) -> Result<u64> {
        Ok(self.state()?.buffer.len())
    }

    /// Whether `finalize` has been called successfully past its checks
    pub fn is_sealed(&self) -> bool {
        self.state().map(|s| s.sealed).unwrap_or(true)
    }

    /// Seal the buffer into a container at `destination`
    ///
    /// Events are ordered by Utc, ties by insertion order, grouped into
    /// moments and written as a single shard. The archive is packaged next to
    /// `destination` and moved into place without overwriting, then the
    /// scratch directory is removed.
    ///
    /// # Errors
    ///
    /// `State` if already sealed (including a concurrent `finalize`), `Io` if
    /// `destination` exists, `Validation` if the scratch directory holds
    /// foreign files. These checks run before sealing; failures after that
    /// point leave the writer sealed.
    pub fn finalize(&self, destination: impl AsRef<Path>) -> Result<()> {
        let destination = destination.as_ref();

        let (entries, artifacts, buffer, scratch) = {
            let mut state = self.state()?;
            if state.sealed {
                return Err(TranscriptError::sealed());
            }
            container::ensure_vacant(destination)?;
            if let Some(scratch) = state.scratch.as_ref() {
                scratch.ensure_clean()?;
            }

            state.sealed = true;
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.artifacts),
                std::mem::take(&mut state.buffer),
                state.scratch.take(),
            )
        };

        let events = buffer.len();
        let sources = buffer.into_sources()?;
        let moments = MomentGrouper::new(MergedEvents::new(sources));

        let mut archive = ContainerWriter::new(container::staging_file(destination)?);
        let reference = archive.write_shard(moments)?;
        for (name, path) in &artifacts {
            archive.add_artifact(name, path)?;
        }

        let header = TranscriptHeader {
            common: reference.stats,
            entries,
        };
        let common = header.common;
        let package = archive.finish(header, vec![reference])?;
        container::persist(package, destination)?;

        if let Some(scratch) = scratch {
            scratch.remove()?;
        }

        tracing::info!(
            path = %destination.display(),
            moments = common.number_of_moments,
            events,
            artifacts = artifacts.len(),
            "Transcript finalized"
        );
        Ok(())
    }
}

impl std::fmt::Debug for TranscriptWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("TranscriptWriter");
        if let Ok(state) = self.state.lock() {
            debug
                .field("sealed", &state.sealed)
                .field("entries", &state.entries.len())
                .field("events", &state.buffer.len())
                .field("artifacts", &state.artifacts.len());
        }
        debug.finish()
    }
}
