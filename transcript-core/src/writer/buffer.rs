//! Event buffer with background bucket spilling
//!
//! Events accumulate in memory. Once `bucket_size` events are held the batch
//! is handed to a spill thread that sorts it and writes it as a JSON-lines
//! bucket file, so `push` itself never touches the disk. At finalize the
//! buckets and the in-memory remainder become sorted runs for the k-way
//! merge in [`crate::grouping`].

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::error::{Result, TranscriptError};
use crate::grouping::{BufferedEvent, EventSource, sort_events};

/// Folder below the writer's scratch directory holding spilled buckets
pub(crate) const BUCKETS_DIR: &str = "buckets";

/// What the spill thread hands back when the buffer is drained
#[derive(Default)]
struct SpillOutcome {
    buckets: Vec<PathBuf>,
    /// Batches received after (or while) spilling failed
    unwritten: Vec<BufferedEvent>,
    error: Option<TranscriptError>,
}

struct SpillWorker {
    batches: UnboundedSender<Vec<BufferedEvent>>,
    failed: Arc<AtomicBool>,
    handle: JoinHandle<SpillOutcome>,
}

impl SpillWorker {
    fn start(dir: PathBuf) -> Result<Self> {
        let (batches, mut rx) = unbounded_channel::<Vec<BufferedEvent>>();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let handle = std::thread::Builder::new()
            .name("transcript-spill".to_string())
            .spawn(move || {
                let mut outcome = SpillOutcome::default();
                let fail = |outcome: &mut SpillOutcome, e: TranscriptError| {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Spilling failed, keeping events in memory"
                    );
                    flag.store(true, Ordering::Release);
                    outcome.error = Some(e);
                };

                if let Err(e) = std::fs::create_dir_all(&dir) {
                    fail(&mut outcome, e.into());
                }
                while let Some(mut batch) = rx.blocking_recv() {
                    if outcome.error.is_none() {
                        sort_events(&mut batch);
                        let path = dir.join(format!("bucket-{:06}.jsonl", outcome.buckets.len()));
                        match write_bucket(&path, &batch) {
                            Ok(()) => {
                                tracing::debug!(
                                    bucket = %path.display(),
                                    events = batch.len(),
                                    "Spilled event bucket"
                                );
                                outcome.buckets.push(path);
                                continue;
                            }
                            Err(e) => fail(&mut outcome, e),
                        }
                    }
                    outcome.unwritten.extend(batch);
                }
                outcome
            })?;
        Ok(Self {
            batches,
            failed,
            handle,
        })
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn finish(self) -> Result<SpillOutcome> {
        drop(self.batches);
        self.handle
            .join()
            .map_err(|_| TranscriptError::State("spill worker panicked".to_string()))
    }
}

fn write_bucket(path: &Path, events: &[BufferedEvent]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn read_bucket(path: &Path) -> Result<EventSource> {
    let reader = BufReader::new(File::open(path)?);
    Ok(Box::new(reader.lines().map(|line| -> Result<BufferedEvent> {
        let line = line?;
        Ok(serde_json::from_str::<BufferedEvent>(&line)?)
    })))
}

/// Insertion-ordered event accumulation for one writer
#[derive(Default)]
pub(crate) struct EventBuffer {
    events: Vec<BufferedEvent>,
    next_seq: u64,
    bucket_size: usize,
    bucket_dir: PathBuf,
    spilled: u64,
    worker: Option<SpillWorker>,
}

impl EventBuffer {
    pub(crate) fn new(bucket_size: usize, bucket_dir: PathBuf) -> Self {
        Self {
            bucket_size,
            bucket_dir,
            ..Default::default()
        }
    }

    /// Buffer one encoded event, assigning its insertion sequence number
    pub(crate) fn push(
        &mut self,
        utc: DateTime<Utc>,
        type_tag: &str,
        payload: String,
    ) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(BufferedEvent {
            seq,
            utc,
            type_tag: type_tag.to_string(),
            payload,
        });

        if self.bucket_size > 0 && self.events.len() >= self.bucket_size {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.worker.is_none() {
            self.worker = Some(SpillWorker::start(self.bucket_dir.clone())?);
        }
        let Some(worker) = self.worker.as_ref() else {
            return Ok(());
        };
        if worker.has_failed() {
            // the worker still holds what it could not write; stop handing it more
            self.bucket_size = 0;
            return Ok(());
        }

        let batch = std::mem::take(&mut self.events);
        let size = batch.len() as u64;
        match worker.batches.send(batch) {
            Ok(()) => self.spilled += size,
            Err(returned) => {
                tracing::warn!("Spill worker is gone, keeping events in memory");
                self.events = returned.0;
                self.bucket_size = 0;
            }
        }
        Ok(())
    }

    /// Total buffered events, spilled included
    pub(crate) fn len(&self) -> u64 {
        self.spilled + self.events.len() as u64
    }

    /// Stop spilling and return every sorted run
    pub(crate) fn into_sources(mut self) -> Result<Vec<EventSource>> {
        let mut sources = Vec::new();
        if let Some(worker) = self.worker.take() {
            let outcome = worker.finish()?;
            if let Some(e) = &outcome.error {
                tracing::warn!(
                    error = %e,
                    unwritten = outcome.unwritten.len(),
                    "Merging events that could not be spilled from memory"
                );
            }
            for bucket in &outcome.buckets {
                sources.push(read_bucket(bucket)?);
            }
            self.events.extend(outcome.unwritten);
        }

        let mut remainder = std::mem::take(&mut self.events);
        sort_events(&mut remainder);
        sources.push(Box::new(remainder.into_iter().map(Ok::<_, TranscriptError>)));
        Ok(sources)
    }
}
