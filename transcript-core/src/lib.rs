//! # Transcript - Replayable Archives of Timestamped Events
//!
//! Transcript captures what happened during a test run and replays it later:
//! - Producers add typed events with a UTC timestamp, in any order
//! - Events are grouped into moments (all events sharing one timestamp)
//! - Finalize seals everything into a single zip container with header
//!   entries, aggregate statistics and optional artifacts
//! - Readers replay moments in global time order to type-keyed handlers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use transcript_core::prelude::*;
//! use chrono::Utc;
//!
//! fn main() -> Result<()> {
//!     let writer = TranscriptWriter::new()?;
//!     writer.add_header("Network", "devnet-3")?;
//!     writer.add(Utc::now(), &"node-1 started".to_string())?;
//!     writer.finalize("run.transcript")?;
//!
//!     let mut reader = TranscriptReader::open("run.transcript")?;
//!     reader.add_event_handler::<String>(|moment, line| {
//!         println!("{} {}", moment.utc, line);
//!     })?;
//!     reader.replay_all()?;
//!     reader.close()
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Writer**: buffers events (spilling sorted buckets to disk when large)
//!   and seals them exactly once
//! - **Container**: `transcript.json` header, `moments/*.jsonl` shards and
//!   `artifacts/*` inside a zip archive
//! - **Reader**: decodes ahead on a worker thread and dispatches moments
//!   without blocking
//! - **Merge**: combines several transcripts into one global timeline

pub mod config;
pub mod container;
pub mod error;
pub mod grouping;
pub mod merge;
pub mod model;
pub mod payload;
pub mod reader;
pub mod writer;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ReaderConfig, TranscriptConfig, WriterConfig};
    pub use crate::error::{ErrorKind, Result, TranscriptError};
    pub use crate::merge::merge_transcripts;
    pub use crate::model::{
        CommonHeader, EventRecord, HeaderEntry, Moment, MomentInfo, ShardReference,
        TranscriptHeader,
    };
    pub use crate::payload::{EventPayload, PayloadRegistry};
    pub use crate::reader::TranscriptReader;
    pub use crate::writer::TranscriptWriter;
}
