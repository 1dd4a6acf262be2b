//! Combining sealed transcripts
//!
//! Every shard of every input is copied under a fresh shard id. The merged
//! header carries the union of the input entries and statistics recomputed
//! from the time-ordered merge of all shards, so it always matches what a
//! reader replays.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::container::{self, ARTIFACTS_DIR, ContainerReader, ContainerWriter, read_shard};
use crate::error::{Result, TranscriptError};
use crate::grouping::MomentTimeline;
use crate::model::{CommonHeader, HeaderEntry, MomentRecord, TranscriptHeader};

struct ExtractedInput {
    root: PathBuf,
    shards: Vec<String>,
    artifacts: Vec<String>,
}

/// Moments of one extracted shard, skipping records that break ascending order
fn ascending_moments(
    path: &Path,
    shard: &str,
) -> Result<impl Iterator<Item = MomentRecord> + use<>> {
    let reader = BufReader::new(File::open(path)?);
    let name = shard.to_string();
    let mut latest: Option<DateTime<Utc>> = None;
    Ok(read_shard(reader, shard).filter(move |moment| {
        if latest.is_some_and(|latest| moment.utc <= latest) {
            tracing::warn!(shard = %name, utc = %moment.utc, "Skipping out-of-order moment");
            return false;
        }
        latest = Some(moment.utc);
        true
    }))
}

/// Merge `inputs` into a new transcript at `destination`
///
/// # Errors
///
/// `Validation` if no inputs are given, two inputs share a header key or an
/// artifact name; `Format` if an input is not a transcript; `Io` if
/// `destination` exists.
pub fn merge_transcripts<P: AsRef<Path>>(inputs: &[P], destination: impl AsRef<Path>) -> Result<()> {
    let destination = destination.as_ref();
    if inputs.is_empty() {
        return Err(TranscriptError::Validation(
            "at least one input transcript is required".to_string(),
        ));
    }
    container::ensure_vacant(destination)?;

    let scratch = tempfile::Builder::new().prefix("transcript-merge-").tempdir()?;
    let mut entries: Vec<HeaderEntry> = Vec::new();
    let mut keys = HashSet::new();
    let mut extracted = Vec::with_capacity(inputs.len());

    for (i, input) in inputs.iter().enumerate() {
        let input = input.as_ref();
        let mut reader = ContainerReader::open(input)?;
        let root = scratch.path().join(format!("input-{}", i));
        reader.extract_to(&root)?;
        let artifacts = reader.artifact_names();
        let transcript = reader.into_transcript();

        for entry in transcript.header.entries {
            if !keys.insert(entry.key.clone()) {
                return Err(TranscriptError::Validation(format!(
                    "header key '{}' appears in more than one input ('{}')",
                    entry.key,
                    input.display()
                )));
            }
            entries.push(entry);
        }

        extracted.push(ExtractedInput {
            root,
            shards: transcript
                .moment_references
                .into_iter()
                .map(|r| r.moments_file)
                .collect(),
            artifacts,
        });
    }

    let common = merged_statistics(&extracted)?;

    let mut archive = ContainerWriter::new(container::staging_file(destination)?);
    let mut references = Vec::new();
    for input in &extracted {
        for shard in &input.shards {
            let moments = ascending_moments(&input.root.join(shard), shard)?;
            references.push(archive.write_shard(moments.map(Ok))?);
        }
        for name in &input.artifacts {
            archive.add_artifact(name, &input.root.join(ARTIFACTS_DIR).join(name))?;
        }
    }

    let shards = references.len();
    let package = archive.finish(TranscriptHeader { common, entries }, references)?;
    container::persist(package, destination)?;
    close_scratch(scratch);

    tracing::info!(
        path = %destination.display(),
        inputs = inputs.len(),
        shards,
        moments = common.number_of_moments,
        events = common.number_of_events,
        "Transcripts merged"
    );
    Ok(())
}

/// Statistics of the global timeline over every input shard
fn merged_statistics(inputs: &[ExtractedInput]) -> Result<CommonHeader> {
    let mut streams = Vec::new();
    for input in inputs {
        for shard in &input.shards {
            streams.push(ascending_moments(&input.root.join(shard), shard)?);
        }
    }

    let mut common = CommonHeader::default();
    for moment in MomentTimeline::new(streams) {
        common.observe(moment.utc, moment.events.len());
    }
    Ok(common)
}

fn close_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove merge scratch directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::reader::TranscriptReader;
    use crate::writer::TranscriptWriter;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::{Arc, Mutex};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn node_transcript(dir: &TempDir, node: &str, secs: &[i64]) -> PathBuf {
        let path = dir.path().join(format!("{}.transcript", node));
        let writer = TranscriptWriter::new().unwrap();
        writer.add_header(node, &secs.len()).unwrap();
        for s in secs {
            writer.add(t(*s), &format!("{}@{}", node, s)).unwrap();
        }
        writer.finalize(&path).unwrap();
        path
    }

    #[test]
    fn test_merge_interleaves_inputs() {
        let dir = TempDir::new().unwrap();
        let a = node_transcript(&dir, "a", &[0, 3, 6]);
        let b = node_transcript(&dir, "b", &[1, 3, 8]);
        let merged = dir.path().join("merged.transcript");

        merge_transcripts(&[&a, &b], &merged).unwrap();

        let mut reader = TranscriptReader::open(&merged).unwrap();
        assert_eq!(reader.shards().unwrap().len(), 2);
        assert_eq!(reader.get_header::<usize>("a").unwrap(), 3);
        assert_eq!(reader.get_header::<usize>("b").unwrap(), 3);

        let common = reader.common().unwrap();
        assert_eq!(common.number_of_moments, 5);
        assert_eq!(common.number_of_events, 6);
        assert_eq!(common.earliest_utc, Some(t(0)));
        assert_eq!(common.latest_utc, Some(t(8)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        reader
            .add_event_handler::<String>(move |info, line| {
                s.lock().unwrap().push(format!("{}:{}", info.index, line))
            })
            .unwrap();
        assert_eq!(reader.replay_all().unwrap(), 5);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["0:a@0", "1:b@1", "2:a@3", "2:b@3", "3:a@6", "4:b@8"]
        );
    }

    #[test]
    fn test_duplicate_header_key_rejected() {
        let dir = TempDir::new().unwrap();
        let a = node_transcript(&dir, "same", &[0]);
        let copy = dir.path().join("copy.transcript");
        std::fs::copy(&a, &copy).unwrap();

        let merged = dir.path().join("merged.transcript");
        let err = merge_transcripts(&[&a, &copy], &merged).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!merged.exists());
    }

    #[test]
    fn test_existing_destination_and_empty_inputs() {
        let dir = TempDir::new().unwrap();
        let a = node_transcript(&dir, "a", &[0]);

        let err = merge_transcripts(&[&a], &a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let none: [&Path; 0] = [];
        let err = merge_transcripts(&none, dir.path().join("out.transcript")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
