//! Container format
//!
//! A transcript is a zip archive:
//!
//! ```text
//! transcript.json            header + one reference per shard
//! moments/<uuid>.jsonl       one shard: a MomentRecord per line, ascending Utc
//! artifacts/<file name>      verbatim attachments (optional)
//! ```
//!
//! The header is a small separate entry so it can be read before any shard is
//! decoded, and shards are line-delimited so they can be stream-decoded.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use uuid::Uuid;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Result, TranscriptError};
use crate::model::{CommonHeader, MomentRecord, ShardReference, TranscriptFile, TranscriptHeader};

/// Entry holding the encoded [`TranscriptFile`]
pub const TRANSCRIPT_ENTRY: &str = "transcript.json";

/// Folder holding shard entries
pub const MOMENTS_DIR: &str = "moments";

/// Folder holding verbatim artifacts
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Fresh entry name for a shard
pub fn new_shard_name() -> String {
    format!("{}/{}.jsonl", MOMENTS_DIR, Uuid::new_v4())
}

fn artifact_entry(name: &str) -> String {
    format!("{}/{}", ARTIFACTS_DIR, name)
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Fail with `AlreadyExists` if something is at `destination`
pub fn ensure_vacant(destination: &Path) -> Result<()> {
    if destination.exists() {
        return Err(TranscriptError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("destination '{}' already exists", destination.display()),
        )));
    }
    Ok(())
}

/// Temporary file next to `destination` to package an archive into
pub(crate) fn staging_file(destination: &Path) -> Result<BufWriter<NamedTempFile>> {
    ensure_vacant(destination)?;
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(BufWriter::new(NamedTempFile::new_in(parent)?))
}

/// Flush a packaged archive and move it into place without overwriting
pub(crate) fn persist(package: BufWriter<NamedTempFile>, destination: &Path) -> Result<()> {
    let package = package
        .into_inner()
        .map_err(|e| TranscriptError::Io(e.into_error()))?;
    package.as_file().sync_all()?;
    package
        .persist_noclobber(destination)
        .map_err(|e| TranscriptError::Io(e.error))?;
    Ok(())
}

/// Streams shards, artifacts and finally the header into a zip archive
pub struct ContainerWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    artifacts: BTreeSet<String>,
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
            artifacts: BTreeSet::new(),
        }
    }

    /// Write one shard from an ascending moment stream
    ///
    /// Returns the shard's reference with statistics computed while writing.
    pub fn write_shard<I>(&mut self, moments: I) -> Result<ShardReference>
    where
        I: IntoIterator<Item = Result<MomentRecord>>,
    {
        let moments_file = new_shard_name();
        self.zip
            .start_file(moments_file.as_str(), entry_options().large_file(true))?;

        let mut stats = CommonHeader::default();
        for moment in moments {
            let moment = moment?;
            if let Some(latest) = stats.latest_utc {
                if moment.utc <= latest {
                    return Err(TranscriptError::Validation(format!(
                        "shard moments must be strictly ascending: {} after {}",
                        moment.utc, latest
                    )));
                }
            }
            stats.observe(moment.utc, moment.events.len());
            serde_json::to_writer(&mut self.zip, &moment)?;
            self.zip.write_all(b"\n")?;
        }

        tracing::debug!(
            shard = %moments_file,
            moments = stats.number_of_moments,
            events = stats.number_of_events,
            "Wrote shard"
        );

        Ok(ShardReference {
            moments_file,
            stats,
        })
    }

    /// Copy a file verbatim into the artifacts folder under `name`
    pub fn add_artifact(&mut self, name: &str, source: &Path) -> Result<()> {
        if !self.artifacts.insert(name.to_string()) {
            return Err(TranscriptError::Validation(format!(
                "artifact '{}' is already included",
                name
            )));
        }
        let mut file = File::open(source)?;
        self.zip.start_file(artifact_entry(name), entry_options())?;
        std::io::copy(&mut file, &mut self.zip)?;
        Ok(())
    }

    /// Write the header entry and close the archive
    pub fn finish(
        mut self,
        header: TranscriptHeader,
        moment_references: Vec<ShardReference>,
    ) -> Result<W> {
        let transcript = TranscriptFile {
            header,
            moment_references,
        };
        self.zip.start_file(TRANSCRIPT_ENTRY, entry_options())?;
        serde_json::to_writer_pretty(&mut self.zip, &transcript)?;
        Ok(self.zip.finish()?)
    }
}

/// Validated, opened transcript archive
#[derive(Debug)]
pub struct ContainerReader {
    archive: ZipArchive<BufReader<File>>,
    transcript: TranscriptFile,
}

impl ContainerReader {
    /// Open an archive and decode its header
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be opened, `Format` if it is not a zip archive,
    /// lacks the header entry, the header does not decode or a referenced
    /// shard entry is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut archive =
            ZipArchive::new(BufReader::new(file)).map_err(TranscriptError::not_a_transcript)?;

        let transcript = read_transcript_entry(&mut archive)?;
        for reference in &transcript.moment_references {
            if archive.index_for_name(&reference.moments_file).is_none() {
                return Err(TranscriptError::not_a_transcript(format!(
                    "shard entry '{}' is missing",
                    reference.moments_file
                )));
            }
        }

        Ok(Self {
            archive,
            transcript,
        })
    }

    /// Decoded `transcript.json`
    pub fn transcript(&self) -> &TranscriptFile {
        &self.transcript
    }

    /// Names of included artifacts
    pub fn artifact_names(&self) -> Vec<String> {
        let prefix = format!("{}/", ARTIFACTS_DIR);
        let mut names: Vec<String> = self
            .archive
            .file_names()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter(|name| !name.is_empty() && !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    /// Read an artifact's bytes
    pub fn read_artifact(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = match self.archive.by_name(&artifact_entry(name)) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(TranscriptError::Validation(format!(
                    "artifact '{}' not found",
                    name
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Extract only the referenced shard entries below `dir`
    pub fn extract_shards(&mut self, dir: &Path) -> Result<()> {
        for reference in &self.transcript.moment_references {
            let mut entry = self.archive.by_name(&reference.moments_file)?;
            let relative = entry.enclosed_name().ok_or_else(|| {
                TranscriptError::not_a_transcript(format!(
                    "shard entry '{}' escapes the archive",
                    reference.moments_file
                ))
            })?;
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = BufWriter::new(File::create(&target)?);
            std::io::copy(&mut entry, &mut out)?;
            out.flush()?;
        }
        Ok(())
    }

    /// Extract every entry below `dir`
    pub fn extract_to(&mut self, dir: &Path) -> Result<()> {
        self.archive.extract(dir)?;
        Ok(())
    }

    pub fn into_transcript(self) -> TranscriptFile {
        self.transcript
    }
}

fn read_transcript_entry<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<TranscriptFile> {
    let mut entry = match archive.by_name(TRANSCRIPT_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(TranscriptError::not_a_transcript(format!(
                "no '{}' entry",
                TRANSCRIPT_ENTRY
            )));
        }
        Err(e) => return Err(TranscriptError::not_a_transcript(e)),
    };

    let mut json = String::new();
    entry
        .read_to_string(&mut json)
        .map_err(TranscriptError::not_a_transcript)?;

    serde_json::from_str(&json).map_err(|e| {
        TranscriptError::not_a_transcript(format!("header does not decode: {}", e))
    })
}

/// Stream the moment records of an extracted shard
///
/// Lines that are not valid UTF-8 or do not decode are logged and skipped;
/// only an I/O error ends the stream.
pub fn read_shard<R: BufRead>(
    reader: R,
    shard: &str,
) -> impl Iterator<Item = MomentRecord> + use<R> {
    let shard = shard.to_string();
    reader
        .split(b'\n')
        .enumerate()
        .map_while({
            let shard = shard.clone();
            move |(line_no, line)| match line {
                Ok(line) => Some((line_no, line)),
                Err(e) => {
                    tracing::warn!(shard = %shard, error = %e, "Stopped reading shard");
                    None
                }
            }
        })
        .filter(|(_, line)| !line.trim_ascii().is_empty())
        .filter_map(move |(line_no, line)| match serde_json::from_slice::<MomentRecord>(&line) {
            Ok(moment) => Some(moment),
            Err(e) => {
                tracing::warn!(
                    shard = %shard,
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed moment record"
                );
                None
            }
        })
}
