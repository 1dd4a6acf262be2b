//! Transcript CLI - Inspect, replay and combine transcript archives

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use transcript_core::prelude::*;

#[derive(Parser)]
#[command(name = "transcript")]
#[command(about = "Transcript archive tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to transcript.toml and TRANSCRIPT_* variables)
    #[arg(long, global = true, env = "TRANSCRIPT_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header, statistics, shards and artifacts
    Inspect {
        /// Transcript archive
        path: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay every moment in time order
    Replay {
        /// Transcript archive
        path: PathBuf,
        /// Only print the summary
        #[arg(short, long)]
        quiet: bool,
        /// Fail if the replayed statistics differ from the header
        #[arg(long)]
        verify: bool,
    },
    /// Extract an included artifact
    Artifact {
        /// Transcript archive
        path: PathBuf,
        /// Artifact name
        name: String,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge several transcripts into one
    Merge {
        /// Destination archive; must not exist
        output: PathBuf,
        /// Input archives
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Version information
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<TranscriptConfig> {
    let config = match path {
        Some(path) => TranscriptConfig::from_file(path)?,
        None => TranscriptConfig::load()?,
    };
    Ok(config)
}

fn format_utc(utc: Option<chrono::DateTime<chrono::Utc>>) -> String {
    utc.map(|utc| utc.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

fn inspect(path: &PathBuf, json: bool, config: ReaderConfig) -> Result<()> {
    let mut reader = TranscriptReader::open_with_config(path, config)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let header = reader.header()?.clone();
    let shards = reader.shards()?.to_vec();
    let artifacts = reader.artifacts()?.to_vec();
    reader.close()?;

    if json {
        let value = serde_json::json!({
            "Header": header,
            "MomentReferences": shards,
            "Artifacts": artifacts,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let common = header.common;
    println!("Transcript: {}", path.display());
    println!("  Moments:  {}", common.number_of_moments);
    println!("  Events:   {}", common.number_of_events);
    println!("  Earliest: {}", format_utc(common.earliest_utc));
    println!("  Latest:   {}", format_utc(common.latest_utc));

    println!("Header entries ({}):", header.entries.len());
    for entry in &header.entries {
        println!("  {} = {}", entry.key, entry.value);
    }

    println!("Shards ({}):", shards.len());
    for shard in &shards {
        println!(
            "  {} ({} moments, {} events)",
            shard.moments_file, shard.stats.number_of_moments, shard.stats.number_of_events
        );
    }

    println!("Artifacts ({}):", artifacts.len());
    for name in &artifacts {
        println!("  {}", name);
    }
    Ok(())
}

fn replay(path: &PathBuf, quiet: bool, verify: bool, config: ReaderConfig) -> Result<()> {
    let mut reader = TranscriptReader::open_with_config(path, config)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let recorded = reader.common()?;

    let observed = Arc::new(Mutex::new(CommonHeader::default()));
    let o = observed.clone();
    reader.add_moment_handler(move |moment| {
        if let Ok(mut stats) = o.lock() {
            stats.observe(moment.utc, moment.event_count);
        }
        if !quiet {
            let duration = moment
                .duration
                .map(|d| format!("+{}ms", d.num_milliseconds()))
                .unwrap_or_else(|| "end".to_string());
            println!(
                "#{} {} ({}, {} events)",
                moment.index,
                moment.utc.to_rfc3339(),
                duration,
                moment.event_count
            );
        }
    })?;
    if !quiet {
        reader.add_raw_event_handler(|_, event| {
            println!("    {} {}", event.type_tag, event.payload);
        })?;
    }

    let delivered = reader.replay_all()?;
    reader.close()?;

    let observed = *observed
        .lock()
        .map_err(|_| anyhow::anyhow!("replay statistics lock poisoned"))?;
    println!(
        "Replayed {} moments, {} events",
        delivered, observed.number_of_events
    );

    if verify {
        if observed != recorded {
            bail!(
                "Header mismatch: recorded {:?}, replayed {:?}",
                recorded,
                observed
            );
        }
        println!("Header statistics verified");
    }
    Ok(())
}

fn artifact(path: &PathBuf, name: &str, output: Option<&PathBuf>, config: ReaderConfig) -> Result<()> {
    let mut reader = TranscriptReader::open_with_config(path, config)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let bytes = reader.read_artifact(name)?;
    reader.close()?;

    match output {
        Some(output) => {
            std::fs::write(output, &bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            tracing::info!(artifact = name, output = %output.display(), bytes = bytes.len(), "Artifact extracted");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("transcript {}", env!("CARGO_PKG_VERSION"));
            println!("transcript-core {}", transcript_core::VERSION);
        }
        Commands::Inspect { path, json } => {
            let config = load_config(cli.config.as_ref())?;
            inspect(&path, json, config.reader)?;
        }
        Commands::Replay {
            path,
            quiet,
            verify,
        } => {
            let config = load_config(cli.config.as_ref())?;
            replay(&path, quiet, verify, config.reader)?;
        }
        Commands::Artifact { path, name, output } => {
            let config = load_config(cli.config.as_ref())?;
            artifact(&path, &name, output.as_ref(), config.reader)?;
        }
        Commands::Merge { output, inputs } => {
            merge_transcripts(&inputs, &output)?;
            println!("Merged {} transcripts into {}", inputs.len(), output.display());
        }
    }

    Ok(())
}
