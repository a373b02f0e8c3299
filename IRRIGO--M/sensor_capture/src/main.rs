use std::{
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use irrigo_capture::CaptureSession;
use record_sink::{to_pretty_json, JsonLinesSink, SnapshotFileSink};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(
    name = "irrigo-capture",
    version,
    about = "Parse a sensor dump from stdin and print it as JSON"
)]
struct Cli {
    /// Name of the sensor; selects the `[<sensor>:<section>]` headers to read.
    #[arg(short, long)]
    sensor: String,
    /// Also write the record to `<DIR>/<sensor>.json`.
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Append the record as one JSON line to this file.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Structured JSON log file for this run.
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut raw = Vec::new();
    io::stdin()
        .read_to_end(&mut raw)
        .context("reading sensor dump from stdin")?;
    let raw = String::from_utf8_lossy(&raw);

    let mut builder = CaptureSession::builder();
    if let Some(path) = &cli.log {
        builder = builder.log_path(path);
    }
    if let Some(dir) = &cli.save_dir {
        let sink = SnapshotFileSink::new(dir)
            .with_context(|| format!("preparing snapshot dir {}", dir.display()))?;
        builder = builder.sink(Arc::new(sink));
    }
    if let Some(path) = &cli.archive {
        let sink = JsonLinesSink::new(path)
            .with_context(|| format!("preparing archive {}", path.display()))?;
        builder = builder.sink(Arc::new(sink));
    }
    let session = builder.build()?;

    let runtime = Runtime::new()?;
    let record = runtime.block_on(session.capture(&raw, &cli.sensor))?;
    println!("{}", to_pretty_json(&record)?);
    Ok(())
}
