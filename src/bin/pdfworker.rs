//! CLI binary for pdfworker.
//!
//! A thin shim over the library: load the job config, run the pipeline, and
//! keep the stdout contract honest — stdout carries only the event stream,
//! all logging goes to stderr.

use clap::Parser;
use pdfworker::{convert, EventWriter, JobConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Convert one PDF into Markdown, detection metadata, and an archive.
#[derive(Parser, Debug)]
#[command(
    name = "pdfworker",
    version,
    about = "PDF-to-Markdown OCR worker driven by a JSON job config",
    long_about = "Runs one conversion job described by a JSON config file and reports \
progress as line-delimited JSON events on stdout. Exits 0 after a result event, \
1 after an error event."
)]
struct Cli {
    /// Path to the job config JSON file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let events = Arc::new(EventWriter::stdout());

    let config = match JobConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            events.error(&e.to_string());
            std::process::exit(1);
        }
    };

    match convert::run(config, Arc::clone(&events)).await {
        Ok(payload) => events.result(&payload),
        Err(e) => {
            events.error(&e.to_string());
            std::process::exit(1);
        }
    }
}
