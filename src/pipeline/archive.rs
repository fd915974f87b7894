//! Deliverable archive: package the outputs into one ZIP.
//!
//! Compression policy: the Markdown and JSON files deflate well; cropped
//! assets are already-compressed JPEGs (or similar) where deflate only burns
//! CPU, so recognized image suffixes are stored uncompressed.
//!
//! Entry preparation (stat, permissions, modtime) runs in a small blocking
//! pool sized from host parallelism; the ZIP itself is then written
//! sequentially in input order, reporting each written entry through a
//! callback so the controller can emit per-entry progress.

use crate::error::WorkerError;
use crate::pipeline::host_parallelism;
use futures::stream::{self, StreamExt};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Suffixes stored without compression.
const STORED_SUFFIXES: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif"];

/// One planned archive entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    /// Archive-relative name (also the path relative to `output_dir`).
    pub name: String,
    /// Absolute source path on disk.
    pub source: PathBuf,
    pub method: CompressionMethod,
}

/// A stat-ed entry ready to be written.
struct PreparedEntry {
    entry: ArchiveEntry,
    unix_mode: Option<u32>,
    modified: Option<zip::DateTime>,
}

/// Compression method for an archive entry name.
fn method_for(name: &str) -> CompressionMethod {
    let lowered = name.to_lowercase();
    if STORED_SUFFIXES.iter().any(|s| lowered.ends_with(s)) {
        CompressionMethod::Stored
    } else {
        CompressionMethod::Deflated
    }
}

/// Plan the archive contents: Markdown, JSON, then every asset in page
/// order.
pub fn plan_entries(
    output_dir: &Path,
    markdown_name: &str,
    json_name: &str,
    assets: &[String],
) -> Vec<ArchiveEntry> {
    let mut entries = Vec::with_capacity(assets.len() + 2);
    for name in [markdown_name, json_name] {
        entries.push(ArchiveEntry {
            name: name.to_string(),
            source: output_dir.join(name),
            method: CompressionMethod::Deflated,
        });
    }
    for asset in assets {
        entries.push(ArchiveEntry {
            name: asset.clone(),
            source: output_dir.join(asset),
            method: method_for(asset),
        });
    }
    entries
}

/// Write the archive to `archive_path`, invoking `on_entry` with each entry
/// name after it is written. Returns the number of entries written.
pub async fn write_archive(
    archive_path: &Path,
    entries: Vec<ArchiveEntry>,
    on_entry: impl Fn(&str) + Send + 'static,
) -> Result<usize, WorkerError> {
    let workers = prep_worker_count(entries.len());
    // `buffered` (not `buffer_unordered`): preparation may finish out of
    // order internally, but entries must reach the writer in input order.
    let prepared: Vec<Result<PreparedEntry, WorkerError>> = stream::iter(entries)
        .map(|entry| async move {
            tokio::task::spawn_blocking(move || prepare_entry(entry))
                .await
                .map_err(|e| WorkerError::Archive {
                    detail: format!("prepare task panicked: {e}"),
                })?
        })
        .buffered(workers)
        .collect()
        .await;
    let prepared: Vec<PreparedEntry> = prepared.into_iter().collect::<Result<_, _>>()?;

    let archive_path = archive_path.to_path_buf();
    tokio::task::spawn_blocking(move || write_entries(&archive_path, prepared, on_entry))
        .await
        .map_err(|e| WorkerError::Archive {
            detail: format!("archive task panicked: {e}"),
        })?
}

/// Blocking-pool size for entry preparation.
fn prep_worker_count(entry_count: usize) -> usize {
    (host_parallelism() / 2).clamp(2, entry_count.max(2))
}

fn prepare_entry(entry: ArchiveEntry) -> Result<PreparedEntry, WorkerError> {
    let metadata = std::fs::metadata(&entry.source).map_err(|e| WorkerError::Archive {
        detail: format!("stat '{}': {e}", entry.source.display()),
    })?;

    #[cfg(unix)]
    let unix_mode = {
        use std::os::unix::fs::PermissionsExt;
        Some(metadata.permissions().mode())
    };
    #[cfg(not(unix))]
    let unix_mode = None;

    let modified = metadata
        .modified()
        .ok()
        .map(time::OffsetDateTime::from)
        .and_then(|ts| zip::DateTime::try_from(ts).ok());

    Ok(PreparedEntry {
        entry,
        unix_mode,
        modified,
    })
}

fn write_entries(
    archive_path: &Path,
    prepared: Vec<PreparedEntry>,
    on_entry: impl Fn(&str),
) -> Result<usize, WorkerError> {
    let file = File::create(archive_path).map_err(|e| WorkerError::Archive {
        detail: format!("create '{}': {e}", archive_path.display()),
    })?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let count = prepared.len();

    for PreparedEntry {
        entry,
        unix_mode,
        modified,
    } in prepared
    {
        let mut options = SimpleFileOptions::default().compression_method(entry.method);
        if let Some(mode) = unix_mode {
            options = options.unix_permissions(mode);
        }
        if let Some(ts) = modified {
            options = options.last_modified_time(ts);
        }
        writer
            .start_file(entry.name.as_str(), options)
            .map_err(|e| WorkerError::Archive {
                detail: format!("entry '{}': {e}", entry.name),
            })?;

        let mut source = File::open(&entry.source).map_err(|e| WorkerError::Archive {
            detail: format!("open '{}': {e}", entry.source.display()),
        })?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = source.read(&mut buf).map_err(|e| WorkerError::Archive {
                detail: format!("read '{}': {e}", entry.source.display()),
            })?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).map_err(|e| WorkerError::Archive {
                detail: format!("write '{}': {e}", entry.name),
            })?;
        }
        on_entry(&entry.name);
    }

    writer.finish().map_err(|e| WorkerError::Archive {
        detail: format!("finish: {e}"),
    })?;
    Ok(count)
}
