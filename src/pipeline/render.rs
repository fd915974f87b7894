//! Rasterizer driver: turn the input PDF into per-page JPEGs via external
//! tools.
//!
//! Two tools sit behind an argv contract:
//!
//! * `pdfinfo <pdf>` — page count, scraped from the `Pages:` line.
//! * `pdftoppm -jpeg -r <dpi> [-f p -l p] <pdf> <prefix>` — rasterization,
//!   writing `<prefix>-<N>.jpg` per page.
//!
//! The preferred mode renders one page per invocation so pages stream into
//! the inference stage while later pages are still rendering, and a
//! cancellation aborts cleanly between pages. The subprocess startup cost is
//! the price of that overlap. When the page count cannot be obtained the
//! driver degrades to a single whole-document invocation and replays the
//! produced files as the same stream.
//!
//! `pdftoppm` pads the page number in produced filenames inconsistently
//! across versions (no padding, or 2–6 digits), so locating an output means
//! probing each width before falling back to a directory scan.

use crate::config::JobConfig;
use crate::error::WorkerError;
use crate::pipeline::host_parallelism;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One rasterized page handed to the inference stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageJob {
    /// Zero-based page index.
    pub index: usize,
    /// Path of the rendered JPEG inside the scratch directory.
    pub path: PathBuf,
}

/// The rasterizer's output: a bounded stream of completed pages plus a
/// deferred first-error slot.
pub struct RenderStream {
    /// Total page count, known up front in concurrent mode and after the
    /// single invocation in fallback mode.
    pub total_pages: usize,
    /// Completed pages, in completion order.
    pub pages: mpsc::Receiver<PageJob>,
    /// First render error, delivered after all render workers have drained.
    /// Closed without a value on success.
    pub error: mpsc::Receiver<WorkerError>,
}

/// Launch concurrent per-page rasterization.
///
/// Fails only when the page count cannot be obtained; the caller is expected
/// to switch to [`spawn_fallback`] in that case rather than surface the
/// error.
pub async fn spawn_concurrent(
    config: &JobConfig,
    work_dir: &Path,
    cancel: &CancellationToken,
) -> Result<RenderStream, WorkerError> {
    let total_pages = page_count(Path::new(&config.pdf_path)).await?;
    debug!(pages = total_pages, "page count obtained");

    let workers = render_worker_count(config);
    let (page_tx, page_rx) = mpsc::channel(channel_capacity(config));
    let (err_tx, err_rx) = mpsc::channel(1);

    let pdf_path = PathBuf::from(&config.pdf_path);
    let dpi = config.dpi();
    let prefix = work_dir.join("page");
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for page in 1..=total_pages {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }
            let pdf_path = pdf_path.clone();
            let prefix = prefix.clone();
            let page_tx = page_tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let path = render_page_range(&pdf_path, dpi, Some(page), &prefix, &cancel).await?;
                // The send must also honor cancellation: with a full buffer
                // and a consumer that stopped after an error, an unguarded
                // send would park this worker forever. A closed receiver is
                // likewise treated as cancellation.
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                    sent = page_tx.send(PageJob { index: page - 1, path }) => {
                        let _ = sent;
                    }
                }
                Ok::<(), WorkerError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let failed = match joined {
                Ok(Ok(())) => None,
                Ok(Err(WorkerError::Cancelled)) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(WorkerError::Internal(format!("render task panicked: {e}"))),
            };
            if let Some(e) = failed {
                // First error wins; the buffered slot holds exactly one.
                let _ = err_tx.try_send(e);
                cancel.cancel();
            }
        }
        // Dropping the senders closes both channels once all workers drained.
    });

    Ok(RenderStream {
        total_pages,
        pages: page_rx,
        error: err_rx,
    })
}

/// Rasterize the whole document in one invocation and replay the produced
/// pages as a stream.
///
/// Zero produced pages is the empty-document case, not an error.
pub async fn spawn_fallback(
    config: &JobConfig,
    work_dir: &Path,
    cancel: &CancellationToken,
) -> Result<RenderStream, WorkerError> {
    let prefix = work_dir.join("page");
    render_page_range(
        Path::new(&config.pdf_path),
        config.dpi(),
        None,
        &prefix,
        cancel,
    )
    .await?;

    let mut rendered = collect_rendered_pages(&prefix)?;
    rendered.sort_by_key(|(page, _)| *page);
    let total_pages = rendered.len();

    let (page_tx, page_rx) = mpsc::channel(channel_capacity(config));
    let (_err_tx, err_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        for (page, path) in rendered {
            if page_tx
                .send(PageJob { index: page - 1, path })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    Ok(RenderStream {
        total_pages,
        pages: page_rx,
        error: err_rx,
    })
}

/// Rasterizer worker pool size: the configured value, or a host-derived
/// default clamped to 2..=8.
fn render_worker_count(config: &JobConfig) -> usize {
    config
        .render_workers()
        .unwrap_or_else(|| host_parallelism().clamp(2, 8))
}

/// Page-channel buffer: the first configured concurrency knob, floored at 1.
fn channel_capacity(config: &JobConfig) -> usize {
    [
        config.max_concurrency,
        config.render_workers,
        host_parallelism() as i64,
    ]
    .into_iter()
    .find(|v| *v > 0)
    .unwrap_or(1)
    .max(1) as usize
}

/// Run the page-count tool and scrape its `Pages:` line.
async fn page_count(pdf_path: &Path) -> Result<usize, WorkerError> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| WorkerError::PageCount {
            detail: format!("pdfinfo: {e}"),
        })?;
    if !output.status.success() {
        return Err(WorkerError::PageCount {
            detail: format!(
                "pdfinfo exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    parse_page_count(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        WorkerError::PageCount {
            detail: "no 'Pages:' line in pdfinfo output".into(),
        }
    })
}

/// Extract the page count from page-count-tool output.
fn parse_page_count(stdout: &str) -> Option<usize> {
    stdout
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|token| token.parse().ok())
}

/// Invoke the rasterizer for one page (`page = Some(p)`) or the whole
/// document (`page = None`). Returns the produced file for single-page mode.
async fn render_page_range(
    pdf_path: &Path,
    dpi: u32,
    page: Option<usize>,
    prefix: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, WorkerError> {
    let mut command = Command::new("pdftoppm");
    command.arg("-jpeg").arg("-r").arg(dpi.to_string());
    if let Some(p) = page {
        command
            .arg("-f")
            .arg(p.to_string())
            .arg("-l")
            .arg(p.to_string());
    }
    command.arg(pdf_path).arg(prefix);
    // kill_on_drop: cancellation must not leave rasterizer processes behind.
    command.kill_on_drop(true);

    let page_no = page.unwrap_or(0);
    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
        result = command.output() => result.map_err(|e| WorkerError::Rasterize {
            page: page_no,
            detail: format!("pdftoppm: {e}"),
        })?,
    };
    if !output.status.success() {
        return Err(WorkerError::Rasterize {
            page: page_no,
            detail: format!(
                "pdftoppm exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    match page {
        Some(p) => locate_rendered_page(prefix, p).ok_or_else(|| {
            WorkerError::RenderedPageMissing {
                page: p,
                prefix: prefix.to_path_buf(),
            }
        }),
        None => Ok(prefix.to_path_buf()),
    }
}

/// Find the file the rasterizer produced for `page`.
///
/// Probes `<prefix>-<page>.jpg` with zero padding widths of none and 2–6
/// digits, then scans the directory for any `<prefix>-<digits>.jpg` whose
/// number matches.
fn locate_rendered_page(prefix: &Path, page: usize) -> Option<PathBuf> {
    let unpadded = format!("{page}");
    let mut candidates = vec![unpadded];
    for width in 2..=6usize {
        candidates.push(format!("{page:0width$}"));
    }
    for candidate in candidates {
        let path = prefix.with_file_name(format!(
            "{}-{candidate}.jpg",
            prefix.file_name()?.to_string_lossy()
        ));
        if path.is_file() {
            return Some(path);
        }
    }
    collect_rendered_pages(prefix)
        .ok()?
        .into_iter()
        .find(|(p, _)| *p == page)
        .map(|(_, path)| path)
}

/// Scan the prefix directory for `<prefix>-<digits>.jpg` files, returning
/// `(page_number, path)` pairs in directory order.
fn collect_rendered_pages(prefix: &Path) -> Result<Vec<(usize, PathBuf)>, WorkerError> {
    let dir = prefix.parent().unwrap_or(Path::new("."));
    let stem = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut pages = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| WorkerError::Rasterize {
        page: 0,
        detail: format!("scan '{}': {e}", dir.display()),
    })?;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(number) = name
            .strip_prefix(&stem)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(".jpg"))
        else {
            continue;
        };
        if let Ok(page) = number.parse::<usize>() {
            pages.push((page, entry.path()));
        }
    }
    Ok(pages)
}
