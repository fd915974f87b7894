//! Pipeline controller: wire the rasterizer into the page-processor pool and
//! drive finalization.
//!
//! ## Overlap and ordering
//!
//! Rendered pages stream off a bounded channel while later pages are still
//! rasterizing, and up to `max_concurrency` pages sit in inference at once.
//! Completion order is unconstrained; ordering is recovered by writing each
//! result into its slot of a pre-sized vector, so the final outputs iterate
//! pages in document order without any sorting.
//!
//! ## First-error semantics
//!
//! The render pool and the page pool each capture only their first error.
//! A page failure cancels the shared token, which aborts in-flight render
//! subprocesses and queued page workers at their next suspension point. The
//! renderer's error slot is drained after the page pool has shut down so an
//! inference failure cannot hide an earlier rasterizer failure.
//!
//! ## Dynamic progress total
//!
//! Phase 1 runs against `total = pages + 3`. The archive entry count does
//! not exist until every page has completed, so the total is raised to
//! `current + entries` just before archiving and each written entry advances
//! one step, landing exactly on 100%.

use crate::config::JobConfig;
use crate::error::WorkerError;
use crate::events::{EventWriter, ProgressSnapshot, ProgressTracker};
use crate::output::{PageResult, ResultPayload};
use crate::pipeline::{archive, finalize, page, render};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Removes the scratch directory on drop, success or failure alike.
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// First-error capture shared by the page workers.
///
/// Recording an error is a once-operation: the first caller stores its error
/// and cancels the shared token; later callers are ignored.
struct FirstError {
    slot: Mutex<Option<WorkerError>>,
    cancel: CancellationToken,
}

impl FirstError {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            cancel,
        }
    }

    fn record(&self, error: WorkerError) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.cancel.cancel();
    }

    fn take(&self) -> Option<WorkerError> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Run one conversion job to completion.
///
/// Emits `progress` events on `events` throughout; the caller emits the
/// terminal `result` (from the returned payload) or `error` event.
pub async fn run(
    config: JobConfig,
    events: Arc<EventWriter>,
) -> Result<ResultPayload, WorkerError> {
    let config = Arc::new(config);
    let output_dir = config.output_dir();
    let images_dir = output_dir.join("images");
    let work_dir = output_dir.join(".worker");
    for dir in [&output_dir, &images_dir, &work_dir] {
        std::fs::create_dir_all(dir).map_err(|source| WorkerError::CreateDir {
            path: dir.clone(),
            source,
        })?;
    }
    let _scratch = ScratchDir(work_dir.clone());

    let cancel = CancellationToken::new();
    let tracker = Arc::new(ProgressTracker::new(Arc::clone(&events)));
    tracker.announce("rendering PDF pages");

    let mut stream = match render::spawn_concurrent(&config, &work_dir, &cancel).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "concurrent rasterization unavailable, falling back to serial");
            render::spawn_fallback(&config, &work_dir, &cancel).await?
        }
    };
    let total_pages = stream.total_pages;

    if total_pages == 0 {
        info!(task_id = %config.task_id, "document has no pages");
        return Ok(ResultPayload {
            markdown_file: String::new(),
            raw_json_file: String::new(),
            archive_file: String::new(),
            pages: Vec::new(),
            images: Vec::new(),
            total_pages: 0,
            progress: ProgressSnapshot::finished("completed"),
        });
    }

    tracker.begin_pages(total_pages);
    info!(task_id = %config.task_id, pages = total_pages, "processing pages");

    // ── Page-processor pool ──────────────────────────────────────────────
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency().max(1)));
    let first_error = Arc::new(FirstError::new(cancel.clone()));
    let mut workers: JoinSet<Option<(usize, PageResult)>> = JoinSet::new();

    while let Some(job) = stream.pages.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if cancel.is_cancelled() {
            break;
        }
        tracker.announce_page(format!("page {}/{} queued", job.index + 1, total_pages));

        let config = Arc::clone(&config);
        let images_dir = images_dir.clone();
        let tracker = Arc::clone(&tracker);
        let first_error = Arc::clone(&first_error);
        let cancel = cancel.clone();
        workers.spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = page::process_page(&config, job.index, &job.path, &images_dir) => result,
            };
            match result {
                Ok(page_result) => {
                    tracker.complete_page(format!(
                        "page {}/{} recognized",
                        job.index + 1,
                        total_pages
                    ));
                    Some((job.index, page_result))
                }
                Err(error) => {
                    first_error.record(error);
                    None
                }
            }
        });
    }

    // Stop accepting pages so render workers cannot block on a channel
    // nobody is draining anymore.
    stream.pages.close();

    let mut slots: Vec<Option<PageResult>> = (0..total_pages).map(|_| None).collect();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Some((index, result))) => slots[index] = Some(result),
            Ok(None) => {}
            Err(e) => first_error.record(WorkerError::Internal(format!(
                "page worker panicked: {e}"
            ))),
        }
    }

    if let Some(error) = first_error.take() {
        // Wait out the render pool before the scratch guard runs, so no
        // rasterizer child is still writing into `.worker/` during removal.
        let _ = stream.error.recv().await;
        return Err(error);
    }
    // Renderer errors are checked only after the page pool has shut down.
    if let Some(error) = stream.error.recv().await {
        return Err(error);
    }

    let pages: Vec<PageResult> = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| {
                WorkerError::Internal(format!("page {index} completed without a result"))
            })
        })
        .collect::<Result<_, _>>()?;

    // ── Finalization ─────────────────────────────────────────────────────
    let markdown_path = output_dir.join("result.md");
    tracker.advance("writing Markdown summary");
    finalize::write_markdown(&markdown_path, &pages).await?;

    let raw_json_path = output_dir.join("raw.json");
    tracker.advance("writing raw JSON");
    finalize::write_raw_json(&raw_json_path, &pages).await?;

    let images: Vec<String> = pages
        .iter()
        .flat_map(|p| p.image_assets.iter().cloned())
        .collect();

    let archive_name = config.archive_name();
    let archive_path = output_dir.join(&archive_name);
    let entries = archive::plan_entries(&output_dir, "result.md", "raw.json", &images);
    tracker.raise_total(tracker.current() + entries.len());

    let archive_tracker = Arc::clone(&tracker);
    archive::write_archive(&archive_path, entries, move |name| {
        archive_tracker.advance(format!("archived {name}"));
    })
    .await?;

    tracker.announce("all pages processed");
    info!(task_id = %config.task_id, pages = total_pages, "conversion complete");

    Ok(ResultPayload {
        markdown_file: "result.md".to_string(),
        raw_json_file: "raw.json".to_string(),
        archive_file: archive_name,
        pages,
        images,
        total_pages,
        progress: tracker.snapshot("completed", false),
    })
}
