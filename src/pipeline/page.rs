//! Per-page processing: the fan-out unit the pipeline controller spawns.
//!
//! A page flows decode → base64 → inference → rewrite/enumerate. Image
//! decoding and the rewrite (which crops and writes JPEGs) are CPU- and
//! disk-bound, so both run under `spawn_blocking` to keep the runtime's
//! worker threads free for the many concurrent inference calls.
//!
//! Side effects are confined to `images/`; the rendered page image in the
//! scratch directory is read once and never touched again.

use crate::config::JobConfig;
use crate::error::WorkerError;
use crate::output::PageResult;
use crate::pipeline::{grounding, infer, rewrite};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Process one rendered page into a [`PageResult`].
///
/// Any error is fatal for the run; empty inference text is not an error.
pub async fn process_page(
    config: &JobConfig,
    index: usize,
    image_path: &Path,
    images_dir: &Path,
) -> Result<PageResult, WorkerError> {
    let bytes = tokio::fs::read(image_path)
        .await
        .map_err(|e| WorkerError::ImageDecode {
            path: image_path.to_path_buf(),
            detail: format!("read: {e}"),
        })?;

    let decode_path = image_path.to_path_buf();
    let (page_image, bytes) = tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map(|img| (img, bytes))
            .map_err(|e| WorkerError::ImageDecode {
                path: decode_path,
                detail: e.to_string(),
            })
    })
    .await
    .map_err(|e| WorkerError::Internal(format!("decode task panicked: {e}")))??;

    let image_base64 = STANDARD.encode(&bytes);
    drop(bytes);

    let raw_text = infer::run_inference(config, &image_base64).await?;
    if raw_text.trim().is_empty() {
        // The inference client already warned after its retries; this is the
        // page-level trace for correlating which image came back blank.
        debug!(
            task_id = %config.task_id,
            page = index,
            image = %image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "page produced no OCR text"
        );
    }

    let images_dir: PathBuf = images_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<PageResult, WorkerError> {
        let outcome = rewrite::rewrite_page(&raw_text, &page_image, index, &images_dir)?;
        let boxes =
            grounding::parse_detections(&raw_text, page_image.width(), page_image.height());
        Ok(PageResult::new(
            index,
            raw_text,
            outcome.markdown,
            boxes,
            outcome.assets,
        ))
    })
    .await
    .map_err(|e| WorkerError::Internal(format!("rewrite task panicked: {e}")))?
}
