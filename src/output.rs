//! Output data model: per-page results and the final result payload.
//!
//! These types serialize directly into `raw.json` and the terminal
//! `{"type":"result"}` event, so field names here ARE the wire format.

use crate::events::ProgressSnapshot;
use serde::{Deserialize, Serialize};

/// One detection box in image-space pixel coordinates.
///
/// Produced by scaling the model's `[0, 999]`-normalized coordinates to the
/// rendered page's dimensions; degenerate rectangles never survive scaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    /// Label text between the `ref` tags, trimmed.
    pub label: String,
    /// `[x1, y1, x2, y2]` with `x2 > x1` and `y2 > y1`.
    #[serde(rename = "box")]
    pub bounds: [u32; 4],
}

/// The fully processed result of one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// Zero-based page ordinal within the document.
    pub index: usize,
    /// One-based page number (`index + 1`), kept explicit for consumers.
    pub page_number: usize,
    /// Unmodified model output for the page.
    pub raw_text: String,
    /// Rewritten Markdown with detection blocks resolved.
    pub markdown: String,
    /// All detection boxes found on the page, in block order.
    pub boxes: Vec<Detection>,
    /// Relative paths (under `output_dir`) of cropped image assets, in the
    /// order their references appear in the Markdown.
    pub image_assets: Vec<String>,
}

impl PageResult {
    pub fn new(
        index: usize,
        raw_text: String,
        markdown: String,
        boxes: Vec<Detection>,
        image_assets: Vec<String>,
    ) -> Self {
        Self {
            index,
            page_number: index + 1,
            raw_text,
            markdown,
            boxes,
            image_assets,
        }
    }
}

/// Body of the terminal `{"type":"result"}` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Basename of the Markdown file within `output_dir`.
    pub markdown_file: String,
    /// Basename of the JSON sidecar within `output_dir`.
    pub raw_json_file: String,
    /// Basename of the archive within `output_dir`.
    pub archive_file: String,
    /// Per-page results in strictly ascending `index` order.
    pub pages: Vec<PageResult>,
    /// Flat list of every image-asset relative path, in page order.
    pub images: Vec<String>,
    pub total_pages: usize,
    /// Final progress snapshot (`percent` is always `100.0`).
    pub progress: ProgressSnapshot,
}
