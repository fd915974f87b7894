//! Final output assembly: `result.md` and `raw.json`.
//!
//! Both files iterate the ordered results vector, so their page order is the
//! document's page order no matter how pages completed.

use crate::error::WorkerError;
use crate::output::PageResult;
use serde::Serialize;
use std::path::Path;

/// Separator between pages in the assembled Markdown document.
const PAGE_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Serialize)]
struct RawDocument<'a> {
    pages: &'a [PageResult],
}

/// Assemble the whole-document Markdown.
///
/// Each page contributes a 1-based `<!-- page:P -->` header; pages with no
/// content contribute the header alone.
pub fn render_markdown(pages: &[PageResult]) -> String {
    let blocks: Vec<String> = pages
        .iter()
        .map(|page| {
            let header = format!("<!-- page:{} -->", page.page_number);
            let content = page.markdown.trim();
            if content.is_empty() {
                header
            } else {
                format!("{header}\n\n{content}")
            }
        })
        .collect();
    blocks.join(PAGE_SEPARATOR)
}

/// Serialize the JSON sidecar: two-space indent, one trailing newline.
///
/// `serde_json` never escapes HTML in strings, so `<!-- … -->` markers and
/// raw model tags survive verbatim.
pub fn render_raw_json(pages: &[PageResult]) -> Result<String, WorkerError> {
    let mut json = serde_json::to_string_pretty(&RawDocument { pages })
        .map_err(|e| WorkerError::Internal(format!("raw.json serialization: {e}")))?;
    json.push('\n');
    Ok(json)
}

/// Write the Markdown summary to `path`.
pub async fn write_markdown(path: &Path, pages: &[PageResult]) -> Result<(), WorkerError> {
    tokio::fs::write(path, render_markdown(pages))
        .await
        .map_err(|source| WorkerError::WriteOutput {
            path: path.to_path_buf(),
            source,
        })
}

/// Write the JSON sidecar to `path`.
pub async fn write_raw_json(path: &Path, pages: &[PageResult]) -> Result<(), WorkerError> {
    let json = render_raw_json(pages)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|source| WorkerError::WriteOutput {
            path: path.to_path_buf(),
            source,
        })
}
