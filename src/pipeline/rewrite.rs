//! Markdown rewriting: resolve detection blocks into prose, image
//! references, and cropped assets.
//!
//! The walk preserves everything between blocks verbatim and dispatches each
//! block on its label:
//!
//! * `image` — every valid box is cropped out of the page render and saved
//!   as a JPEG under `images/`; the block becomes one `![](…)` reference per
//!   crop.
//! * textual labels — the model already transcribed these regions as running
//!   text, so the block (markers and contents) is dropped outright.
//! * anything else — replaced by an HTML comment carrying the label, keeping
//!   the position visible to downstream consumers without inventing content.
//!
//! Asset names are `page-<p>-img-<n>.jpg` with `n` a per-page counter that
//! runs across all image blocks on the page, so every path a run emits is
//! unique.

use crate::error::WorkerError;
use crate::pipeline::grounding::{
    is_degenerate, is_textual_label, parse_coords, scale_box, DETECTION_BLOCK,
};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// JPEG quality for cropped assets.
const ASSET_JPEG_QUALITY: u8 = 95;

static NEWLINE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("newline run regex"));

/// Rewritten page text plus the assets the rewrite produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub markdown: String,
    /// Relative asset paths (`images/…`) in reference order.
    pub assets: Vec<String>,
}

/// Rewrite one page's raw model output into Markdown, cropping `image`
/// regions out of `page_image` into `images_dir`.
pub fn rewrite_page(
    raw: &str,
    page_image: &DynamicImage,
    page_index: usize,
    images_dir: &Path,
) -> Result<RewriteOutcome, WorkerError> {
    let width = page_image.width();
    let height = page_image.height();

    let mut markdown = String::with_capacity(raw.len());
    let mut assets = Vec::new();
    let mut cursor = 0;
    let mut asset_counter = 0usize;

    for caps in DETECTION_BLOCK.captures_iter(raw) {
        let whole = caps.get(0).expect("group 0 always present");
        markdown.push_str(&raw[cursor..whole.start()]);
        cursor = whole.end();

        let label = caps["label"].trim();
        if label.eq_ignore_ascii_case("image") {
            let mut references = Vec::new();
            for bx in parse_coords(&caps["coords"]) {
                let scaled = scale_box(bx, width, height);
                if is_degenerate(scaled) {
                    continue;
                }
                let name = format!("images/page-{page_index}-img-{asset_counter}.jpg");
                let file_name = format!("page-{page_index}-img-{asset_counter}.jpg");
                if crop_and_save(page_image, scaled, &images_dir.join(&file_name))? {
                    asset_counter += 1;
                    references.push(format!("![]({name})"));
                    assets.push(name);
                }
            }
            markdown.push_str(&references.join("\n"));
        } else if is_textual_label(label) {
            // transcribed elsewhere in the response; drop the whole block
        } else {
            markdown.push_str(&format!("<!-- {label} -->"));
        }
    }
    markdown.push_str(&raw[cursor..]);

    let cleaned = markdown.replace("<|grounding|>", "");
    let cleaned = NEWLINE_RUNS.replace_all(&cleaned, "\n\n");
    Ok(RewriteOutcome {
        markdown: cleaned.trim().to_string(),
        assets,
    })
}

/// Crop `rect` out of the page render and write it as a JPEG.
///
/// The rectangle is intersected with the image bounds first; an empty
/// intersection skips the asset and returns `false`.
fn crop_and_save(
    page_image: &DynamicImage,
    rect: [u32; 4],
    dest: &Path,
) -> Result<bool, WorkerError> {
    let x1 = rect[0].min(page_image.width());
    let y1 = rect[1].min(page_image.height());
    let x2 = rect[2].min(page_image.width());
    let y2 = rect[3].min(page_image.height());
    if x2 <= x1 || y2 <= y1 {
        return Ok(false);
    }

    let cropped = page_image.crop_imm(x1, y1, x2 - x1, y2 - y1).into_rgb8();
    let file = File::create(dest).map_err(|source| WorkerError::AssetWrite {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, ASSET_JPEG_QUALITY);
    cropped
        .write_with_encoder(encoder)
        .map_err(|e| WorkerError::AssetWrite {
            path: dest.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
    Ok(true)
}
