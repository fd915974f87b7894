//! Detection-response parsing: extract labeled boxes from annotated model
//! output.
//!
//! The model wraps each detected region in a literal tag pair:
//!
//! ```text
//! <|ref|>LABEL<|/ref|><|det|>[[x1,y1,x2,y2], …]<|/det|>
//! ```
//!
//! The coordinate payload is only JSON-shaped: real responses contain
//! full-width punctuation, stray `<|…|>` fragments, and several competing
//! nesting conventions. Parsing is therefore tolerant end to end — anything
//! that cannot be coerced into a box is dropped without failing the page.
//!
//! Coordinates live in a `[0, 999]` normalized space on both axes and are
//! scaled to pixel space with `floor(v / 999 * dim)`. The divisor is 999,
//! not 1000; the model's convention is open at 999 and the conversion must
//! stay bit-exact.

use crate::output::Detection;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Matches one detection block; `(?s)` lets labels and payloads span lines.
pub(crate) static DETECTION_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\|ref\|>(?P<label>.*?)<\|/ref\|>\s*<\|det\|>(?P<coords>.*?)<\|/det\|>")
        .expect("detection block regex")
});

static TAG_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|.*?\|>").expect("tag fragment regex"));

/// Labels whose blocks carry running text the model already transcribed
/// elsewhere; their contents never reach the Markdown.
const TEXTUAL_LABEL_KEYWORDS: &[&str] = &[
    "text",
    "title",
    "subtitle",
    "sub_title",
    "caption",
    "paragraph",
    "header",
    "footer",
    "footnote",
    "list",
    "figure",
    "table",
    "page_number",
];

/// A label is textual when its lowercased, trimmed form contains any of the
/// keywords. An empty label counts as textual.
pub(crate) fn is_textual_label(label: &str) -> bool {
    let normalized = label.trim().to_lowercase();
    if normalized.is_empty() {
        return true;
    }
    TEXTUAL_LABEL_KEYWORDS
        .iter()
        .any(|keyword| normalized.contains(keyword))
}

/// Map the full-width punctuation the model mixes into coordinate payloads
/// onto ASCII equivalents.
fn replace_full_width(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '，' | '、' | '；' => ',',
            '。' => '.',
            '：' => ':',
            '【' => '[',
            '】' => ']',
            '（' => '(',
            '）' => ')',
            '％' => '%',
            '－' => '-',
            other => other,
        })
        .collect()
}

/// Reduce a raw coordinate payload to the JSON-ish `[…]` core.
///
/// Returns an empty string when no bracketed region survives cleanup.
pub(crate) fn sanitize_coords_text(raw: &str) -> String {
    let cleaned = replace_full_width(raw);
    let cleaned = TAG_FRAGMENT.replace_all(&cleaned, "");
    let cleaned = cleaned.trim();
    match (cleaned.find('['), cleaned.rfind(']')) {
        (Some(start), Some(end)) if end >= start => cleaned[start..=end].to_string(),
        _ => String::new(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn all_numeric(values: &[Value]) -> bool {
    values.iter().all(|v| as_number(v).is_some())
}

/// Decode a sanitized payload into a list of normalized-space boxes.
///
/// Accepted shapes, in priority order:
/// 1. `[x1, y1, x2, y2]` — a single flat box.
/// 2. `[[x1, y1, x2, y2], …]` — each element with four leading numbers.
/// 3. `[[[x1, y1], [x2, y2]], …]` — each element a pair of points.
///
/// Elements matching none of these are skipped.
pub(crate) fn parse_coords(raw: &str) -> Vec<[f64; 4]> {
    let cleaned = sanitize_coords_text(raw);
    if cleaned.is_empty() {
        return Vec::new();
    }
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&cleaned) else {
        return Vec::new();
    };
    normalize_coords(&items)
}

fn normalize_coords(items: &[Value]) -> Vec<[f64; 4]> {
    if items.len() == 4 && all_numeric(items) {
        let mut flat = [0.0; 4];
        for (slot, item) in flat.iter_mut().zip(items) {
            *slot = as_number(item).unwrap_or_default();
        }
        return vec![flat];
    }

    let mut boxes = Vec::new();
    for item in items {
        let Value::Array(inner) = item else {
            continue;
        };
        if inner.len() >= 4 && all_numeric(&inner[..4]) {
            let mut bx = [0.0; 4];
            for (slot, value) in bx.iter_mut().zip(&inner[..4]) {
                *slot = as_number(value).unwrap_or_default();
            }
            boxes.push(bx);
            continue;
        }
        if inner.len() >= 2 {
            if let (Value::Array(first), Value::Array(second)) = (&inner[0], &inner[1]) {
                if first.len() >= 2 && second.len() >= 2 {
                    let points = [&first[0], &first[1], &second[0], &second[1]];
                    if points.iter().all(|v| as_number(v).is_some()) {
                        boxes.push([
                            as_number(points[0]).unwrap_or_default(),
                            as_number(points[1]).unwrap_or_default(),
                            as_number(points[2]).unwrap_or_default(),
                            as_number(points[3]).unwrap_or_default(),
                        ]);
                    }
                }
            }
        }
    }
    boxes
}

/// Scale a normalized box into pixel space.
pub(crate) fn scale_box(bx: [f64; 4], width: u32, height: u32) -> [u32; 4] {
    [
        (bx[0] / 999.0 * f64::from(width)) as u32,
        (bx[1] / 999.0 * f64::from(height)) as u32,
        (bx[2] / 999.0 * f64::from(width)) as u32,
        (bx[3] / 999.0 * f64::from(height)) as u32,
    ]
}

pub(crate) fn is_degenerate(scaled: [u32; 4]) -> bool {
    scaled[2] <= scaled[0] || scaled[3] <= scaled[1]
}

/// Enumerate every detection across all blocks of a response, scaled to the
/// page's pixel dimensions. Degenerate boxes are dropped.
pub fn parse_detections(raw: &str, width: u32, height: u32) -> Vec<Detection> {
    let mut detections = Vec::new();
    for caps in DETECTION_BLOCK.captures_iter(raw) {
        let label = caps["label"].trim().to_string();
        for bx in parse_coords(&caps["coords"]) {
            let scaled = scale_box(bx, width, height);
            if is_degenerate(scaled) {
                continue;
            }
            detections.push(Detection {
                label: label.clone(),
                bounds: scaled,
            });
        }
    }
    detections
}
