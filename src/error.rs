//! Error types for the pdfworker library.
//!
//! Every failure that aborts a run is a [`WorkerError`]. The binary turns the
//! error into a single `{"type":"error"}` event on stdout and exits non-zero,
//! so the `Display` strings here are exactly what operators see — they carry
//! enough context (paths, pages, HTTP status) to diagnose a failed job from
//! the event stream alone.
//!
//! Two failure classes deliberately do NOT appear here:
//!
//! * Whitespace-only inference responses — retried, then logged and treated
//!   as an empty page.
//! * Unparseable detection coordinate payloads — the affected blocks are
//!   silently dropped from the page's Markdown and box list.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors surfaced by a conversion run.
#[derive(Debug, Error)]
pub enum WorkerError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// The config file could not be read.
    #[error("failed to read config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON.
    #[error("invalid config '{path}': {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    /// A required config field is empty or absent.
    #[error("config missing required field '{field}'")]
    MissingField { field: &'static str },

    // ── Filesystem ────────────────────────────────────────────────────────
    /// A directory under `output_dir` could not be created.
    #[error("failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One of the final output files could not be written.
    #[error("failed to write '{path}': {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Rasterization ─────────────────────────────────────────────────────
    /// The page-count tool failed or produced unusable output.
    ///
    /// This error never reaches the event stream: the controller catches it
    /// and switches to the serial rasterization fallback.
    #[error("page count unavailable: {detail}")]
    PageCount { detail: String },

    /// The rasterizer tool failed for a page (or for the whole document in
    /// fallback mode, where `page` is 0).
    #[error("rasterization failed for page {page}: {detail}")]
    Rasterize { page: usize, detail: String },

    /// The rasterizer exited cleanly but the expected page image was not
    /// found under any known name padding.
    #[error("rendered page {page} not found under prefix '{prefix}'")]
    RenderedPageMissing { page: usize, prefix: PathBuf },

    // ── Inference ─────────────────────────────────────────────────────────
    /// The inference endpoint returned a non-200 status.
    #[error("inference failed: status {status}: {body}")]
    InferenceStatus { status: u16, body: String },

    /// The HTTP request itself failed (connect, TLS, mid-body).
    #[error("inference request failed: {detail}")]
    InferenceTransport { detail: String },

    /// The per-call deadline elapsed.
    #[error("inference timed out after {secs}s")]
    InferenceTimeout { secs: u64 },

    /// The endpoint returned 200 with a body that is not the documented
    /// `{"text": …}` shape. Not retried.
    #[error("inference response undecodable: {detail}")]
    InferenceDecode { detail: String },

    // ── Page processing ───────────────────────────────────────────────────
    /// A rendered page image could not be decoded.
    #[error("failed to decode page image '{path}': {detail}")]
    ImageDecode { path: PathBuf, detail: String },

    /// A cropped image asset could not be written under `images/`.
    #[error("failed to write image asset '{path}': {source}")]
    AssetWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Archival ──────────────────────────────────────────────────────────
    /// The result archive could not be produced.
    #[error("archive failed: {detail}")]
    Archive { detail: String },

    // ── Control flow ──────────────────────────────────────────────────────
    /// Internal sentinel: the shared cancellation token fired before this
    /// worker finished. Pool drains filter it out, so it never reaches the
    /// event stream — the sibling error that triggered the cancellation is
    /// reported instead.
    #[error("run cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}
