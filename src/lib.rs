//! # pdfworker
//!
//! Batch worker that converts one PDF document into Markdown, detection
//! metadata, and a packaged archive by reading every page with a remote
//! vision-language model.
//!
//! ## Why a worker process?
//!
//! The conversion is driven by a parent service that launches `pdfworker
//! --config job.json` per document and consumes line-delimited JSON events
//! from stdout. Keeping the worker a separate process isolates the heavy
//! rasterization/inference pipeline, gives the parent a trivially portable
//! integration surface (spawn, read lines, check exit code), and lets a
//! crashed job take nothing else down with it.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Render    per-page pdftoppm fan-out (serial fallback if pdfinfo
//!  │               is unavailable), streaming pages as they finish
//!  ├─ 2. Infer     base64 page image → POST to the VLM endpoint
//!  ├─ 3. Ground    parse <|ref|>…<|/ref|><|det|>…<|/det|> blocks, scale
//!  │               [0,999]-normalized boxes to pixel space
//!  ├─ 4. Rewrite   Markdown + cropped JPEG assets per image region
//!  ├─ 5. Finalize  result.md + raw.json in page order
//!  └─ 6. Archive   ZIP (text deflated, images stored)
//! ```
//!
//! Stages 1 and 2 overlap: rendered pages stream into a semaphore-bounded
//! pool of page processors, results land in a pre-sized vector by index, and
//! the first error anywhere cancels everything in flight.
//!
//! ## Events
//!
//! Progress is incremental against a moving total (the archive entry count
//! is unknown until all pages complete), `current` never decreases, and the
//! stream always ends with exactly one `result` or `error` event:
//!
//! ```text
//! {"type":"progress","progress":{"current":3,"total":9,"percent":33.3,…}}
//! {"type":"result","payload":{"markdown_file":"result.md",…}}
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod output;
pub mod pipeline;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::JobConfig;
pub use convert::run;
pub use error::WorkerError;
pub use events::{EventWriter, ProgressSnapshot, ProgressTracker};
pub use output::{Detection, PageResult, ResultPayload};
