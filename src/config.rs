//! Job configuration: one JSON document describing a single conversion run.
//!
//! The worker is launched by a parent service with `--config <path>`; the file
//! carries everything the run needs, so the process has no other inputs and no
//! environment coupling. Numeric fields use "zero or negative means default"
//! semantics — the parent can omit them entirely and the accessors below
//! normalize the values, keeping the raw deserialized struct a faithful image
//! of what was on disk.

use crate::error::WorkerError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default rasterization DPI when the config supplies none.
pub const DEFAULT_DPI: u32 = 144;
/// Default page-level concurrency when the config supplies none.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
/// Default per-inference-call timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Configuration for one conversion job, deserialized from the `--config`
/// JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    /// Opaque task identifier, echoed in log lines so a parent service can
    /// correlate worker stderr with its own job records.
    #[serde(default)]
    pub task_id: String,

    /// Input PDF path. Required.
    #[serde(default)]
    pub pdf_path: String,

    /// Directory receiving `result.md`, `raw.json`, the archive, and
    /// `images/`. Created if absent. Required.
    #[serde(default)]
    pub output_dir: String,

    /// Rasterization DPI. `<= 0` means [`DEFAULT_DPI`].
    #[serde(default)]
    pub dpi: i64,

    /// Prompt forwarded verbatim to the inference endpoint. Required.
    #[serde(default)]
    pub prompt: String,

    /// Inference endpoint URL. Required.
    #[serde(default)]
    pub infer_url: String,

    /// Bearer token forwarded as `X-Internal-Token` when non-empty.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Model image-shape hint.
    #[serde(default)]
    pub base_size: i64,

    /// Model image-shape hint.
    #[serde(default)]
    pub image_size: i64,

    /// Model image-shape hint.
    #[serde(default)]
    pub crop_mode: bool,

    /// Concurrent page processors. `<= 0` means [`DEFAULT_MAX_CONCURRENCY`].
    #[serde(default)]
    pub max_concurrency: i64,

    /// Concurrent rasterizer invocations. `0` derives a value from host
    /// parallelism, clamped to 2..=8.
    #[serde(default)]
    pub render_workers: i64,

    /// Per-inference-call deadline in seconds. `<= 0` means
    /// [`DEFAULT_REQUEST_TIMEOUT_SECS`].
    #[serde(default)]
    pub request_timeout_seconds: i64,

    /// Original upload filename; when present its stem names the archive
    /// `<stem>_PDF_OCR_Result.zip` instead of `result.zip`.
    #[serde(default)]
    pub original_filename: Option<String>,
}

impl JobConfig {
    /// Load and validate a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| WorkerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: JobConfig =
            serde_json::from_slice(&bytes).map_err(|e| WorkerError::ConfigParse {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields. Called by [`JobConfig::load`]; exposed for
    /// callers that construct configs programmatically.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.pdf_path.trim().is_empty() {
            return Err(WorkerError::MissingField { field: "pdf_path" });
        }
        if self.output_dir.trim().is_empty() {
            return Err(WorkerError::MissingField { field: "output_dir" });
        }
        if self.infer_url.trim().is_empty() {
            return Err(WorkerError::MissingField { field: "infer_url" });
        }
        if self.prompt.trim().is_empty() {
            return Err(WorkerError::MissingField { field: "prompt" });
        }
        Ok(())
    }

    /// Effective rasterization DPI.
    pub fn dpi(&self) -> u32 {
        if self.dpi > 0 {
            self.dpi as u32
        } else {
            DEFAULT_DPI
        }
    }

    /// Effective page-processor pool size.
    pub fn max_concurrency(&self) -> usize {
        if self.max_concurrency > 0 {
            self.max_concurrency as usize
        } else {
            DEFAULT_MAX_CONCURRENCY
        }
    }

    /// Configured rasterizer worker count, if explicitly positive.
    /// `None` lets the rasterizer driver derive one from host parallelism.
    pub fn render_workers(&self) -> Option<usize> {
        if self.render_workers > 0 {
            Some(self.render_workers as usize)
        } else {
            None
        }
    }

    /// Effective per-call inference deadline in seconds.
    pub fn request_timeout_secs(&self) -> u64 {
        if self.request_timeout_seconds > 0 {
            self.request_timeout_seconds as u64
        } else {
            DEFAULT_REQUEST_TIMEOUT_SECS
        }
    }

    /// Auth token, if configured and non-empty.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Output directory as a path.
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    /// Archive basename: `<original-stem>_PDF_OCR_Result.zip` when the
    /// original upload filename is known, else `result.zip`.
    pub fn archive_name(&self) -> String {
        match self
            .original_filename
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            Some(original) => {
                let stem = Path::new(original)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| original.to_string());
                format!("{stem}_PDF_OCR_Result.zip")
            }
            None => "result.zip".to_string(),
        }
    }
}
