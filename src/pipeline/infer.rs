//! Inference client: POST page images to the vision-language endpoint.
//!
//! One `reqwest` client is shared by every page processor in the process.
//! The client is built lazily with pool limits sized from the first caller's
//! concurrency and rebuilt under a mutex if a later caller needs more
//! headroom; dropping the old client is safe because in-flight requests keep
//! their own handle alive.
//!
//! ## Empty responses
//!
//! The endpoint occasionally returns 200 with a whitespace-only `text`.
//! That is a model hiccup, not a failure: the call is retried up to
//! [`MAX_EMPTY_ATTEMPTS`] times with a short pause, and if every attempt
//! comes back empty the page proceeds with empty text. Transport errors,
//! non-200 statuses, and undecodable bodies are fatal and never retried.

use crate::config::JobConfig;
use crate::error::WorkerError;
use once_cell::sync::Lazy;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Total attempts allowed when the endpoint keeps returning empty text.
const MAX_EMPTY_ATTEMPTS: usize = 3;
/// Pause between empty-response attempts.
const EMPTY_RETRY_PAUSE: Duration = Duration::from_millis(200);
/// How much of a non-200 body is carried into the error.
const ERROR_BODY_LIMIT: usize = 1024;

/// Auth header forwarded when the job carries a token.
const AUTH_HEADER: &str = "X-Internal-Token";

/// Process-wide client plus the per-host connection allowance it was built
/// for.
static SHARED_CLIENT: Lazy<Mutex<Option<(usize, Client)>>> = Lazy::new(|| Mutex::new(None));

#[derive(Serialize)]
struct InferenceRequest<'a> {
    prompt: &'a str,
    image_base64: &'a str,
    base_size: i64,
    image_size: i64,
    crop_mode: bool,
}

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    text: String,
}

/// Get the shared client, building or rebuilding it so at least
/// `max(concurrency, 4)` connections per host are available.
fn shared_client(concurrency: usize) -> Result<Client, WorkerError> {
    let per_host = concurrency.max(4);
    let mut slot = SHARED_CLIENT
        .lock()
        .map_err(|_| WorkerError::Internal("shared client mutex poisoned".into()))?;
    if let Some((capacity, client)) = slot.as_ref() {
        if *capacity >= per_host {
            return Ok(client.clone());
        }
    }

    let client = Client::builder()
        .pool_max_idle_per_host((per_host * 2).max(32))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| WorkerError::InferenceTransport {
            detail: format!("client build: {e}"),
        })?;
    debug!(per_host, "inference HTTP client (re)built");
    *slot = Some((per_host, client.clone()));
    Ok(client)
}

/// Run one page image through the inference endpoint, applying the
/// empty-response retry policy.
///
/// Returns the model's text, which is empty only after every attempt came
/// back whitespace.
pub async fn run_inference(config: &JobConfig, image_base64: &str) -> Result<String, WorkerError> {
    let client = shared_client(config.max_concurrency())?;

    for attempt in 1..=MAX_EMPTY_ATTEMPTS {
        let text = post_once(&client, config, image_base64).await?;
        if !text.trim().is_empty() {
            return Ok(text);
        }
        if attempt < MAX_EMPTY_ATTEMPTS {
            debug!(
                task_id = %config.task_id,
                attempt,
                "empty inference text, retrying"
            );
            sleep(EMPTY_RETRY_PAUSE).await;
        }
    }

    warn!(
        task_id = %config.task_id,
        attempts = MAX_EMPTY_ATTEMPTS,
        "inference returned empty text on every attempt"
    );
    Ok(String::new())
}

async fn post_once(
    client: &Client,
    config: &JobConfig,
    image_base64: &str,
) -> Result<String, WorkerError> {
    let body = InferenceRequest {
        prompt: &config.prompt,
        image_base64,
        base_size: config.base_size,
        image_size: config.image_size,
        crop_mode: config.crop_mode,
    };

    let mut request = client
        .post(&config.infer_url)
        .header(CONTENT_TYPE, "application/json")
        .json(&body);
    if let Some(token) = config.auth_token() {
        request = request.header(AUTH_HEADER, token);
    }
    let timeout_secs = config.request_timeout_secs();
    if timeout_secs > 0 {
        // Deadline covers connect through body completion for this call only.
        request = request.timeout(Duration::from_secs(timeout_secs));
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            WorkerError::InferenceTimeout { secs: timeout_secs }
        } else {
            WorkerError::InferenceTransport {
                detail: e.to_string(),
            }
        }
    })?;

    let status = response.status();
    if status != StatusCode::OK {
        let bytes = response.bytes().await.unwrap_or_default();
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(ERROR_BODY_LIMIT)]).into_owned();
        return Err(WorkerError::InferenceStatus {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            WorkerError::InferenceTimeout { secs: timeout_secs }
        } else {
            WorkerError::InferenceTransport {
                detail: e.to_string(),
            }
        }
    })?;
    let parsed: InferenceResponse =
        serde_json::from_slice(&bytes).map_err(|e| WorkerError::InferenceDecode {
            detail: e.to_string(),
        })?;
    Ok(parsed.text)
}
