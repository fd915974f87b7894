//! End-to-end pipeline tests.
//!
//! External collaborators are stubbed at their documented interfaces:
//!
//! * `pdfinfo` / `pdftoppm` — shell scripts in `tests/tools/` (prepended to
//!   `PATH` once) that read a key=value manifest standing in for the PDF and
//!   materialize pages by copying a fixture JPEG.
//! * the inference endpoint — a minimal scripted HTTP responder on a local
//!   TCP port.
//!
//! Everything else — channels, pools, ordering, progress, finalization, the
//! archive — is the real pipeline.

use pdfworker::{convert, EventWriter, JobConfig, ResultPayload, WorkerError};
use serde_json::Value;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ── Stub external tools on PATH ──────────────────────────────────────────────

static TOOLS: Once = Once::new();

fn ensure_stub_tools() {
    TOOLS.call_once(|| {
        let tools = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/tools");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for tool in ["pdfinfo", "pdftoppm"] {
                let path = tools.join(tool);
                let mut perms = std::fs::metadata(&path)
                    .unwrap_or_else(|e| panic!("stub {tool} missing: {e}"))
                    .permissions();
                perms.set_mode(0o755);
                std::fs::set_permissions(&path, perms).unwrap();
            }
        }
        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{path}", tools.display()));
    });
}

// ── Scripted inference responder ─────────────────────────────────────────────

/// Serve scripted `(status, body)` responses in order, repeating the last
/// response once the script is exhausted. Returns the endpoint URL.
async fn spawn_responder(script: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let script = Arc::new(Mutex::new(script));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let script = Arc::clone(&script);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 8192];
                let (body_start, body_len) = loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&buf[..pos]);
                        let len = headers
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        break (pos + 4, len);
                    }
                };
                while buf.len() < body_start + body_len {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                }

                let (status, body) = {
                    let mut script = script.lock().unwrap();
                    if script.len() > 1 {
                        script.remove(0)
                    } else {
                        script[0].clone()
                    }
                };
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\ncontent-type: application/json\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/infer")
}

fn text_response(text: &str) -> (u16, String) {
    (
        200,
        serde_json::to_string(&serde_json::json!({ "text": text })).unwrap(),
    )
}

// ── Event capture ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn events(&self) -> Vec<Value> {
        let buf = self.0.lock().unwrap();
        String::from_utf8(buf.clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).expect("each event line is JSON"))
            .collect()
    }
}

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    /// Owns the manifest "PDF", the fixture, and the output dir.
    _root: TempDir,
    out_dir: PathBuf,
    config: JobConfig,
    events: SharedBuf,
}

impl Harness {
    /// Build a job whose "PDF" manifest declares `pages` pages rendered from
    /// a generated 800×600 fixture JPEG. `extra` lines are appended to the
    /// manifest to steer the stub tools.
    fn new(pages: usize, extra: &str, infer_url: String) -> Self {
        ensure_stub_tools();
        let root = TempDir::new().unwrap();

        let fixture = root.path().join("fixture.jpg");
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(800, 600, |x, y| {
            image::Rgb([(x % 251) as u8, (y % 241) as u8, 64])
        }));
        image.save(&fixture).unwrap();

        let pdf = root.path().join("document.pdf");
        let mut manifest = std::fs::File::create(&pdf).unwrap();
        writeln!(manifest, "pages={pages}").unwrap();
        writeln!(manifest, "fixture={}", fixture.display()).unwrap();
        if !extra.is_empty() {
            writeln!(manifest, "{extra}").unwrap();
        }

        let out_dir = root.path().join("out");
        let config = JobConfig {
            task_id: "e2e-task".into(),
            pdf_path: pdf.display().to_string(),
            output_dir: out_dir.display().to_string(),
            prompt: "<|grounding|>OCR this page".into(),
            infer_url,
            max_concurrency: 3,
            request_timeout_seconds: 20,
            ..JobConfig::default()
        };

        Self {
            _root: root,
            out_dir,
            config,
            events: SharedBuf::default(),
        }
    }

    async fn run(&self) -> Result<ResultPayload, WorkerError> {
        let writer = Arc::new(EventWriter::new(self.events.clone()));
        convert::run(self.config.clone(), writer).await
    }

    fn progress_events(&self) -> Vec<Value> {
        self.events
            .events()
            .into_iter()
            .filter(|e| e["type"] == "progress")
            .collect()
    }
}

fn assert_progress_monotonic(events: &[Value]) {
    let currents: Vec<u64> = events
        .iter()
        .map(|e| e["progress"]["current"].as_u64().unwrap())
        .collect();
    assert!(
        currents.windows(2).all(|w| w[0] <= w[1]),
        "current must be non-decreasing: {currents:?}"
    );
}

// ── Scenarios ────────────────────────────────────────────────────────────────

/// Zero-page document: one progress event, an empty payload, 100%.
#[tokio::test]
async fn empty_document_succeeds_with_empty_payload() {
    let url = spawn_responder(vec![text_response("never called")]).await;
    let harness = Harness::new(0, "", url);

    let payload = harness.run().await.expect("zero-page run succeeds");

    assert_eq!(payload.total_pages, 0);
    assert!(payload.pages.is_empty());
    assert!(payload.images.is_empty());
    assert_eq!(payload.markdown_file, "");
    assert_eq!(payload.progress.percent, 100.0);

    let progress = harness.progress_events();
    assert_eq!(progress.len(), 1, "exactly one progress event: {progress:?}");
}

/// Single page whose whole content is one image region.
#[tokio::test]
async fn single_page_image_only_document() {
    let url = spawn_responder(vec![text_response(
        "<|ref|>image<|/ref|><|det|>[[0,0,999,999]]<|/det|>",
    )])
    .await;
    let harness = Harness::new(1, "", url);

    let payload = harness.run().await.unwrap();

    let markdown = std::fs::read_to_string(harness.out_dir.join("result.md")).unwrap();
    assert_eq!(markdown, "<!-- page:1 -->\n\n![](images/page-0-img-0.jpg)");

    assert_eq!(payload.images, vec!["images/page-0-img-0.jpg"]);
    assert_eq!(payload.pages[0].boxes.len(), 1);
    assert_eq!(payload.pages[0].boxes[0].bounds, [0, 0, 800, 600]);

    let asset = image::open(harness.out_dir.join("images/page-0-img-0.jpg")).unwrap();
    assert_eq!((asset.width(), asset.height()), (800, 600));

    // Archive policy: text deflated, image stored.
    let archive_file = std::fs::File::open(harness.out_dir.join("result.zip")).unwrap();
    let mut archive = zip::ZipArchive::new(archive_file).unwrap();
    assert_eq!(archive.len(), 3);
    for (name, method) in [
        ("result.md", zip::CompressionMethod::Deflated),
        ("raw.json", zip::CompressionMethod::Deflated),
        ("images/page-0-img-0.jpg", zip::CompressionMethod::Stored),
    ] {
        let entry = archive.by_name(name).unwrap();
        assert_eq!(entry.compression(), method, "{name}");
    }
}

/// Mixed labels: textual blocks vanish, unknown labels become comments.
#[tokio::test]
async fn mixed_labels_rewrite() {
    let url = spawn_responder(vec![text_response(
        "hello <|ref|>title<|/ref|><|det|>[0,0,100,100]<|/det|> world \
         <|ref|>unknown<|/ref|><|det|>[0,0,100,100]<|/det|>",
    )])
    .await;
    let harness = Harness::new(1, "", url);

    let payload = harness.run().await.unwrap();

    assert_eq!(payload.pages[0].markdown, "hello  world <!-- unknown -->");
    // The title block still surfaces in the box list.
    let labels: Vec<&str> = payload.pages[0]
        .boxes
        .iter()
        .map(|b| b.label.as_str())
        .collect();
    assert_eq!(labels, ["title", "unknown"]);
}

/// Multi-page run: results in ascending index order, progress monotonic,
/// page counters surfaced.
#[tokio::test]
async fn concurrent_run_is_ordered_and_progress_monotonic() {
    let url = spawn_responder(vec![text_response("page text")]).await;
    let harness = Harness::new(5, "", url);

    let payload = harness.run().await.unwrap();

    assert_eq!(payload.total_pages, 5);
    let indices: Vec<usize> = payload.pages.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    for page in &payload.pages {
        assert_eq!(page.page_number, page.index + 1);
        assert_eq!(page.raw_text, "page text");
    }

    // The sidecar iterates the same ordered vector.
    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(harness.out_dir.join("raw.json")).unwrap())
            .unwrap();
    let sidecar_indices: Vec<u64> = raw["pages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["index"].as_u64().unwrap())
        .collect();
    assert_eq!(sidecar_indices, vec![0, 1, 2, 3, 4]);

    let progress = harness.progress_events();
    assert_progress_monotonic(&progress);
    let last = progress.last().unwrap();
    assert_eq!(last["progress"]["percent"], 100.0);
    assert!(
        progress
            .iter()
            .any(|e| e["progress"]["pages_total"] == 5 && e["progress"]["pages_completed"] == 5),
        "page counters should surface: {progress:?}"
    );
}

/// Page-count tool failure degrades to serial rasterization with identical
/// outputs.
#[tokio::test]
async fn page_count_failure_falls_back_to_serial() {
    let url = spawn_responder(vec![text_response("fallback text")]).await;
    let harness = Harness::new(3, "pdfinfo_fail=1", url);

    let payload = harness.run().await.unwrap();

    assert_eq!(payload.total_pages, 3);
    let indices: Vec<usize> = payload.pages.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(harness.out_dir.join("result.md").exists());
    assert!(harness.out_dir.join("result.zip").exists());

    // No error event material leaked into the stream.
    assert!(harness.events.events().iter().all(|e| e["type"] == "progress"));
}

/// Zero-padded rasterizer output names are located by probing.
#[tokio::test]
async fn padded_page_filenames_are_located() {
    let url = spawn_responder(vec![text_response("padded")]).await;
    let harness = Harness::new(3, "pad=4", url);

    let payload = harness.run().await.unwrap();
    assert_eq!(payload.total_pages, 3);
    assert_eq!(payload.pages.len(), 3);
}

/// An inference failure fails the whole run; nothing is emitted after the
/// controller returns.
#[tokio::test]
async fn inference_http_error_fails_the_run() {
    let url = spawn_responder(vec![(500, "backend down".into())]).await;
    let harness = Harness::new(10, "", url);

    let err = harness.run().await.expect_err("500 must fail the run");
    match &err {
        WorkerError::InferenceStatus { status, body } => {
            assert_eq!(*status, 500);
            assert!(body.contains("backend down"));
        }
        other => panic!("expected InferenceStatus, got {other}"),
    }

    // The library never emits result/error events itself; the stream holds
    // only the progress emitted before the failure won.
    assert!(harness.events.events().iter().all(|e| e["type"] == "progress"));
    // Scratch space is removed even on failure.
    assert!(!harness.out_dir.join(".worker").exists());
}

/// Empty inference text is retried, then accepted as an empty page.
#[tokio::test]
async fn empty_responses_retry_then_succeed() {
    let url = spawn_responder(vec![
        text_response(""),
        text_response("   "),
        text_response("recovered"),
    ])
    .await;
    let harness = Harness::new(1, "", url);

    let payload = harness.run().await.unwrap();
    assert_eq!(payload.pages[0].raw_text, "recovered");
}

/// Three empty responses still produce a successful, empty page.
#[tokio::test]
async fn all_empty_responses_yield_empty_page() {
    let url = spawn_responder(vec![text_response("")]).await;
    let harness = Harness::new(1, "", url);

    let payload = harness.run().await.unwrap();
    assert_eq!(payload.pages[0].raw_text, "");
    assert_eq!(payload.pages[0].markdown, "");

    let markdown = std::fs::read_to_string(harness.out_dir.join("result.md")).unwrap();
    assert_eq!(markdown, "<!-- page:1 -->");
}

/// The scratch directory is ephemeral; images and outputs persist.
#[tokio::test]
async fn scratch_dir_removed_after_success() {
    let url = spawn_responder(vec![text_response("content")]).await;
    let harness = Harness::new(2, "", url);

    harness.run().await.unwrap();

    assert!(!harness.out_dir.join(".worker").exists());
    assert!(harness.out_dir.join("images").exists());
    assert!(harness.out_dir.join("raw.json").exists());
}

/// The archive is named after the original upload when configured.
#[tokio::test]
async fn archive_named_after_original_filename() {
    let url = spawn_responder(vec![text_response("content")]).await;
    let mut harness = Harness::new(1, "", url);
    harness.config.original_filename = Some("Quarterly Scan.pdf".into());

    let payload = harness.run().await.unwrap();

    assert_eq!(payload.archive_file, "Quarterly Scan_PDF_OCR_Result.zip");
    assert!(harness
        .out_dir
        .join("Quarterly Scan_PDF_OCR_Result.zip")
        .exists());
}

/// Full-width punctuation in coordinate payloads parses to real boxes.
#[tokio::test]
async fn full_width_coordinates_are_parsed() {
    let url = spawn_responder(vec![text_response(
        "<|ref|>image<|/ref|><|det|>【 0， 0， 999， 999 】<|/det|>",
    )])
    .await;
    let harness = Harness::new(1, "", url);

    let payload = harness.run().await.unwrap();
    assert_eq!(payload.pages[0].boxes[0].bounds, [0, 0, 800, 600]);
    assert_eq!(payload.images.len(), 1);
}
