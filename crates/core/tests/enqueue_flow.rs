use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use snuabar_core::config::UpstreamConfig;
use snuabar_core::fingerprint::Fingerprint;
use snuabar_core::job::QueueRequest;
use snuabar_core::locator::OutputLocator;
use snuabar_core::registry::{JobRegistry, RegistryOptions};
use snuabar_core::server::{app_router, AppState, ServerInfo};
use snuabar_core::upstream::{
    ExecutionHost, HistoryDocument, JobStatusDocument, NodeOutputs, OutputFile, UpstreamReply,
};
use snuabar_core::workflow::{WorkflowCatalog, MODEL_MAP_FILE};

/// Execution host that records submitted workflows and replays scripted statuses.
#[derive(Default)]
struct ScriptedHost {
    submitted: Mutex<Vec<Value>>,
    status_calls: AtomicUsize,
    statuses: Mutex<VecDeque<JobStatusDocument>>,
    history: Mutex<HistoryDocument>,
}

#[async_trait]
impl ExecutionHost for ScriptedHost {
    async fn submit(&self, workflow: &Value, _client_id: &str, _prompt_id: &str) -> Result<UpstreamReply> {
        self.submitted.lock().unwrap().push(workflow.clone());
        Ok(UpstreamReply {
            status: 200,
            body: "{}".into(),
        })
    }

    async fn job_status(&self, _prompt_id: &str) -> Result<JobStatusDocument> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(JobStatusDocument::pending))
    }

    async fn history(&self, _prompt_id: &str) -> Result<HistoryDocument> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn fetch_output(&self, file: &OutputFile) -> Result<Vec<u8>> {
        anyhow::bail!("{} is only on disk", file.filename)
    }

    async fn interrupt(&self, _prompt_id: &str) -> Result<UpstreamReply> {
        Ok(UpstreamReply {
            status: 200,
            body: String::new(),
        })
    }

    async fn model_types(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn models(&self, _model_type: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

struct Harness {
    _dir: TempDir,
    upstream_output: PathBuf,
    output_root: PathBuf,
    host: Arc<ScriptedHost>,
    router: Router,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let workflows = dir.path().join("workflows");
    std::fs::create_dir_all(&workflows).unwrap();
    std::fs::write(workflows.join(MODEL_MAP_FILE), r#"{"t2i": {"label": "Text to image"}}"#).unwrap();
    std::fs::write(
        workflows.join("t2i.json"),
        json!({
            "3": {"class_type": "KSampler", "inputs": {
                "seed": 1, "steps": 20, "cfg": 7.0, "positive": ["6", 0], "negative": ["7", 0]
            }},
            "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 1024, "height": 1024}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "placeholder"}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "lowres"}}
        })
        .to_string(),
    )
    .unwrap();

    let upstream_output = dir.path().join("host/output");
    std::fs::create_dir_all(&upstream_output).unwrap();
    let output_root = dir.path().join("output");

    let host = Arc::new(ScriptedHost::default());
    let registry = JobRegistry::new(
        host.clone(),
        WorkflowCatalog::load(&workflows).unwrap(),
        OutputLocator::new(output_root.clone(), 0),
        RegistryOptions {
            client_id: "integration".into(),
            upstream: UpstreamConfig {
                output_dir: upstream_output.clone(),
                ..UpstreamConfig::default()
            },
            release_failed_jobs: false,
        },
    );
    let info = ServerInfo {
        host: "127.0.0.1".into(),
        port: 8000,
        local_ip: "127.0.0.1".into(),
    };

    Harness {
        _dir: dir,
        upstream_output,
        output_root,
        host,
        router: app_router(AppState::new(registry, info)),
    }
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn enqueue_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/enqueue")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn status_request(prompt_id: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("/api/images/{prompt_id}"))
        .body(Body::empty())
        .unwrap()
}

fn today_partition(root: &Path) -> PathBuf {
    root.join(chrono::Local::now().format("%Y-%m-%d").to_string())
}

#[tokio::test]
async fn enqueue_poll_and_resolve_an_image_job() {
    let h = harness();
    let body = json!({"workflow": "t2i", "prompt": "a cat", "seed": 42, "width": 512, "height": 512});

    let (status, enqueued) = call(&h.router, enqueue_request(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(enqueued["code"], 200);
    let prompt_id = enqueued["prompt_id"].as_str().unwrap().to_string();

    let request: QueueRequest = serde_json::from_value(body.clone()).unwrap();
    assert_eq!(prompt_id, Fingerprint::of(&request).as_str());

    let submitted = h.host.submitted.lock().unwrap()[0].clone();
    assert_eq!(submitted["6"]["inputs"]["text"], "a cat");
    assert_eq!(submitted["7"]["inputs"]["text"], "lowres");
    assert_eq!(submitted["5"]["inputs"]["width"], 512);
    assert_eq!(submitted["3"]["inputs"]["seed"], 42);

    // Still running upstream.
    let (_, pending) = call(&h.router, status_request(&prompt_id)).await;
    assert_eq!(pending["code"], 202);
    assert_eq!(pending["status"], "processing");

    std::fs::write(h.upstream_output.join("ComfyUI_00001_.png"), b"image").unwrap();
    *h.host.history.lock().unwrap() = HistoryDocument {
        outputs: BTreeMap::from([(
            "9".to_string(),
            NodeOutputs {
                images: vec![OutputFile {
                    filename: "ComfyUI_00001_.png".into(),
                    subfolder: String::new(),
                    kind: "output".into(),
                }],
                ..NodeOutputs::default()
            },
        )]),
    };
    h.host
        .statuses
        .lock()
        .unwrap()
        .push_back(JobStatusDocument::completed());

    let (_, done) = call(&h.router, status_request(&prompt_id)).await;
    assert_eq!(done["code"], 200);
    assert_eq!(done["status"], "completed");
    assert_eq!(done["media_type"], "image/png");
    let filename = done["filename"].as_str().unwrap();
    assert!(filename.ends_with(&format!("_42_{}_00000.png", &prompt_id[..8])));
    assert!(today_partition(&h.output_root).join(filename).exists());

    // Served from disk from now on.
    let polls = h.host.status_calls.load(Ordering::SeqCst);
    let (_, again) = call(&h.router, status_request(&prompt_id)).await;
    assert_eq!(again["filename"], filename);
    assert_eq!(h.host.status_calls.load(Ordering::SeqCst), polls);

    let (_, repeat) = call(&h.router, enqueue_request(&body)).await;
    assert_eq!(repeat["code"], 200);
    assert_eq!(repeat["file_exists"], true);
    assert_eq!(h.host.submitted.lock().unwrap().len(), 1);

    let (_, stats) = call(
        &h.router,
        Request::builder().uri("/api/stats").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(stats["total_images"], 1);
    assert_eq!(stats["in_flight_jobs"], 0);
}

#[tokio::test]
async fn interrupted_job_can_be_resubmitted() {
    let h = harness();
    let body = json!({"workflow": "t2i", "prompt": "a dog"});

    let (_, first) = call(&h.router, enqueue_request(&body)).await;
    let prompt_id = first["prompt_id"].as_str().unwrap().to_string();

    let (_, conflict) = call(&h.router, enqueue_request(&body)).await;
    assert_eq!(conflict["code"], 409);

    let (_, interrupted) = call(
        &h.router,
        Request::builder()
            .method("POST")
            .uri("/api/interrupt")
            .header("content-type", "application/json")
            .body(Body::from(json!({"prompt_id": prompt_id}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(interrupted["code"], 200);

    let (_, again) = call(&h.router, enqueue_request(&body)).await;
    assert_eq!(again["code"], 200);
    assert_eq!(h.host.submitted.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_workflow_reports_not_found_code() {
    let h = harness();
    let (status, body) = call(
        &h.router,
        enqueue_request(&json!({"workflow": "t2v_wan22", "prompt": "waves", "seconds": 2})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 404);
    assert!(h.host.submitted.lock().unwrap().is_empty());
}
