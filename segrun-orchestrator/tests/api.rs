//! End-to-end tests of the orchestrator HTTP API
//!
//! Jobs run against the `mock-nnunet-predict` binary built from this crate.

#![cfg(unix)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use segrun_orchestrator::{api, config::Config, state::AppState};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

const MOCK_EXE: &str = env!("CARGO_BIN_EXE_mock-nnunet-predict");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestApp {
    router: Router,
    inputs: PathBuf,
    _dir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        std::fs::create_dir(&inputs).unwrap();

        let config = Config {
            bind_addr: "127.0.0.1:0".to_string(),
            work_dir: dir.path().join("work"),
            inference_exe: Some(PathBuf::from(MOCK_EXE)),
            case_timeout: Some(Duration::from_secs(60)),
            kill_grace: Duration::from_secs(1),
            max_retries: 0,
            log_capacity: 500,
            job_retention: Duration::from_secs(3600),
        };
        let router = api::create_router(AppState::from_config(config));

        Self {
            router,
            inputs,
            _dir: dir,
        }
    }

    /// Writes an input file; `content` can carry a `MOCK:` marker
    fn input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.inputs.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Method::GET, uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> Response<Body> {
        self.request(Method::POST, uri, Some(body)).await
    }

    async fn submit(&self, inputs: &[&Path]) -> String {
        let cases: Vec<Value> = inputs
            .iter()
            .map(|p| json!({ "input_path": p }))
            .collect();
        let response = self
            .post("/jobs", json!({ "cases": cases, "params": { "dataset": "101" } }))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn status(&self, id: &str) -> Value {
        let response = self.get(&format!("/jobs/{}", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    /// Polls until the job reaches a terminal state
    async fn wait_terminal(&self, id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            let status = self.status(id).await;
            let state = status["state"].as_str().unwrap();
            if matches!(state, "Succeeded" | "PartiallyFailed" | "Failed" | "Cancelled") {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in {}",
                id,
                state
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_state(&self, id: &str, wanted: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.status(id).await["state"] != wanted {
            assert!(tokio::time::Instant::now() < deadline, "job {} never reached {}", id, wanted);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn archive_names(bytes: Vec<u8>) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Test: GET /health reports the executable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_executable() {
    let app = TestApp::new();
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["executable_found"], true);
    assert_eq!(json["executable"], MOCK_EXE);
    assert_eq!(json["active_jobs"], 0);
}

// ---------------------------------------------------------------------------
// Test: every case succeeds and the archive holds one output per case
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_produces_archive() {
    let app = TestApp::new();
    let liver = app.input("liver_0000.nii.gz", "scan");
    let spleen = app.input("spleen_0000.nii.gz", "scan");

    let id = app.submit(&[&liver, &spleen]).await;
    let status = app.wait_terminal(&id).await;

    assert_eq!(status["state"], "Succeeded");
    assert_eq!(status["percent"], 100);
    let results = status["case_results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["case_id"], "liver");
    assert_eq!(results[1]["case_id"], "spleen");
    assert!(results.iter().all(|r| r["outcome"] == "Succeeded"));

    let response = app.get(&format!("/jobs/{}/result", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/zip"
    );
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("{}.zip", id)));

    let names = archive_names(body_bytes(response).await);
    assert_eq!(names, vec!["liver.nii.gz", "spleen.nii.gz"]);
}

// ---------------------------------------------------------------------------
// Test: ids that share an output file name still get separate outputs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn colliding_output_names_are_renamed() {
    let app = TestApp::new();
    let spaced = app.input("a b.nii.gz", "scan");
    let underscored = app.input("a_b.nii.gz", "scan");

    let id = app.submit(&[&spaced, &underscored]).await;
    let status = app.wait_terminal(&id).await;

    assert_eq!(status["state"], "Succeeded");
    let results = status["case_results"].as_array().unwrap();
    assert_eq!(results[0]["case_id"], "a b");
    assert_eq!(results[1]["case_id"], "a_b-2");
    assert_ne!(results[0]["output_path"], results[1]["output_path"]);

    let response = app.get(&format!("/jobs/{}/result", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        archive_names(body_bytes(response).await),
        vec!["a_b-2.nii.gz", "a_b.nii.gz"]
    );
}

// ---------------------------------------------------------------------------
// Test: one failing case makes the job partially failed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_case_gives_partial_failure() {
    let app = TestApp::new();
    let good = app.input("good.nii.gz", "scan");
    let bad = app.input("bad.nii.gz", "MOCK:error");

    let id = app.submit(&[&good, &bad]).await;
    let status = app.wait_terminal(&id).await;

    assert_eq!(status["state"], "PartiallyFailed");
    let results = status["case_results"].as_array().unwrap();
    assert_eq!(results[0]["outcome"], "Succeeded");
    assert_eq!(results[1]["outcome"], "Failed");
    assert_eq!(results[1]["error"]["kind"], "AbnormalExit");
    assert!(
        results[1]["error"]["detail"]
            .as_str()
            .unwrap()
            .contains("RuntimeError")
    );

    let response = app.get(&format!("/jobs/{}/result", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(archive_names(body_bytes(response).await), vec!["good.nii.gz"]);
}

// ---------------------------------------------------------------------------
// Test: no successful case means no archive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_cases_failing_fails_the_job() {
    let app = TestApp::new();
    let empty = app.input("empty.nii.gz", "MOCK:no-output");

    let id = app.submit(&[&empty]).await;
    let status = app.wait_terminal(&id).await;

    assert_eq!(status["state"], "Failed");
    assert_eq!(status["case_results"][0]["error"]["kind"], "OutputMissing");

    let response = app.get(&format!("/jobs/{}/result", id)).await;
    assert_eq!(response.status(), StatusCode::GONE);
}

// ---------------------------------------------------------------------------
// Test: cancelling a hung invocation stops the job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_interrupts_running_case() {
    let app = TestApp::new();
    let hang = app.input("hang.nii.gz", "MOCK:hang");
    let later = app.input("later.nii.gz", "scan");

    let id = app.submit(&[&hang, &later]).await;
    app.wait_state(&id, "Running").await;

    // No result while the job is still running
    let response = app.get(&format!("/jobs/{}/result", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.post(&format!("/jobs/{}/cancel", id), json!({})).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["job_id"], id.as_str());

    let status = app.wait_terminal(&id).await;
    assert_eq!(status["state"], "Cancelled");
    assert_eq!(status["cancel_requested"], true);
    assert!(status["case_results"].as_array().unwrap().is_empty());

    let response = app.post(&format!("/jobs/{}/cancel", id), json!({})).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.get(&format!("/jobs/{}/result", id)).await;
    assert_eq!(response.status(), StatusCode::GONE);
}

// ---------------------------------------------------------------------------
// Test: logs are served incrementally from a cursor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn logs_follow_cursor() {
    let app = TestApp::new();
    let scan = app.input("scan.nii.gz", "scan");

    let id = app.submit(&[&scan]).await;
    app.wait_terminal(&id).await;

    let response = app.get(&format!("/jobs/{}/logs", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(response).await;
    let events = page["events"].as_array().unwrap();
    assert!(!events.is_empty());
    assert_eq!(page["dropped"], 0);

    let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    let cursor = page["next_cursor"].as_u64().unwrap();
    assert_eq!(cursor, *seqs.last().unwrap());

    // The progress bar of the predictor shows up as case-tagged events
    assert!(
        events
            .iter()
            .any(|e| e["case_id"] == "scan" && e["percent"].is_u64())
    );

    let response = app.get(&format!("/jobs/{}/logs?since={}", id, cursor)).await;
    let page = body_json(response).await;
    assert!(page["events"].as_array().unwrap().is_empty());
    assert_eq!(page["next_cursor"], cursor);
}

// ---------------------------------------------------------------------------
// Test: listing shows submitted jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_contains_submitted_job() {
    let app = TestApp::new();
    let scan = app.input("scan.nii.gz", "scan");

    let id = app.submit(&[&scan]).await;
    app.wait_terminal(&id).await;

    let response = app.get("/jobs").await;
    assert_eq!(response.status(), StatusCode::OK);
    let jobs = body_json(response).await;
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], id.as_str());
    assert_eq!(jobs[0]["dataset"], "101");
    assert_eq!(jobs[0]["succeeded"], 1);
}

// ---------------------------------------------------------------------------
// Test: invalid submissions and unknown jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejects_invalid_submissions() {
    let app = TestApp::new();

    let response = app
        .post("/jobs", json!({ "cases": [], "params": { "dataset": "101" } }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());

    let response = app
        .post(
            "/jobs",
            json!({ "cases": [{ "input_path": "/data/a.nii.gz" }], "params": { "dataset": "  " } }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Type errors and missing fields in the body are bad requests too
    for body in [
        json!({ "cases": [{ "input_path": 42 }], "params": { "dataset": "101" } }),
        json!({ "params": { "dataset": "101" } }),
        json!({ "cases": [{ "input_path": "/data/a.nii.gz" }] }),
    ] {
        let response = app.post("/jobs", body.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        assert!(body_json(response).await["error"].is_string(), "{}", body);
    }

    let response = app.request(Method::POST, "/jobs", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());

    let response = app.get("/jobs").await;
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = TestApp::new();
    let id = uuid::Uuid::new_v4();

    for uri in [
        format!("/jobs/{}", id),
        format!("/jobs/{}/logs", id),
        format!("/jobs/{}/result", id),
    ] {
        let response = app.get(&uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
    }

    let response = app.post(&format!("/jobs/{}/cancel", id), json!({})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn malformed_job_id_is_not_found() {
    let app = TestApp::new();

    for uri in [
        "/jobs/not-a-job",
        "/jobs/not-a-job/logs",
        "/jobs/not-a-job/result",
    ] {
        let response = app.get(uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        assert!(body_json(response).await["error"].is_string(), "{}", uri);
    }

    let response = app.post("/jobs/not-a-job/cancel", json!({})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn bad_log_cursor_is_a_bad_request() {
    let app = TestApp::new();
    let scan = app.input("scan.nii.gz", "scan");
    let id = app.submit(&[&scan]).await;
    app.wait_terminal(&id).await;

    let response = app.get(&format!("/jobs/{}/logs?since=soon", id)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());
}
