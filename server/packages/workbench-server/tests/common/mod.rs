use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use workbench_server::config::RuntimeConfig;
use workbench_server::router::{build_router, AppState};
use workbench_server::sessions::SessionManager;

pub struct TestApp {
    pub app: Router,
    pub data_dir: TempDir,
    pub results_dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds an app around temp directories with a fast poll cadence.
    /// `tune` gets the config last, so tests can override anything.
    pub fn with_config<F>(tune: F) -> Self
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let results_dir = tempfile::tempdir().expect("create temp results dir");
        let mut config = RuntimeConfig::default();
        config.data_dir = data_dir.path().to_path_buf();
        config.results_root = results_dir.path().to_path_buf();
        config.agent_defaults.data_path = data_dir.path().to_path_buf();
        config.poll_interval = Duration::from_millis(50);
        config.stop_join_timeout = Duration::from_secs(2);
        tune(&mut config);
        let manager = SessionManager::new(config);
        manager.ensure_shared_store().expect("create shared store");
        let app = build_router(AppState::new(manager));
        Self {
            app,
            data_dir,
            results_dir,
        }
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(
            body.map(|value| value.to_string()).unwrap_or_default(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_status(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> StatusCode {
    let (status, _) = send_json(app, method, path, body).await;
    status
}

pub async fn create_session(app: &Router, session_id: &str, model: &str) -> Value {
    let (status, payload) = send_json(
        app,
        Method::POST,
        &format!("/v1/sessions/{session_id}"),
        Some(json!({ "model": model })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create session {session_id}");
    payload
}

pub async fn start_query(app: &Router, session_id: &str, question: &str) -> String {
    let (status, payload) = send_json(
        app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/query"),
        Some(json!({ "question": question })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "start query");
    payload
        .get("runId")
        .and_then(Value::as_str)
        .expect("runId in query response")
        .to_string()
}

/// Pages through `/events` until `stop` is satisfied or the timeout runs
/// out, returning the concatenation of every page.
pub async fn poll_updates_until<F>(
    app: &Router,
    session_id: &str,
    timeout: Duration,
    mut stop: F,
) -> Vec<Value>
where
    F: FnMut(&[Value]) -> bool,
{
    let start = Instant::now();
    let mut offset = 0u64;
    let mut updates = Vec::new();
    while start.elapsed() < timeout {
        let path = format!("/v1/sessions/{session_id}/events?offset={offset}&limit=200");
        let (status, payload) = send_json(app, Method::GET, &path, None).await;
        assert_eq!(status, StatusCode::OK, "poll updates");
        let new_updates = payload
            .get("updates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !new_updates.is_empty() {
            if let Some(last) = new_updates
                .last()
                .and_then(|update| update.get("sequence"))
                .and_then(Value::as_u64)
            {
                offset = last;
            }
            updates.extend(new_updates);
            if stop(&updates) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    updates
}

/// Polls until the run's terminal update arrives.
pub async fn wait_for_completed(app: &Router, session_id: &str, timeout: Duration) -> Vec<Value> {
    let updates = poll_updates_until(app, session_id, timeout, |updates| {
        has_update_type(updates, "run.completed")
    })
    .await;
    assert!(
        has_update_type(&updates, "run.completed"),
        "run did not complete within {timeout:?}: {updates:#?}"
    );
    updates
}

pub fn has_update_type(updates: &[Value], update_type: &str) -> bool {
    updates
        .iter()
        .any(|update| update.get("type").and_then(Value::as_str) == Some(update_type))
}

pub fn updates_of_type<'a>(updates: &'a [Value], update_type: &str) -> Vec<&'a Value> {
    updates
        .iter()
        .filter(|update| update.get("type").and_then(Value::as_str) == Some(update_type))
        .collect()
}

/// The `data` payload of the single terminal update.
pub fn completed_data(updates: &[Value]) -> Value {
    let completed = updates_of_type(updates, "run.completed");
    assert_eq!(completed.len(), 1, "expected exactly one terminal update");
    completed[0].get("data").cloned().expect("completed data")
}

/// Asserts sequences are consecutive from the first one seen: paging the
/// buffer must reproduce the stream with no gaps and no repeats.
pub fn assert_gapless(updates: &[Value]) {
    let mut previous: Option<u64> = None;
    for update in updates {
        let sequence = update
            .get("sequence")
            .and_then(Value::as_u64)
            .expect("sequence");
        if let Some(previous) = previous {
            assert_eq!(
                sequence,
                previous + 1,
                "sequence gap or repeat after {previous}"
            );
        }
        previous = Some(sequence);
    }
}

pub fn log_lines(updates: &[Value]) -> Vec<String> {
    updates_of_type(updates, "run.log")
        .into_iter()
        .filter_map(|update| update.pointer("/data/line"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

pub fn output_contents(updates: &[Value]) -> Vec<String> {
    updates_of_type(updates, "run.output")
        .into_iter()
        .filter_map(|update| update.pointer("/data/output/content"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}
