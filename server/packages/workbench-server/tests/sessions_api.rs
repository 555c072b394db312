mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{create_session, send_json, send_status, wait_for_completed, TestApp};

#[tokio::test]
async fn health_root_and_unknown_routes() {
    let test_app = TestApp::new();

    let (status, payload) = send_json(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "ok");

    let status = send_status(&test_app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);

    let status = send_status(&test_app.app, Method::GET, "/v1/anything", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_list_and_delete_sessions() {
    let test_app = TestApp::new();

    let created = create_session(&test_app.app, "alpha", "mock").await;
    assert_eq!(created["sessionId"], "alpha");
    assert_eq!(created["agentReady"], true);
    assert!(created.get("agentError").is_none());
    assert!(created["resultsDir"].as_str().unwrap().contains("alpha"));

    let (status, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = payload["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], "alpha");
    assert_eq!(sessions[0]["model"], "mock");
    assert_eq!(sessions[0]["source"], "mock");
    assert_eq!(sessions[0]["runActive"], false);

    let status = send_status(&test_app.app, Method::DELETE, "/v1/sessions/alpha", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let status = send_status(&test_app.app, Method::DELETE, "/v1/sessions/alpha", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(payload["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn create_without_id_generates_one() {
    let test_app = TestApp::new();

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "model": "mock" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = payload["sessionId"].as_str().expect("sessionId");
    assert!(
        session_id.starts_with("session_"),
        "unexpected generated id {session_id}"
    );
}

#[tokio::test]
async fn creating_the_same_id_replaces_the_session() {
    let test_app = TestApp::new();

    create_session(&test_app.app, "dup", "mock").await;
    create_session(&test_app.app, "dup", "mock:100:noresult").await;

    let (_, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    let sessions = payload["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["model"], "mock:100:noresult");
}

#[tokio::test]
async fn path_and_body_session_ids_must_agree() {
    let test_app = TestApp::new();

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/alpha",
        Some(json!({ "sessionId": "beta", "model": "mock" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["type"], "urn:workbench:error:invalid_request");
}

#[tokio::test]
async fn hostile_session_ids_are_rejected() {
    let test_app = TestApp::new();

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/bad%20id",
        Some(json!({ "model": "mock" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["type"], "urn:workbench:error:invalid_request");

    let (_, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(payload["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_source_is_a_bad_request() {
    let test_app = TestApp::new();

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/alpha",
        Some(json!({ "model": "mock", "source": "quantum" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["type"], "urn:workbench:error:invalid_request");
    assert!(payload["detail"]
        .as_str()
        .unwrap()
        .contains("unknown llm source"));
}

#[tokio::test]
async fn unknown_session_yields_the_exact_problem_shape() {
    let test_app = TestApp::new();

    let (status, payload) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ghost/events",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        payload,
        json!({
            "type": "urn:workbench:error:no_session",
            "title": "No Session",
            "status": 404,
            "detail": "No session assigned. Create a session before asking a question.",
            "sessionId": "ghost"
        })
    );

    // Asking a question of the ghost fails the same way and leaves the
    // registry untouched: no session appears and nothing starts running.
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/ghost/query",
        Some(json!({ "question": "what is this?" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["type"], "urn:workbench:error:no_session");
    assert_eq!(payload["sessionId"], "ghost");

    let (_, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(payload["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn eviction_keeps_the_most_recently_active_sessions() {
    let test_app = TestApp::with_config(|config| {
        config.max_sessions = 4;
        config.keep_newest = 2;
    });

    for id in ["s1", "s2", "s3", "s4"] {
        create_session(&test_app.app, id, "mock").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let created = create_session(&test_app.app, "s5", "mock").await;
    assert_eq!(created["evicted"], json!(["s3", "s2", "s1"]));

    let (_, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    let ids: Vec<&str> = payload["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|session| session["sessionId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["s5", "s4"]);
}

#[tokio::test]
async fn broken_agents_surface_on_use_not_on_create() {
    let test_app = TestApp::new();

    let created = create_session(&test_app.app, "broken", "mystery-9000").await;
    assert_eq!(created["agentReady"], false);
    let recorded = created["agentError"].as_str().expect("agentError");
    assert!(recorded.contains("mystery-9000"), "{recorded}");

    // Data operations need the agent and report why it is missing.
    let (status, payload) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/broken/data",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(payload["type"], "urn:workbench:error:agent_not_ready");
    assert_eq!(payload["sessionId"], "broken");

    // A question is still accepted; the failure arrives as the run's
    // terminal update instead of an HTTP error.
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/broken/query",
        Some(json!({ "question": "anyone there?" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(payload["runId"].as_str().is_some());

    let updates = wait_for_completed(&test_app.app, "broken", Duration::from_secs(5)).await;
    let data = common::completed_data(&updates);
    assert_eq!(data["outcome"], "error");
    assert!(data["error"]
        .as_str()
        .unwrap()
        .contains("agent unavailable"));
}

#[tokio::test]
async fn custom_data_round_trip_over_http() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "catalog", "mock").await;

    let status = send_status(
        &test_app.app,
        Method::POST,
        "/v1/sessions/catalog/data",
        Some(json!({ "name": "expression.csv", "description": "RNA-seq counts" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let status = send_status(
        &test_app.app,
        Method::POST,
        "/v1/sessions/catalog/data",
        Some(json!({ "name": "variants.vcf", "description": "called variants" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, payload) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/catalog/data",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = payload["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"], "expression.csv");
    assert_eq!(entries[0]["description"], "RNA-seq counts");

    let (status, payload) = send_json(
        &test_app.app,
        Method::DELETE,
        "/v1/sessions/catalog/data/variants.vcf",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["removed"], true);
    let (_, payload) = send_json(
        &test_app.app,
        Method::DELETE,
        "/v1/sessions/catalog/data/variants.vcf",
        None,
    )
    .await;
    assert_eq!(payload["removed"], false);

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/catalog/data",
        Some(json!({ "name": "   ", "description": "blank" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["type"], "urn:workbench:error:invalid_request");
}

#[tokio::test]
async fn removing_a_session_invalidates_its_streams() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "ephemeral", "mock").await;

    let (status, _) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ephemeral/events",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    send_status(
        &test_app.app,
        Method::DELETE,
        "/v1/sessions/ephemeral",
        None,
    )
    .await;

    let (status, payload) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ephemeral/events",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["type"], "urn:workbench:error:no_session");
}

#[tokio::test]
async fn session_listing_is_ordered_by_recency() {
    let test_app = TestApp::new();

    create_session(&test_app.app, "first", "mock").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    create_session(&test_app.app, "second", "mock").await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Touch "first" through a read so it becomes the most recent.
    let _ = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/first/files",
        None,
    )
    .await;

    let (_, payload) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    let ids: Vec<&str> = payload["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|session| session["sessionId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["first", "second"]);
}

#[tokio::test]
async fn problem_shapes_for_known_error_kinds() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "busy", "mock:3000:answer:slow").await;
    common::start_query(&test_app.app, "busy", "long haul").await;

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/busy/query",
        Some(json!({ "question": "again?" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(payload["type"], "urn:workbench:error:run_active");
    assert_eq!(payload["title"], "Run Active");
    assert_eq!(payload["status"], 409);
    assert_eq!(payload["sessionId"], "busy");

    // Wind the run down so the app shuts down cleanly.
    send_status(&test_app.app, Method::POST, "/v1/sessions/busy/stop", None).await;
    wait_for_completed(&test_app.app, "busy", Duration::from_secs(10)).await;
}
