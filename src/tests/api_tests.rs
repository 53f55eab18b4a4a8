use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use super::support::harness;
use crate::project::encode_path_token;

const PROJECT: &str = "/tmp/cchelm-api";

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let h = harness().await;
    let app = crate::api::router(h.orchestrator.clone());

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["mux"].as_bool().unwrap());
}

#[tokio::test]
async fn test_project_endpoints() {
    let h = harness().await;
    let app = crate::api::router(h.orchestrator.clone());

    let response = app
        .clone()
        .oneshot(post("/projects", serde_json::json!({ "path": PROJECT })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["path"], PROJECT);
    assert_eq!(body["name"], "cchelm-api");

    // Duplicate registration conflicts.
    let response = app
        .clone()
        .oneshot(post("/projects", serde_json::json!({ "path": PROJECT })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Relative paths are rejected.
    let response = app
        .clone()
        .oneshot(post("/projects", serde_json::json!({ "path": "rel" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("absolute"));

    let response = app.clone().oneshot(get("/projects")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let token = encode_path_token(PROJECT);
    let response = app
        .clone()
        .oneshot(delete(&format!("/projects/{}", token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(delete(&format!("/projects/{}", token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_session_and_fork_endpoints() {
    let h = harness().await;
    let app = crate::api::router(h.orchestrator.clone());
    let token = encode_path_token(PROJECT);

    app.clone()
        .oneshot(post("/projects", serde_json::json!({ "path": PROJECT })))
        .await
        .unwrap();

    // Create a session.
    let response = app
        .clone()
        .oneshot(post(
            &format!("/projects/{}/sessions", token),
            serde_json::json!({ "name": "s1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let session = json_body(response).await;
    let session_id = session["id"].as_str().unwrap().to_string();
    let main_id = session["main"]["id"].as_str().unwrap().to_string();
    assert_eq!(session["status"], "active");

    // Fork it.
    let response = app
        .clone()
        .oneshot(post(
            &format!("/projects/{}/sessions/{}/forks", token, session_id),
            serde_json::json!({ "name": "explore", "parentBranchId": main_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let fork = json_body(response).await;
    let fork_id = fork["id"].as_str().unwrap().to_string();

    // Second active fork conflicts.
    let response = app
        .clone()
        .oneshot(post(
            &format!("/projects/{}/sessions/{}/forks", token, session_id),
            serde_json::json!({ "name": "again", "parentBranchId": main_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("active fork"));

    // Deepest active branch wins.
    let response = app
        .clone()
        .oneshot(get(&format!(
            "/projects/{}/sessions/{}/active-branch",
            token, session_id
        )))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["branchId"], fork_id.as_str());

    // Select, merge, and list.
    let response = app
        .clone()
        .oneshot(post(
            &format!("/projects/{}/sessions/{}/select", token, session_id),
            serde_json::json!({ "branchId": fork_id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(post_empty(&format!(
            "/projects/{}/sessions/{}/forks/{}/merge",
            token, session_id, fork_id
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let merged = json_body(response).await;
    assert_eq!(merged["status"], "merged");

    let response = app
        .clone()
        .oneshot(get(&format!("/projects/{}/sessions", token)))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Close the session.
    let response = app
        .clone()
        .oneshot(delete(&format!(
            "/projects/{}/sessions/{}",
            token, session_id
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "closed");

    // Garbage tokens are a 400.
    let response = app
        .oneshot(get("/projects/!!notbase64!!/sessions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_agent_endpoints() {
    let h = harness().await;
    let app = crate::api::router(h.orchestrator.clone());

    let response = app
        .clone()
        .oneshot(post(
            "/agents",
            serde_json::json!({
                "name": "watcher",
                "masterPrompt": "Approve safe commands.",
                "hookEvents": ["Stop"],
                "autoApprove": false,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let agent = json_body(response).await;
    let agent_id = agent["id"].as_str().unwrap().to_string();
    assert_eq!(agent["status"], "idle");

    let response = app.clone().oneshot(get("/agents")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Rename through PUT.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/agents/{}", agent_id))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "name": "renamed" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["name"], "renamed");

    // Starting without a connection is a client error.
    let response = app
        .clone()
        .oneshot(post_empty(&format!("/agents/{}/start", agent_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Logs exist (start refusal is logged) and can be cleared.
    let response = app
        .clone()
        .oneshot(get(&format!("/agents/{}/logs", agent_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(delete(&format!("/agents/{}/logs", agent_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Unknown agents are 404s.
    let response = app
        .clone()
        .oneshot(get("/agents/nope/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(delete(&format!("/agents/{}", agent_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_hook_endpoint() {
    let h = harness().await;
    let app = crate::api::router(h.orchestrator.clone());

    // No target: validation error.
    let response = app
        .clone()
        .oneshot(post("/hooks", serde_json::json!({ "hookKind": "Stop" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Routable but unmatched: accepted, delivered to nobody.
    let response = app
        .oneshot(post(
            "/hooks",
            serde_json::json!({ "hookKind": "Stop", "muxPaneId": "%99" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["delivered"], 0);
}
