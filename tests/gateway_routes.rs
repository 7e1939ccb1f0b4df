//! Integration tests for the record API routes and request interception.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wkf_emulator::{Gateway, StoreRegistry, WorkflowService};

fn test_gateway() -> Gateway {
    let registry = Arc::new(StoreRegistry::in_memory());
    Gateway::new(Arc::new(WorkflowService::new(registry)))
}

fn build_request(method: Method, uri: &str, db: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(db) = db {
        builder = builder.header("x-dbname", db);
    }
    match body {
        Some(payload) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&payload).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Send a request and return status plus the body as JSON (or a JSON string for text)
async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    db: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(build_request(method, uri, db, body))
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let parsed = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, parsed)
}

#[tokio::test]
async fn run_lifecycle_through_routes() {
    let router = test_gateway().router();

    let (status, run) = call(
        &router,
        Method::POST,
        "/api/workflows/runs",
        Some("app"),
        Some(json!({ "workflowName": "approval", "input": [1, "two"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "pending");
    assert_eq!(run["deploymentId"], "default");
    assert_eq!(run["executionContext"], json!({}));
    assert!(run.get("startedAt").is_none());
    let run_id = run["runId"].as_str().unwrap().to_string();
    assert!(run_id.starts_with("wrun_"));

    let (status, running) = call(
        &router,
        Method::PATCH,
        &format!("/api/workflows/runs/{run_id}"),
        Some("app"),
        Some(json!({ "status": "running" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["status"], "running");
    assert!(running["startedAt"].is_string());

    let (status, step) = call(
        &router,
        Method::POST,
        "/api/workflows/steps",
        Some("app"),
        Some(json!({ "runId": run_id, "stepId": "s1", "stepName": "charge" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(step["id"], format!("{run_id}-s1"));
    assert_eq!(step["attempt"], 0);

    let (status, step) = call(
        &router,
        Method::PATCH,
        &format!("/api/workflows/steps/{run_id}/s1"),
        Some("app"),
        Some(json!({ "status": "completed", "output": { "ok": true } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(step["status"], "completed");
    assert_eq!(step["attempt"], 0);
    assert!(step["completedAt"].is_string());

    let (_, steps) = call(
        &router,
        Method::GET,
        &format!("/api/workflows/steps/{run_id}"),
        Some("app"),
        None,
    )
    .await;
    assert_eq!(steps["hasMore"], false);
    assert_eq!(steps["data"].as_array().unwrap().len(), 1);

    let (status, event) = call(
        &router,
        Method::POST,
        "/api/workflows/events",
        Some("app"),
        Some(json!({ "runId": run_id, "eventType": "step_completed", "eventData": { "legacy": 1 } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["payload"], json!({ "legacy": 1 }));

    let (_, events) = call(
        &router,
        Method::GET,
        &format!("/api/workflows/runs/{run_id}/events"),
        Some("app"),
        None,
    )
    .await;
    assert_eq!(events.as_array().unwrap().len(), 1);

    let (_, hook) = call(
        &router,
        Method::POST,
        "/api/workflows/hooks",
        Some("app"),
        Some(json!({ "runId": run_id, "token": "tok-1" })),
    )
    .await;
    assert!(hook["hookId"].as_str().unwrap().starts_with("whook_"));

    let (status, found) = call(
        &router,
        Method::GET,
        "/api/workflows/hooks?token=tok-1",
        Some("app"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["hookId"], hook["hookId"]);

    let (_, completed) = call(
        &router,
        Method::PATCH,
        &format!("/api/workflows/runs/{run_id}"),
        Some("app"),
        Some(json!({ "status": "completed", "output": 42 })),
    )
    .await;
    assert_eq!(completed["status"], "completed");
    assert_eq!(completed["output"], 42);

    // Hooks of a finished run are gone
    let (status, body) = call(
        &router,
        Method::GET,
        "/api/workflows/hooks?token=tok-1",
        Some("app"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "Hook not found" }));
}

#[tokio::test]
async fn databases_are_isolated_by_header() {
    let router = test_gateway().router();

    let (_, run) = call(
        &router,
        Method::POST,
        "/api/workflows/runs",
        None,
        Some(json!({ "workflowName": "w" })),
    )
    .await;
    let run_id = run["runId"].as_str().unwrap();

    let (status, _) = call(
        &router,
        Method::GET,
        &format!("/api/workflows/runs/{run_id}"),
        Some("postgres"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &router,
        Method::GET,
        &format!("/api/workflows/runs/{run_id}"),
        Some("other"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": format!("Run {run_id} not found") }));
}

#[tokio::test]
async fn list_runs_pages_newest_first() {
    let router = test_gateway().router();

    let mut created = Vec::new();
    for name in ["a", "b", "a", "a"] {
        let (_, run) = call(
            &router,
            Method::POST,
            "/api/workflows/runs",
            Some("app"),
            Some(json!({ "workflowName": name })),
        )
        .await;
        created.push(run["runId"].as_str().unwrap().to_string());
    }

    let (_, page) = call(
        &router,
        Method::GET,
        "/api/workflows/runs?workflowName=a&limit=2",
        Some("app"),
        None,
    )
    .await;
    let ids: Vec<&str> = page["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|run| run["runId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![created[3].as_str(), created[2].as_str()]);
    assert_eq!(page["hasMore"], true);
    assert_eq!(page["cursor"], created[2].as_str());

    // Unparseable limit falls back to the default page size
    let (_, page) = call(
        &router,
        Method::GET,
        "/api/workflows/runs?limit=lots",
        Some("app"),
        None,
    )
    .await;
    assert_eq!(page["data"].as_array().unwrap().len(), 4);
    assert_eq!(page["hasMore"], false);
    assert_eq!(page["cursor"], Value::Null);

    let (_, page) = call(
        &router,
        Method::GET,
        "/api/workflows/runs?status=completed",
        Some("app"),
        None,
    )
    .await;
    assert!(page["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn run_status_never_moves_backwards() {
    let router = test_gateway().router();

    let (_, run) = call(
        &router,
        Method::POST,
        "/api/workflows/runs",
        Some("app"),
        Some(json!({ "workflowName": "w" })),
    )
    .await;
    let uri = format!("/api/workflows/runs/{}", run["runId"].as_str().unwrap());

    call(&router, Method::PATCH, &uri, Some("app"), Some(json!({ "status": "failed" }))).await;
    let (status, after) = call(
        &router,
        Method::PATCH,
        &uri,
        Some("app"),
        Some(json!({ "status": "running", "error": { "message": "late" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["status"], "failed");
    assert_eq!(after["error"], json!({ "message": "late" }));
    assert!(after.get("startedAt").is_none());
}

#[tokio::test]
async fn queue_routes_round_trip() {
    let router = test_gateway().router();

    let (_, enqueued) = call(
        &router,
        Method::POST,
        "/api/workflows/queue",
        Some("app"),
        Some(json!({
            "queueName": "__wkf_step_charge",
            "message": { "runId": "wrun_1" },
            "opts": { "idempotencyKey": "k1" }
        })),
    )
    .await;
    let message_id = enqueued["messageId"].as_str().unwrap().to_string();

    let (_, again) = call(
        &router,
        Method::POST,
        "/api/workflows/queue",
        Some("app"),
        Some(json!({
            "queueName": "__wkf_step_charge",
            "message": { "runId": "wrun_other" },
            "opts": { "idempotencyKey": "k1" }
        })),
    )
    .await;
    assert_eq!(again["messageId"], message_id.as_str());

    let (status, polled) = call(
        &router,
        Method::GET,
        "/api/workflows/queue/__wkf_step_charge",
        Some("app"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polled, json!({ "id": message_id, "data": { "runId": "wrun_1" }, "attempt": 1 }));

    let (_, empty) = call(
        &router,
        Method::GET,
        "/api/workflows/queue/__wkf_step_charge",
        Some("app"),
        None,
    )
    .await;
    assert_eq!(empty, Value::Null);

    for action in ["touch", "ack"] {
        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/workflows/queue/{action}"),
            Some("app"),
            Some(json!({ "messageId": message_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));
    }

    // Unknown ids are acknowledged without effect
    let (_, body) = call(
        &router,
        Method::POST,
        "/api/workflows/queue/nack",
        Some("app"),
        Some(json!({ "messageId": "msg_unknown" })),
    )
    .await;
    assert_eq!(body, json!({ "success": true }));
}

#[tokio::test]
async fn unmatched_requests_are_not_found() {
    let router = test_gateway().router();

    for (method, uri) in [
        (Method::GET, "/api/workflows/nope"),
        (Method::DELETE, "/api/workflows/runs/wrun_1"),
        (Method::GET, "/api/workflows/hooks"),
        (Method::GET, "/api/workflows/queue/ack"),
        (Method::PUT, "/api/workflows/queue"),
    ] {
        let (status, body) = call(&router, method.clone(), uri, Some("app"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(body, Value::String("Not Found".to_string()));
    }
}

#[tokio::test]
async fn malformed_bodies_become_server_errors() {
    let router = test_gateway().router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/workflows/runs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("Malformed"));
}

#[tokio::test]
async fn requests_outside_the_prefix_pass_through() {
    let gateway = test_gateway();

    let passthrough = gateway
        .handle_request(build_request(Method::GET, "/somewhere/else", None, None))
        .await;
    assert!(passthrough.is_none());

    let handled = gateway
        .handle_request(build_request(Method::GET, "/api/workflows/runs", Some("app"), None))
        .await
        .unwrap();
    assert_eq!(handled.status(), StatusCode::OK);

    let inner = Router::new().route("/somewhere/else", get(|| async { "inner" }));
    let app = gateway.intercept(inner);

    let (status, body) = call(&app, Method::GET, "/somewhere/else", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("inner".to_string()));

    let (status, body) = call(&app, Method::GET, "/api/workflows/runs", Some("app"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn completed_at_is_stamped_once() {
    let router = test_gateway().router();

    let (_, run) = call(
        &router,
        Method::POST,
        "/api/workflows/runs",
        Some("app"),
        Some(json!({ "workflowName": "w" })),
    )
    .await;
    let uri = format!("/api/workflows/runs/{}", run["runId"].as_str().unwrap());

    let (_, first) = call(&router, Method::PATCH, &uri, Some("app"), Some(json!({ "status": "completed" }))).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (_, second) = call(&router, Method::PATCH, &uri, Some("app"), Some(json!({ "status": "completed" }))).await;

    assert!(first["completedAt"].is_string());
    assert_eq!(first["completedAt"], second["completedAt"]);
    assert_ne!(first["updatedAt"], second["updatedAt"]);
}
