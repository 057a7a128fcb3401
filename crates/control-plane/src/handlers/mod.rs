//! HTTP handlers for the execflow control plane API.

pub mod events;
pub mod health;
pub mod runs;
pub mod workflows;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use health::health_check;

/// Build the application router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let workflow_routes = Router::new()
        .route("/api/workflows/compile", post(workflows::compile))
        .route("/api/workflows/analyze", post(workflows::analyze));

    let run_routes = Router::new()
        .route("/api/runs", post(runs::create))
        .route("/api/runs/{run_id}", get(runs::get))
        .route("/api/runs/{run_id}/resume", post(runs::resume))
        .route("/api/runs/{run_id}/cancel", post(runs::cancel))
        .route("/api/runs/{run_id}/events", get(events::stream))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
        .merge(workflow_routes)
        .merge(run_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{MemoryEventStore, RunStatus, StoredRun};
    use crate::engine::{Runner, UnconfiguredProvider};
    use crate::services::RunManager;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use execflow_tools::{ToolError, ToolInvoker};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoTools;

    #[async_trait::async_trait]
    impl ToolInvoker for NoTools {
        async fn invoke(&self, tool: &str, _args: &Value) -> Result<Value, ToolError> {
            Err(ToolError::Unsupported(tool.to_string()))
        }
    }

    fn app() -> Router {
        let runner = Runner::new(Arc::new(UnconfiguredProvider), Arc::new(NoTools));
        let manager = RunManager::new(Arc::new(MemoryEventStore::new()), Arc::new(runner));
        router(AppState::new(Arc::new(manager), AppConfig::default(), None))
    }

    fn document() -> Value {
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "set", "type": "set_variable", "data": {"target": "greeting", "value": "hi"}},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "set"},
                {"source": "set", "target": "end"}
            ]
        })
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn finished(app: &Router, run_id: &str) -> StoredRun {
        for _ in 0..500 {
            let response = app
                .clone()
                .oneshot(get(&format!("/api/runs/{run_id}")))
                .await
                .unwrap();
            let run: StoredRun = serde_json::from_value(body_json(response).await).unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_health() {
        let response = app().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body.get("database").is_none());
    }

    #[tokio::test]
    async fn test_compile_and_analyze() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/workflows/compile", document()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let program = body_json(response).await;
        assert_eq!(program["entry_node"], "start");
        assert_eq!(program["nodes"].as_array().unwrap().len(), 3);

        let response = app
            .oneshot(post_json("/api/workflows/analyze", document()))
            .await
            .unwrap();
        let analysis = body_json(response).await;
        assert_eq!(analysis["executionOrder"], json!(["start", "set", "end"]));
    }

    #[tokio::test]
    async fn test_compile_rejects_invalid_graph() {
        let response = app()
            .oneshot(post_json(
                "/api/workflows/compile",
                json!({"nodes": [{"id": "end", "type": "end"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["status"], 422);
        assert_eq!(body["error"], "workflow has no start node");
    }

    #[tokio::test]
    async fn test_run_then_replay_events_over_sse() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/runs",
                json!({"document": document(), "input": {"topic": "rust"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let run_id = created["runId"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "running");

        let run = finished(&app, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);

        let response = app
            .clone()
            .oneshot(get(&format!("/api/runs/{run_id}/events")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let text = body_text(response).await;
        assert!(text.contains("id: 1\n"));
        assert!(text.contains("event: run.started\n"));
        assert!(text.contains("event: run.completed"));

        // The query parameter wins over the header.
        let request = Request::builder()
            .uri(format!("/api/runs/{run_id}/events?lastSeq={}", run.last_seq - 1))
            .header("Last-Event-ID", "0")
            .body(Body::empty())
            .unwrap();
        let text = body_text(app.oneshot(request).await.unwrap()).await;
        assert!(!text.contains("run.started"));
        assert!(text.contains(&format!("id: {}\n", run.last_seq)));
    }

    #[tokio::test]
    async fn test_run_requires_exactly_one_source() {
        let response = app()
            .oneshot(post_json("/api/runs", json!({"input": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let app = app();
        let response = app.clone().oneshot(get("/api/runs/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/api/runs/nope/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resume_of_completed_run_conflicts() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/runs", json!({"document": document()})))
            .await
            .unwrap();
        let run_id = body_json(response).await["runId"]
            .as_str()
            .unwrap()
            .to_string();
        finished(&app, &run_id).await;

        let response = app
            .oneshot(post_json(&format!("/api/runs/{run_id}/resume"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
