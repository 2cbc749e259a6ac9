use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::{handlers, ws};
use crate::engine::AnalysisEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AnalysisEngine>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/capabilities", get(handlers::list_capabilities))
        .route("/capabilities/:name", get(handlers::describe_capability))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id", delete(handlers::cancel_job))
        .route("/jobs/:id/stream", get(ws::stream_job))
        .layer(CorsLayer::permissive())
        .with_state(state.engine)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    println!("statmill API server listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::capability::selftest::SelftestAnalysis;
    use crate::config::Config;
    use crate::types::CapabilityDescriptor;

    fn create_test_app() -> (Router, Arc<AnalysisEngine>) {
        let engine = AnalysisEngine::new(Config::default());
        engine
            .install(CapabilityDescriptor::new(
                "selftest",
                "1.0.0",
                Arc::new(SelftestAnalysis::new(3, Duration::from_millis(5))),
            ))
            .unwrap();
        let state = AppState {
            engine: engine.clone(),
        };
        (create_router(state), engine)
    }

    fn submit_body(capability: &str) -> Body {
        Body::from(
            json!({
                "capability": capability,
                "parameters": { "ping": true },
                "dataset": { "uri": "datasets/smoke.csv", "contentHash": "abc123" },
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_list_capabilities() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/capabilities")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["name"], "selftest");
        assert_eq!(json[0]["enabled"], true);
    }

    #[tokio::test]
    async fn test_describe_unknown_capability_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/capabilities/pca")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["error"]["kind"], "unknown_capability");
    }

    #[tokio::test]
    async fn test_submit_job_returns_id_and_state() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(submit_body("selftest"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert!(json["jobId"].is_string());
        assert!(matches!(
            json["initialState"].as_str(),
            Some("Queued") | Some("Running") | Some("Succeeded"),
        ));
    }

    #[tokio::test]
    async fn test_submit_unknown_capability_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(submit_body("pca"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_job_status_after_submit() {
        let (app, engine) = create_test_app();

        let job_id = engine
            .submit(
                "selftest",
                json!({"ping": true}),
                crate::types::DatasetRef::new("datasets/smoke.csv", "abc123"),
                None,
            )
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["jobId"], job_id.to_string());
        assert_eq!(json["capability"], "selftest");
    }

    #[tokio::test]
    async fn test_get_unknown_job_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", uuid::Uuid::nil()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["error"]["kind"], "unknown_job");
    }

    #[tokio::test]
    async fn test_cancel_job_returns_snapshot() {
        let (app, engine) = create_test_app();

        let job_id = engine
            .submit(
                "selftest",
                json!({"slow": true}),
                crate::types::DatasetRef::new("datasets/smoke.csv", "abc123"),
                None,
            )
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert!(matches!(
            json["state"].as_str(),
            Some("Cancelled") | Some("Running"),
        ));
    }
}
