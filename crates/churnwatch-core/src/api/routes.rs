//! API routes

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Event ingestion
        .route("/api/v1/events", post(handlers::ingest_event))

        // Digests
        .route("/api/v1/digests/sweep", post(handlers::run_sweep))

        // Channels
        .route("/api/v1/channels", get(handlers::list_channels))
        .route("/api/v1/channels/:channel_id", put(handlers::upsert_channel))

        // Alert settings
        .route(
            "/api/v1/channels/:channel_id/alerts",
            get(handlers::get_alert_settings).put(handlers::update_alert_settings),
        )

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::alerting::{AlertOrchestrator, LogNotifier};
    use crate::config::AlertingConfig;
    use crate::db::{Database, MemoryStore};

    fn app() -> Router {
        let db = Database::from_store(Arc::new(MemoryStore::default()));
        let orchestrator = Arc::new(AlertOrchestrator::new(
            db.clone(),
            &AlertingConfig::default(),
            Arc::new(LogNotifier::default()),
        ));
        create_router(AppState { db, orchestrator })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_event_ingestion_fires_alerts() {
        let app = app();
        let (status, _) = send(
            &app,
            "PUT",
            "/api/v1/channels/1",
            Some(json!({"title": "News", "admin_user_id": 10, "notify_chat_id": -100})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            "PUT",
            "/api/v1/channels/1/alerts",
            Some(json!({"vip_ids": [42], "churn_percent_threshold": 0.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/events",
            Some(json!({
                "channel_id": 1,
                "user_id": 42,
                "event_type": "leave",
                "occurred_at": "2024-07-09T12:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event_id"], 1);
        assert_eq!(body["decisions"][0]["kind"], "vip_left");
        assert_eq!(body["decisions"][0]["user_id"], 42);
    }

    #[tokio::test]
    async fn test_settings_validation_and_not_found() {
        let app = app();
        let (status, _) = send(&app, "GET", "/api/v1/channels/9/alerts", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(
            &app,
            "PUT",
            "/api/v1/channels/9",
            Some(json!({"title": "Nine", "admin_user_id": 1})),
        )
        .await;
        let (status, _) = send(
            &app,
            "PUT",
            "/api/v1/channels/9/alerts",
            Some(json!({"quiet_hours_start": 24})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "GET", "/api/v1/channels/9/alerts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mass_leave_threshold"], 5);
    }

    #[tokio::test]
    async fn test_manual_sweep_at_instant() {
        let app = app();
        send(
            &app,
            "PUT",
            "/api/v1/channels/1",
            Some(json!({"title": "News", "admin_user_id": 10, "notify_chat_id": -100})),
        )
        .await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/digests/sweep?at=2024-07-09T09:00:00Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channels_checked"], 1);
        assert_eq!(body["jobs_due"], 1);
        assert_eq!(body["delivered"], 1);
    }
}
