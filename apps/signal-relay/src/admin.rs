use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::registry::{ParticipantInfo, Registry};

#[derive(Clone)]
pub struct AdminState {
    pub registry: Registry,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    participants: usize,
}

#[derive(Debug, Serialize)]
pub struct ParticipantsResponse {
    participants: Vec<ParticipantInfo>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/participants", get(list_participants))
        .route("/metrics", get(render_metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn health_check(State(state): State<AdminState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        participants: state.registry.len(),
    })
}

pub async fn list_participants(State(state): State<AdminState>) -> Json<ParticipantsResponse> {
    Json(ParticipantsResponse {
        participants: state.registry.snapshot(),
    })
}

pub async fn render_metrics(State(state): State<AdminState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_channel;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_bound_participants() {
        let registry = Registry::new();
        let (channel, _rx) = test_channel();
        registry.bind("soldier1", channel);

        let app = router(AdminState {
            registry,
            metrics: None,
        });
        let (status, body) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["participants"], 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn participants_are_listed_by_id() {
        let registry = Registry::new();
        let (commander, _commander_rx) = test_channel();
        let (soldier, _soldier_rx) = test_channel();
        registry.bind("soldier1", soldier);
        registry.bind("commander1", commander.clone());

        let app = router(AdminState {
            registry,
            metrics: None,
        });
        let (status, body) = get_json(app, "/participants").await;

        assert_eq!(status, StatusCode::OK);
        let participants = body["participants"].as_array().unwrap();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0]["id"], "commander1");
        assert_eq!(
            participants[0]["connection_id"],
            commander.connection_id().to_string()
        );
        assert_eq!(participants[1]["id"], "soldier1");
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_endpoint_requires_recorder() {
        let app = router(AdminState {
            registry: Registry::new(),
            metrics: None,
        });
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = router(AdminState {
            registry: Registry::new(),
            metrics: Some(handle),
        });
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
