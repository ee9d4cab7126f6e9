//! HTTP API for the conversion service.
//!
//! ```text
//! GET  /                          service info
//! GET  /health                    liveness plus broker reachability
//! GET  /metrics                   Prometheus exposition
//! POST /convert                   synchronous JPEG conversion
//! POST /convert-to-webp           synchronous WebP conversion
//! POST /jobs/convert              submit one conversion job
//! GET  /jobs/:id                  job status
//! GET  /jobs/:id/result           converted bytes
//! POST /jobs/batch-convert        submit a batch
//! GET  /jobs/batch/:id            composite batch status
//! GET  /jobs/batch/:id/results    ZIP of successful members
//! ```

pub mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::engine::Engine;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let server = &state.engine.config().server;
    // Room for a full batch of maximum-size files; each file is checked on its own.
    let body_limit = server
        .max_upload_bytes
        .saturating_mul(state.engine.batches().max_items());
    let cors = cors_layer(&server.cors_origins);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/convert", post(handlers::convert_to_jpeg))
        .route("/convert-to-webp", post(handlers::convert_to_webp))
        .route("/jobs/convert", post(handlers::submit_job))
        .route("/jobs/batch-convert", post(handlers::submit_batch))
        .route("/jobs/batch/:id", get(handlers::get_batch_status))
        .route("/jobs/batch/:id/results", get(handlers::get_batch_results))
        .route("/jobs/:id", get(handlers::get_job_status))
        .route("/jobs/:id/result", get(handlers::get_job_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION])
}

/// API response wrapper. Failures use `ErrorResponse` instead.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
    }

    #[test]
    fn test_api_response_skips_empty_fields() {
        let json = serde_json::to_value(ApiResponse::success(42)).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": 42}));
    }

    #[test]
    fn test_cors_accepts_configured_origins() {
        // Invalid header values are dropped rather than failing startup.
        let _layer = cors_layer(&["http://localhost:5173".to_string(), "\n".to_string()]);
        let _any = cors_layer(&[]);
    }
}
