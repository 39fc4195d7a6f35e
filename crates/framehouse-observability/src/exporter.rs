use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Encode every registered metric family in the Prometheus text format.
pub fn render_metrics() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

/// Handler for the `/metrics` endpoint
pub async fn metrics_handler() -> Response {
    match render_metrics() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [("content-type", content_type)], body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Router serving `/metrics`
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init();
        let app = create_metrics_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn test_render_includes_framehouse_metrics() {
        crate::metrics::init();
        crate::metrics::CHUNKS_FINALIZED_TOTAL
            .with_label_values(&["render-test"])
            .inc();

        let (_, body) = render_metrics().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("framehouse_chunks_finalized_total"));
    }
}
