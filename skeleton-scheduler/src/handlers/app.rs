use axum::{extract::State, http::StatusCode, routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use skeleton_common::metrics::setup_metrics_routes;

/// Health endpoints of the scheduler. `stopping` is cancelled once the
/// shutdown starts.
pub fn app(stopping: CancellationToken, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/ping", routing::get(ping))
        .route("/_readiness", routing::get(readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(stopping);

    setup_metrics_routes(router, metrics)
}

pub async fn index() -> &'static str {
    "skeleton scheduler"
}

pub async fn ping() -> &'static str {
    "."
}

pub async fn readiness(State(stopping): State<CancellationToken>) -> (StatusCode, &'static str) {
    if stopping.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_and_ping() {
        let app = app(CancellationToken::new(), None);

        assert_eq!(
            get(app.clone(), "/").await,
            (StatusCode::OK, "skeleton scheduler".to_owned())
        );
        assert_eq!(get(app, "/ping").await, (StatusCode::OK, ".".to_owned()));
    }

    #[tokio::test]
    async fn readiness_turns_unavailable_on_shutdown() {
        let stopping = CancellationToken::new();
        let app = app(stopping.clone(), None);

        assert_eq!(get(app.clone(), "/_readiness").await.0, StatusCode::OK);
        stopping.cancel();
        assert_eq!(
            get(app, "/_readiness").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn exposes_metrics_when_recording() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = app(CancellationToken::new(), Some(handle));

        assert_eq!(get(app, "/metrics").await.0, StatusCode::OK);
    }
}
