use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    routing, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use skeleton_common::metrics::setup_metrics_routes;

use super::{status, users, AppState};

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/ping", routing::get(ping))
        .route("/_readiness", routing::get(readiness))
        .route("/robots.txt", routing::get(robots))
        .route("/status", routing::get(status::status))
        .route("/api/status", routing::get(status::status))
        .route("/api/users", routing::get(users::list))
        .route("/api/user/:id/detail", routing::get(users::detail));
    let router = with_layers(router, &state.allowed_origins).with_state(state);

    setup_metrics_routes(router, metrics)
}

const NO_CACHE: &str = "no-cache, no-store, no-transform, must-revalidate, private, max-age=0";

/// Panics answer 500, responses are never cached, and browsers may only
/// call from `allowed_origins`.
pub fn with_layers<S>(router: Router<S>, allowed_origins: &[String]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CatchPanicLayer::new())
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static(NO_CACHE),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::PRAGMA,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(cors(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::mirror_request()
    } else {
        // Origins are validated with the configuration.
        AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(300))
        .allow_origin(origin)
}

pub async fn index() -> &'static str {
    "skeleton api"
}

/// Load balancer heartbeat.
pub async fn ping() -> &'static str {
    "."
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.stopping.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ready")
    }
}

pub async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}
