use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};

use health::{run_all, Probe};
use skeleton_common::probes::{MessagingProbe, PostgresProbe};
use skeleton_common::status_page;
use skeleton_common::{API_HEALTH_SUBJECT, SCHEDULER_HEALTH_SUBJECT};

use super::{error_reply, AppState};

type Probes = Vec<(String, Arc<dyn Probe>)>;

fn uptime_probes(state: &AppState) -> Probes {
    let pool = state.context.pool().clone();
    let database: Arc<dyn Probe> = Arc::new(
        PostgresProbe::new(move || Some(pool.clone())).with_timeout(state.status.probe_timeout),
    );

    vec![("SkeletonDb".to_owned(), database)]
}

fn service_probes(state: &AppState) -> Probes {
    [("api", API_HEALTH_SUBJECT), ("scheduler", SCHEDULER_HEALTH_SUBJECT)]
        .into_iter()
        .map(|(key, subject)| {
            let probe: Arc<dyn Probe> = Arc::new(
                MessagingProbe::new(state.context.messaging().cloned(), subject)
                    .with_window(state.status.reply_window)
                    .with_ping_timeout(state.status.probe_timeout),
            );
            (key.to_owned(), probe)
        })
        .collect()
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

/// Runs every probe, and answers with JSON or with the HTML status page
/// depending on the `Accept` header. A failing probe is part of the report,
/// not an error of the endpoint.
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let uptime = uptime_probes(&state);
    let split = uptime.len();
    let probes = uptime.into_iter().chain(service_probes(&state)).collect();

    let results = run_all(probes, &state.stopping).await;

    if wants_json(&headers) {
        return Json(results).into_response();
    }

    match status_page::render(&results[..split], &results[split..]) {
        Ok(page) => Html(page).into_response(),
        Err(err) => error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render template: {err}"),
        )
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use crate::handlers::app;
    use crate::handlers::test_support::{state_with, unreachable_pool};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use health::{KeyedResult, ProbeStatus};
    use http_body_util::BodyExt;
    use sqlx::PgPool;
    use tower::ServiceExt;

    fn request(uri: &str, accept: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::ACCEPT, accept)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn json_lists_uptime_then_services() {
        let app = app(state_with(unreachable_pool()).await, None);

        let response = app
            .oneshot(request("/status", "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let results: Vec<KeyedResult> = serde_json::from_slice(&body).unwrap();

        let summary: Vec<(&str, ProbeStatus, u32)> = results
            .iter()
            .map(|r| (r.key.as_str(), r.result.status(), r.result.instance_count()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("SkeletonDb", ProbeStatus::Error, 0),
                // This very process answers on the api subject.
                ("api", ProbeStatus::Healthy, 1),
                ("scheduler", ProbeStatus::Error, 0),
            ]
        );
    }

    #[tokio::test]
    async fn html_by_default() {
        let app = app(state_with(unreachable_pool()).await, None);

        let response = app
            .oneshot(request("/api/status", "text/html"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8(body.to_vec()).unwrap();
        assert!(page.contains("Service info"));
        assert!(page.contains("<td>SkeletonDb</td>"));
        assert!(page.contains("<td>scheduler</td>"));
    }

    #[tokio::test]
    async fn probes_stop_when_shutting_down() {
        let state = state_with(unreachable_pool()).await;
        state.stopping.cancel();
        let app = app(state, None);

        let response = app
            .oneshot(request("/status", "application/json"))
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let results: Vec<KeyedResult> = serde_json::from_slice(&body).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.result.status() == ProbeStatus::Unknown));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn healthy_database(db: PgPool) {
        let app = app(state_with(db).await, None);

        let response = app
            .oneshot(request("/status", "application/json"))
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_json_diff::assert_json_include!(
            actual: value,
            expected: serde_json::json!([
                {"key": "SkeletonDb", "status": "healthy", "instance_count": 1},
                {"key": "api", "status": "healthy", "instance_count": 1},
                {"key": "scheduler", "status": "error", "instance_count": 0},
            ])
        );
    }
}
