use crate::metrics::Metrics;
use crate::proxmox::NodeStats;
use crate::stats::{AggregateStats, ContainerStats, StatsError, StatsService, VmStats};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub stats: Arc<StatsService>,
}

/// Every failure leaves this layer as `500 {"error": ...}`.
#[derive(Debug)]
pub struct ApiError(String);

impl From<StatsError> for ApiError {
    fn from(err: StatsError) -> Self {
        Self(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0 })),
        )
            .into_response()
    }
}

pub fn build_router(metrics: Arc<Metrics>, stats: Arc<StatsService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/api/stats", get(all_stats_handler))
        .route("/api/stats/containers", get(container_stats_handler))
        .route("/api/stats/vms", get(vm_stats_handler))
        .route("/api/stats/node", get(node_stats_handler))
        .with_state(HttpAppState { metrics, stats })
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => ApiError(format!("failed to encode metrics: {err}")).into_response(),
    }
}

async fn all_stats_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<AggregateStats>, ApiError> {
    state.metrics.inc_api_request("stats");
    let stats = state.stats.all_stats().await.map_err(log_failure("/api/stats"))?;
    Ok(Json(stats))
}

async fn container_stats_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<ContainerStats>, ApiError> {
    state.metrics.inc_api_request("containers");
    let stats = state
        .stats
        .container_stats()
        .await
        .map_err(log_failure("/api/stats/containers"))?;
    Ok(Json(stats))
}

async fn vm_stats_handler(State(state): State<HttpAppState>) -> Result<Json<VmStats>, ApiError> {
    state.metrics.inc_api_request("vms");
    let stats = state
        .stats
        .vm_stats()
        .await
        .map_err(log_failure("/api/stats/vms"))?;
    Ok(Json(stats))
}

async fn node_stats_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<NodeStats>, ApiError> {
    state.metrics.inc_api_request("node");
    let stats = state
        .stats
        .node_stats()
        .await
        .map_err(log_failure("/api/stats/node"))?;
    Ok(Json(stats))
}

fn log_failure(route: &'static str) -> impl Fn(StatsError) -> ApiError {
    move |err| {
        error!(route, error = %err, "stats request failed");
        ApiError::from(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::test_support::{client_for, NODE};
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(stats: StatsService) -> Router {
        let metrics = Metrics::new().expect("metrics init");
        build_router(metrics, Arc::new(stats))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn seeded_backend() -> MockServer {
        let server = MockServer::start().await;
        let routes = [
            (
                "lxc",
                json!({ "data": [
                    { "hostname": "cartofia-bot-1", "status": "running" },
                    { "hostname": "web", "status": "stopped" }
                ]}),
            ),
            ("qemu", json!({ "data": [] })),
            (
                "status",
                json!({ "data": {
                    "uptime": 90000,
                    "memory": { "used": 1073741824_u64, "total": 4294967296_u64 },
                    "disk": { "used": 1073741824_u64, "total": 10737418240_u64 }
                }}),
            ),
        ];
        for (route, body) in routes {
            Mock::given(method("GET"))
                .and(path(format!("/api2/json/nodes/{NODE}/{route}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&server)
                .await;
        }
        server
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let router = app(StatsService::new(None, StatsConfig::default()));
        let (status, body) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn aggregate_stats_endpoint() {
        let server = seeded_backend().await;
        let stats = StatsService::new(Some(client_for(&server)), StatsConfig::default());

        let (status, body) = get_json(app(stats), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_bots"], 1);
        assert_eq!(body["online_containers"], 1);
        assert_eq!(body["total_containers"], 2);
        assert_eq!(body["online_vms"], 0);
        assert_eq!(body["uptime_display"], "1d 1h");
        assert_eq!(body["memory_used_gb"], 1.0);
        assert_eq!(body["disk_total_gb"], 10.0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn section_endpoints() {
        let server = seeded_backend().await;
        let stats = Arc::new(StatsService::new(
            Some(client_for(&server)),
            StatsConfig::default(),
        ));
        let router = build_router(Metrics::new().expect("metrics"), stats);

        let (status, body) = get_json(router.clone(), "/api/stats/containers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online_containers"], 1);
        assert_eq!(body["total_containers"], 2);
        assert_eq!(body["containers"][0]["hostname"], "cartofia-bot-1");

        let (_, body) = get_json(router.clone(), "/api/stats/vms").await;
        assert_eq!(body, json!({ "online_vms": 0, "total_vms": 0, "vms": [] }));

        let (_, body) = get_json(router, "/api/stats/node").await;
        assert_eq!(body["uptime"], 90_000);
        assert_eq!(body["memory_total"], 4_294_967_296_u64);
        assert_eq!(body["disk_used"], 1_073_741_824_u64);
    }

    #[tokio::test]
    async fn unconfigured_backend_is_a_500_with_error_body() {
        for uri in [
            "/api/stats",
            "/api/stats/containers",
            "/api/stats/vms",
            "/api/stats/node",
        ] {
            let (status, body) =
                get_json(app(StatsService::new(None, StatsConfig::default())), uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
            assert_eq!(body["error"], "Proxmox is not configured");
        }
    }

    #[tokio::test]
    async fn metrics_endpoint_counts_api_requests() {
        let metrics = Metrics::new().expect("metrics init");
        let router = build_router(
            metrics.clone(),
            Arc::new(StatsService::new(None, StatsConfig::default())),
        );
        let _ = get_json(router.clone(), "/api/stats").await;

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("pvebot_api_requests_total{endpoint=\"stats\"} 1"));
    }
}
