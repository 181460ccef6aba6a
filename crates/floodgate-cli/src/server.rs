//! HTTP gateway: document routes behind the resilience layer, plus health and
//! metrics endpoints.

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use floodgate_core::health::HealthStatus;
use floodgate_core::{Document, ResilienceLayer};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metric name prefix for `/metrics`.
pub const METRICS_PREFIX: &str = "floodgate";

type AppState = Arc<ResilienceLayer>;

/// Build the gateway router.
pub fn router(layer: AppState) -> Router {
    let documents = Router::new()
        .route(
            "/documents/{collection}/{id}",
            get(get_document)
                .put(put_document)
                .patch(patch_document)
                .delete(delete_document),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&layer),
            rate_limit,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .merge(documents)
        .with_state(layer)
}

/// Client identity for rate limiting: `x-real-ip`, then the first
/// `x-forwarded-for` entry, then the peer address.
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        })
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(layer): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let key = client_key(req.headers(), peer);
    let write = *req.method() != Method::GET;

    let decision = layer.admit(&key, write);
    if !decision.allowed {
        debug!(client = %key, retry_after_ms = decision.retry_after_ms, "Request rate limited");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "retry_after_ms": decision.retry_after_ms,
            })),
        )
            .into_response();
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(decision.retry_after_secs()),
        );
        return response;
    }

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    response
}

#[derive(Debug, Default, Deserialize)]
struct WriteParams {
    #[serde(default)]
    merge: bool,
}

fn accepted_or_busy(accepted: bool) -> Response {
    if accepted {
        (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "write buffer full" })),
        )
            .into_response()
    }
}

async fn get_document(
    State(layer): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    match layer.read_document(&collection, &id).await {
        Ok(Some(doc)) => (StatusCode::OK, Json(doc)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "document not found" })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, collection = %collection, id = %id, "Read failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn put_document(
    State(layer): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(params): Query<WriteParams>,
    Json(data): Json<Document>,
) -> Response {
    accepted_or_busy(layer.write_document(&collection, &id, data, params.merge))
}

async fn patch_document(
    State(layer): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(data): Json<Document>,
) -> Response {
    accepted_or_busy(layer.update_document(&collection, &id, data))
}

async fn delete_document(
    State(layer): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    accepted_or_busy(layer.delete_document(&collection, &id))
}

/// Health endpoint handler.
async fn health_handler(State(layer): State<AppState>) -> impl IntoResponse {
    let overall = layer.refresh_health();
    let report = layer.health().report();

    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(report))
}

/// Liveness check.
async fn healthz_handler(State(layer): State<AppState>) -> StatusCode {
    if layer.refresh_health() != HealthStatus::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness check.
async fn readyz_handler(State(layer): State<AppState>) -> StatusCode {
    layer.refresh_health();
    if layer.health().is_serving() && layer.health().is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(layer): State<AppState>) -> impl IntoResponse {
    let output = layer.metrics_snapshot().export_prometheus_text(METRICS_PREFIX);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use floodgate_core::config::RateLimiterConfig;
    use floodgate_core::{Config, InMemoryStore};
    use serde_json::Value;
    use tower::ServiceExt;

    fn layer_with(config: Config) -> (AppState, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let layer = ResilienceLayer::new(config, Arc::clone(&store) as _).unwrap();
        (Arc::new(layer), store)
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("x-real-ip", "10.0.0.1");
        match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_client_key_precedence() {
        let peer: SocketAddr = "192.168.1.9:4000".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some(peer)), "192.168.1.9");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" , 1.2.3.4, 5.6.7.8"));
        assert_eq!(client_key(&headers, Some(peer)), "1.2.3.4");

        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_key(&headers, Some(peer)), "9.9.9.9");
    }

    #[tokio::test]
    async fn test_get_existing_document() {
        let (layer, store) = layer_with(Config::default());
        let mut doc = Document::new();
        doc.insert("name".into(), json!("alice"));
        store.insert("users", "u1", doc);

        let response = router(layer)
            .oneshot(request(Method::GET, "/documents/users/u1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
        assert_eq!(body_json(response).await["name"], "alice");
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let (layer, _store) = layer_with(Config::default());
        let response = router(layer)
            .oneshot(request(Method::GET, "/documents/users/nobody", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_queues_write() {
        let (layer, store) = layer_with(Config::default());
        let app = router(Arc::clone(&layer));

        let response = app
            .oneshot(request(
                Method::PUT,
                "/documents/users/u2?merge=true",
                Some(json!({ "score": 3 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(layer.writer().metrics().buffer_depth, 1);

        layer.writer().flush().await;
        assert_eq!(store.document("users", "u2").unwrap()["score"], 3);
    }

    #[tokio::test]
    async fn test_write_backpressure_returns_503() {
        let mut config = Config::default();
        config.batch_writer.max_buffer_size = 1;
        config.batch_writer.max_batch_size = 1;
        let (layer, _store) = layer_with(config);
        let app = router(layer);

        let first = app
            .clone()
            .oneshot(request(Method::DELETE, "/documents/users/a", None))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(request(Method::DELETE, "/documents/users/b", None))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_rate_limited_request_gets_429() {
        let mut config = Config::default();
        config.rate_limits.endpoint = RateLimiterConfig::new("endpoint", 2.0, 0.5, 100);
        let (layer, _store) = layer_with(config);
        let app = router(layer);

        for _ in 0..2 {
            let ok = app
                .clone()
                .oneshot(request(Method::GET, "/documents/users/x", None))
                .await
                .unwrap();
            assert_eq!(ok.status(), StatusCode::NOT_FOUND);
        }

        let denied = app
            .clone()
            .oneshot(request(Method::GET, "/documents/users/x", None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = denied.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);

        // Health endpoints are not rate limited.
        let health = app
            .oneshot(request(Method::GET, "/healthz", None))
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_report() {
        let (layer, _store) = layer_with(Config::default());
        layer.health().mark_serving();

        let response = router(Arc::clone(&layer))
            .oneshot(request(Method::GET, "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["serving"], true);
        assert_eq!(body["components"]["store"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_circuit_open() {
        let (layer, _store) = layer_with(Config::default());
        for _ in 0..layer.config().circuit_breaker.failure_threshold {
            layer.breaker().record_failure();
        }

        let app = router(Arc::clone(&layer));
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ready = app
            .oneshot(request(Method::GET, "/readyz", None))
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_requires_serving() {
        let (layer, _store) = layer_with(Config::default());
        let app = router(Arc::clone(&layer));

        let before = app
            .clone()
            .oneshot(request(Method::GET, "/readyz", None))
            .await
            .unwrap();
        assert_eq!(before.status(), StatusCode::SERVICE_UNAVAILABLE);

        layer.health().mark_serving();
        let after = app
            .oneshot(request(Method::GET, "/readyz", None))
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (layer, _store) = layer_with(Config::default());
        let response = router(layer)
            .oneshot(request(Method::GET, "/metrics", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("floodgate_cache_hits_total"));
        assert!(text.contains("floodgate_flush_duration_seconds_bucket"));
    }
}
