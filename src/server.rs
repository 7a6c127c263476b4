use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::info;

use crate::api::handler::{
    get_deposit, health_check, monitor_status, register_deposit, start_monitor, stop_monitor,
    trigger_check, verify_deposit, AppState,
};

/// Manual checks and verification call the explorer with retries; leave room for backoff
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Monitor control
                .route("/monitor/status", get(monitor_status))
                .route("/monitor/start", post(start_monitor))
                .route("/monitor/stop", post(stop_monitor))
                .route("/monitor/check", post(trigger_check))
                // Deposits
                .route("/deposits", post(register_deposit))
                .route("/deposits/:address", get(get_deposit))
                .route("/deposits/:address/verify", post(verify_deposit)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::very_permissive())
                .layer(CompressionLayer::new())
                .layer(request_timeout(REQUEST_TIMEOUT)),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Requests running past `limit` are answered with 408
fn request_timeout(limit: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, limit)
}

pub async fn run_server<F>(
    app: Router,
    bind_address: &str,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::deposit::DepositVerificationService;
    use crate::ledger::memory::InMemoryDepositStore;
    use crate::monitor::{DepositMonitor, MonitorConfig};
    use crate::test_utils::{address, payment, test_clock, FakeExplorer, FakeSubmitter, DEPOSIT_ADDRESS};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        explorer: Arc<FakeExplorer>,
        submitter: Arc<FakeSubmitter>,
        monitor: Arc<DepositMonitor>,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(test_clock());
        let explorer = Arc::new(FakeExplorer::new());
        let submitter = Arc::new(FakeSubmitter::new());
        let store = Arc::new(InMemoryDepositStore::new());

        let config = MonitorConfig {
            deposit_address: DEPOSIT_ADDRESS.to_string(),
            ..MonitorConfig::default()
        };
        let monitor = Arc::new(
            DepositMonitor::new(config, explorer.clone(), submitter.clone(), store.clone(), clock.clone())
                .await
                .unwrap(),
        );
        let verification = Arc::new(DepositVerificationService::new(
            store,
            explorer.clone(),
            monitor.verifier(),
            clock,
            monitor.config().verification_config(),
        ));

        let app = create_app(AppState {
            monitor: monitor.clone(),
            verification,
        });

        Harness {
            app,
            explorer,
            submitter,
            monitor,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_times_out() {
        async fn slow() -> &'static str {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "done"
        }
        let app = Router::new()
            .route("/slow", get(slow))
            .layer(request_timeout(Duration::from_secs(1)));

        let request = Request::builder().uri("/slow").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_health_reports_unhealthy_until_started() {
        let h = harness().await;

        let (status, body) = call(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");

        let (status, body) = call(&h.app, "POST", "/api/v1/monitor/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);

        let (status, _) = call(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&h.app, "POST", "/api/v1/monitor/start", None).await;
        assert_eq!(body["changed"], false);

        let (_, body) = call(&h.app, "POST", "/api/v1/monitor/stop", None).await;
        assert_eq!(body["is_running"], false);
    }

    #[tokio::test]
    async fn test_manual_check_refunds_and_shows_in_status() {
        let h = harness().await;
        let now = test_clock().now().timestamp();
        h.explorer.receive(payment("p1", &address("alice"), 2_000_000, 100, now - 60));

        let (status, body) = call(&h.app, "POST", "/api/v1/monitor/check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["report"]["refunds_issued"], 1);
        assert_eq!(h.submitter.submission_count(), 1);

        let (_, body) = call(&h.app, "GET", "/api/v1/monitor/status", None).await;
        assert_eq!(body["processed_count"], 1);
        assert_eq!(body["last_seen_tx_hash"], FakeExplorer::hash("p1"));
        assert!(!h.monitor.is_running());
    }

    #[tokio::test]
    async fn test_manual_check_failure_maps_to_error_response() {
        let h = harness().await;
        h.explorer.fail_list(crate::error::ReconcileError::QuotaExceeded("402".to_string()));

        let (status, body) = call(&h.app, "POST", "/api/v1/monitor/check", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error_code"], "UPSTREAM_QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn test_deposit_registration_lookup_and_verify() {
        let h = harness().await;
        let alice = address("alice");

        let (status, body) = call(
            &h.app,
            "POST",
            "/api/v1/deposits",
            Some(json!({ "source_address": alice })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["required_amount"], 2_000_000);
        assert_eq!(body["verified"], false);

        let (status, _) = call(
            &h.app,
            "POST",
            "/api/v1/deposits",
            Some(json!({ "source_address": alice })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let now = test_clock().now().timestamp();
        h.explorer.receive(payment("v1", &alice, 2_000_000, 100, now - 30));

        let uri = format!("/api/v1/deposits/{}/verify", alice);
        let (status, body) = call(&h.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
        assert_eq!(body["tx_hash"], FakeExplorer::hash("v1"));

        let (status, body) = call(&h.app, "GET", &format!("/api/v1/deposits/{}", alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
    }

    #[tokio::test]
    async fn test_deposit_input_errors() {
        let h = harness().await;

        let (status, body) = call(
            &h.app,
            "POST",
            "/api/v1/deposits",
            Some(json!({ "source_address": "addr1short", "required_amount": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_INPUT");

        let malformed = format!("stake1{}", "x".repeat(60));
        let (status, body) = call(
            &h.app,
            "POST",
            "/api/v1/deposits",
            Some(json!({ "source_address": malformed })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_ADDRESS");

        let unknown = address("nobody");
        let (status, _) = call(&h.app, "GET", &format!("/api/v1/deposits/{}", unknown), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.app, "POST", &format!("/api/v1/deposits/{}/verify", unknown), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
