use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use super::models::*;
use crate::{
    deposit::{verification::is_valid_address, DepositVerificationService, VerificationResult},
    error::{AppError, AppResult},
    ledger::models::Deposit,
    monitor::{DepositMonitor, HealthReport, HealthStatus, MonitorStatus},
};

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<DepositMonitor>,
    pub verification: Arc<DepositVerificationService>,
}

// ========== HEALTH ==========

/// Liveness plus monitor health
/// GET /health
///
/// Degraded still answers 200 so load balancers keep routing; only unhealthy is 503.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.monitor.health_check();
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

// ========== MONITOR CONTROL ==========

/// GET /api/v1/monitor/status
pub async fn monitor_status(State(state): State<AppState>) -> Json<MonitorStatus> {
    Json(state.monitor.status())
}

/// POST /api/v1/monitor/start
pub async fn start_monitor(State(state): State<AppState>) -> Json<MonitorActionResponse> {
    let changed = state.monitor.start();
    Json(MonitorActionResponse {
        action: "start".to_string(),
        changed,
        is_running: state.monitor.is_running(),
    })
}

/// POST /api/v1/monitor/stop
pub async fn stop_monitor(State(state): State<AppState>) -> Json<MonitorActionResponse> {
    let changed = state.monitor.stop();
    Json(MonitorActionResponse {
        action: "stop".to_string(),
        changed,
        is_running: state.monitor.is_running(),
    })
}

/// Run one poll now and report what it did
/// POST /api/v1/monitor/check
pub async fn trigger_check(State(state): State<AppState>) -> AppResult<Json<CheckResponse>> {
    let outcome = state.monitor.trigger_manual_check().await;
    let response = CheckResponse::try_from(outcome)?;
    Ok(Json(response))
}

// ========== DEPOSITS ==========

/// POST /api/v1/deposits
pub async fn register_deposit(
    State(state): State<AppState>,
    Json(request): Json<RegisterDepositRequest>,
) -> AppResult<(StatusCode, Json<Deposit>)> {
    request
        .validate()
        .map_err(|e| AppError::InvalidInput(format_validation_errors(&e)))?;

    if !is_valid_address(&request.source_address) {
        warn!("Rejected deposit registration for malformed address {}", request.source_address);
        return Err(AppError::InvalidAddress(request.source_address));
    }

    let deposit = state
        .verification
        .register_deposit(&request.source_address, request.owner_id, request.required_amount)
        .await?;

    info!("Deposit registered via API: {}", deposit.source_address);
    Ok((StatusCode::CREATED, Json(deposit)))
}

/// GET /api/v1/deposits/:address
pub async fn get_deposit(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<Deposit>> {
    let deposit = state
        .verification
        .get_deposit(&address)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Deposit {}", address)))?;

    Ok(Json(deposit))
}

/// Scan recent transfers for one from this address
/// POST /api/v1/deposits/:address/verify
pub async fn verify_deposit(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<VerificationResult>> {
    if state.verification.get_deposit(&address).await?.is_none() {
        return Err(AppError::NotFound(format!("Deposit {}", address)));
    }

    let result = state.verification.verify_deposit(&address).await?;
    Ok(Json(result))
}
