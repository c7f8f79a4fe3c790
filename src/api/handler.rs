use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::models::*;
use crate::{
    error::AppResult,
    execution::LedgerGateway,
    settlement::scheduler::JobStatuses,
    wallet::{main_wallet::MainWalletBalances, MainWallet},
};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<dyn LedgerGateway>,
    pub wallet: Arc<MainWallet>,
    pub jobs: JobStatuses,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let mut jobs: Vec<JobHealth> = state
        .jobs
        .read()
        .iter()
        .map(|(name, status)| JobHealth {
            job: name.to_string(),
            healthy: status.error.is_none(),
            last_run: status.last_run,
        })
        .collect();
    jobs.sort_by(|a, b| a.job.cmp(&b.job));

    let all_healthy = jobs.iter().all(|job| job.healthy);

    Ok(Json(HealthResponse {
        status: if all_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        timestamp: Utc::now(),
        jobs,
    }))
}

/// GET /api/v1/main-wallet - PRL and ETH balances of the funding wallet
pub async fn get_main_wallet(
    State(state): State<AppState>,
) -> AppResult<Json<MainWalletBalances>> {
    info!("Fetching main wallet balances");

    let balances = state.wallet.balances(state.gateway.as_ref()).await?;
    Ok(Json(balances))
}

/// GET /api/v1/jobs - last tick of every settlement job
pub async fn get_jobs(State(state): State<AppState>) -> AppResult<Json<JobsResponse>> {
    let mut jobs: Vec<NamedJobStatus> = state
        .jobs
        .read()
        .iter()
        .map(|(name, status)| NamedJobStatus {
            job: name.to_string(),
            status: status.clone(),
        })
        .collect();
    jobs.sort_by(|a, b| a.job.cmp(&b.job));

    Ok(Json(JobsResponse {
        jobs,
        timestamp: Utc::now(),
    }))
}
