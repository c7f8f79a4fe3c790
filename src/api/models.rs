use crate::settlement::scheduler::JobStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

// ========== RESPONSE MODELS ==========

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub jobs: Vec<JobHealth>,
}

/// Whether a settlement job's last tick went through
#[derive(Debug, Serialize)]
pub struct JobHealth {
    pub job: String,
    pub healthy: bool,
    pub last_run: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<NamedJobStatus>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NamedJobStatus {
    pub job: String,
    #[serde(flatten)]
    pub status: JobStatus,
}
