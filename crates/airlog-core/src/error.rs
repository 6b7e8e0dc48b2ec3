//! Startup and shutdown failures of the pipeline as a whole.

use crate::sensor::InitError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("sensor initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}
