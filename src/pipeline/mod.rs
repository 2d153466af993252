pub mod types;
pub mod noise_filter;
pub mod feature_cache;
pub mod router;
pub mod code_reader;
pub mod llm;
pub mod stages;
pub mod orchestrator;
pub mod worker; // Worker pool running independent runs
pub mod diagnostic; // Run audit dump (LOGPILOT_DUMP_DIR or [pipeline] dump_dir)

pub use orchestrator::{CancellationToken, PipelineConfig, PipelineOrchestrator};
pub use types::*;
pub use worker::{DiagnosisService, RunTicket, ServiceError};

use std::sync::Arc;

use thiserror::Error;

use feature_cache::ExtractionError;
use llm::EndpointError;
use stages::SchemaError;

/// Terminal and per-attempt pipeline failures.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("{stage} response failed schema validation: {error}")]
    SchemaValidation { stage: Stage, error: SchemaError },

    #[error("No available endpoint for {stage} stage")]
    NoAvailableEndpoint { stage: Stage },

    #[error("{stage} call to '{endpoint}' timed out after {secs}s")]
    EndpointTimeout {
        stage: Stage,
        endpoint: String,
        secs: u64,
    },

    #[error("{stage} call to '{endpoint}' failed: {error}")]
    Endpoint {
        stage: Stage,
        endpoint: String,
        error: EndpointError,
    },

    #[error("Manual feature extraction failed: {0}")]
    Extraction(Arc<ExtractionError>),

    #[error("{stage} stage aborted after {attempts} attempt(s): {last_error}")]
    StageAborted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    /// Stage the failure belongs to, when it is stage-specific.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::SchemaValidation { stage, .. }
            | Self::NoAvailableEndpoint { stage }
            | Self::EndpointTimeout { stage, .. }
            | Self::Endpoint { stage, .. }
            | Self::StageAborted { stage, .. } => Some(*stage),
            Self::Extraction(_) => Some(Stage::Manual),
            Self::Cancelled | Self::InvalidRequest(_) => None,
        }
    }
}
