use thiserror::Error;

/// Classified failures inside the execution pipeline.
///
/// `Generation` carries the last provider failure message verbatim; the
/// retry driver classifies rate-limit failures by inspecting it.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("{0}")]
    Generation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("persistence failure: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl ExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}
