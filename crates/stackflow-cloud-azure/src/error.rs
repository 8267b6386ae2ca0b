//! Azure provider error types

use stackflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AzureError {
    #[error("az CLI not found. Please install the Azure CLI")]
    CliNotFound,

    /// Transport-level failure (throttling, connectivity). Retryable.
    #[error("Azure transport error: {0}")]
    Transport(String),

    /// Semantic API rejection. Not retryable.
    #[error("Azure API error: {0}")]
    Api(String),

    /// Named artifact (deployment, VM, server, resource group) is gone.
    #[error("Azure resource not found: {0}")]
    NotFound(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AzureError> for CloudError {
    fn from(e: AzureError) -> Self {
        match e {
            AzureError::Transport(m) => CloudError::Transient(m),
            AzureError::Io(e) => CloudError::Transient(e.to_string()),
            AzureError::NotFound(name) => CloudError::NotFound(name),
            AzureError::Api(m) => CloudError::Rejected(m),
            AzureError::CliNotFound => {
                CloudError::Rejected("az CLI not found. Please install the Azure CLI".into())
            }
            AzureError::Json(e) => CloudError::Json(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, AzureError>;
