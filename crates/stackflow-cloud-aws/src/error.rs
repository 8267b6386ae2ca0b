//! AWS provider error types

use stackflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("aws CLI not found. Please install the AWS CLI v2")]
    CliNotFound,

    /// Transport-level failure (throttling, connectivity). Retryable.
    #[error("AWS transport error: {0}")]
    Transport(String),

    /// Semantic API rejection. Not retryable.
    #[error("AWS API error: {0}")]
    Api(String),

    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("CloudFormation stack not found: {0}")]
    StackNotFound(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AwsError> for CloudError {
    fn from(e: AwsError) -> Self {
        match e {
            AwsError::Transport(m) => CloudError::Transient(m),
            AwsError::Io(e) => CloudError::Transient(e.to_string()),
            AwsError::InstanceNotFound { instance_id } => CloudError::NotFound(instance_id),
            AwsError::StackNotFound(name) => CloudError::NotFound(name),
            AwsError::Api(m) => CloudError::Rejected(m),
            AwsError::CliNotFound => {
                CloudError::Rejected("aws CLI not found. Please install the AWS CLI v2".into())
            }
            AwsError::Json(e) => CloudError::Json(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, AwsError>;
