use thiserror::Error;
use xacct_transfer_core::contract::ContractError;
use xacct_transfer_core::error::{ErrorKind, ServiceError};

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transfer worker pool closed: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Service(error) => error.kind,
            Self::Contract(_) | Self::Config(_) => ErrorKind::InvalidInput,
            Self::WorkerPool(_) => ErrorKind::ServiceFault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_source_error() {
        let denied = PipelineError::from(ServiceError::access_denied("list", "denied"));
        assert_eq!(denied.kind(), ErrorKind::AccessDenied);

        let contract = PipelineError::from(ContractError::EmptyExecutionId);
        assert_eq!(contract.kind(), ErrorKind::InvalidInput);
        assert_eq!(contract.to_string(), "execution_id cannot be empty");
    }
}
