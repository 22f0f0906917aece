use async_trait::async_trait;
use xacct_transfer_core::error::ServiceError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, subject: &str, message: &str) -> Result<(), ServiceError>;
}
