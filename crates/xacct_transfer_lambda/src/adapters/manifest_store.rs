use async_trait::async_trait;
use xacct_transfer_core::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub version_id: Option<String>,
}

/// Durable, versioned store for manifests and reports.
///
/// Writes are encrypted with the store's configured key; callers never pass
/// key material.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<PutReceipt, ServiceError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError>;

    /// Externally meaningful address of `key`, e.g. `s3://bucket/key`.
    fn location(&self, key: &str) -> String;
}
