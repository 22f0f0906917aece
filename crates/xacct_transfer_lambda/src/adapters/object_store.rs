use async_trait::async_trait;
use xacct_transfer_core::error::ServiceError;
use xacct_transfer_core::multipart::PartRange;

use crate::adapters::credentials::ScopedCredential;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Opaque cursor for the next page; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Server-side encryption applied to objects written at the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationEncryption {
    pub kms_key_id: Option<String>,
}

/// Object storage operations used by the lister, executor and validator.
///
/// Every call carries the scoped credential it must run under; the store
/// itself holds no identity.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_page(
        &self,
        credential: &ScopedCredential,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<ListPage, ServiceError>;

    /// `Ok(None)` when the object does not exist.
    async fn head_object(
        &self,
        credential: &ScopedCredential,
        location: &ObjectLocation,
    ) -> Result<Option<ObjectMetadata>, ServiceError>;

    async fn copy_object(
        &self,
        credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<(), ServiceError>;

    /// Returns the upload id.
    async fn create_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<String, ServiceError>;

    async fn upload_part_copy(
        &self,
        credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        upload_id: &str,
        part: &PartRange,
    ) -> Result<CompletedPart, ServiceError>;

    async fn complete_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ServiceError>;

    async fn abort_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
    ) -> Result<(), ServiceError>;
}
