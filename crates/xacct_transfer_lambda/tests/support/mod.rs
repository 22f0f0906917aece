#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use xacct_transfer_core::contract::StartPayload;
use xacct_transfer_core::error::ServiceError;
use xacct_transfer_core::multipart::PartRange;
use xacct_transfer_lambda::adapters::credentials::ScopedCredential;
use xacct_transfer_lambda::adapters::object_store::{
    CompletedPart, DestinationEncryption, ListPage, ObjectLocation, ObjectMetadata, ObjectStore,
};
use xacct_transfer_lambda::config::TransferConfig;
use xacct_transfer_lambda::handlers::orchestrator::{
    ExecutionOutcome, Orchestrator, PipelineDeps,
};
use xacct_transfer_lambda::test_support::{
    InMemoryManifestStore, InMemoryObjectStore, RecordingNotifier, StaticCredentialBroker,
    TEST_MANIFEST_BUCKET, TEST_SOURCE_BUCKET,
};

pub struct Pipeline {
    pub objects: Arc<InMemoryObjectStore>,
    pub manifests: Arc<InMemoryManifestStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub broker: Arc<StaticCredentialBroker>,
    store: Arc<dyn ObjectStore>,
}

impl Pipeline {
    pub fn new() -> Self {
        let objects = Arc::new(InMemoryObjectStore::new());
        Self {
            store: objects.clone(),
            objects,
            manifests: Arc::new(InMemoryManifestStore::new(TEST_MANIFEST_BUCKET)),
            notifier: Arc::new(RecordingNotifier::new()),
            broker: Arc::new(StaticCredentialBroker::new()),
        }
    }

    /// Routes the orchestrator through a store that hides the first
    /// `hidden` keys of every destination listing.
    pub fn with_lagging_listing(mut self, destination_bucket: &str, hidden: usize) -> Self {
        self.store = Arc::new(LaggingListing {
            inner: self.objects.clone(),
            bucket: destination_bucket.to_string(),
            hidden,
        });
        self
    }

    pub fn seed(&self, objects: &[(&str, u64)]) {
        for (key, size) in objects {
            self.objects.put_object(TEST_SOURCE_BUCKET, key, *size);
        }
    }

    pub fn orchestrator(&self, config: TransferConfig) -> Orchestrator {
        Orchestrator::new(
            config,
            PipelineDeps {
                broker: self.broker.clone(),
                objects: self.store.clone(),
                manifests: self.manifests.clone(),
                notifier: Some(self.notifier.clone()),
            },
        )
    }

    pub async fn run(&self, config: TransferConfig, execution_id: &str) -> ExecutionOutcome {
        self.orchestrator(config)
            .run(
                StartPayload {
                    execution_id: Some(execution_id.to_string()),
                    ..StartPayload::default()
                },
                CancellationToken::new(),
            )
            .await
            .expect("execution should run to a terminal state")
    }
}

/// Destination listing that lags behind completed writes.
struct LaggingListing {
    inner: Arc<InMemoryObjectStore>,
    bucket: String,
    hidden: usize,
}

#[async_trait]
impl ObjectStore for LaggingListing {
    async fn list_page(
        &self,
        credential: &ScopedCredential,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<ListPage, ServiceError> {
        let mut page = self.inner.list_page(credential, bucket, prefix, cursor).await?;
        if bucket == self.bucket && cursor.is_none() {
            let hidden = self.hidden.min(page.objects.len());
            page.objects.drain(..hidden);
        }
        Ok(page)
    }

    async fn head_object(
        &self,
        credential: &ScopedCredential,
        location: &ObjectLocation,
    ) -> Result<Option<ObjectMetadata>, ServiceError> {
        self.inner.head_object(credential, location).await
    }

    async fn copy_object(
        &self,
        credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<(), ServiceError> {
        self.inner
            .copy_object(credential, source, destination, encryption)
            .await
    }

    async fn create_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<String, ServiceError> {
        self.inner
            .create_multipart_upload(credential, destination, encryption)
            .await
    }

    async fn upload_part_copy(
        &self,
        credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        upload_id: &str,
        part: &PartRange,
    ) -> Result<CompletedPart, ServiceError> {
        self.inner
            .upload_part_copy(credential, source, destination, upload_id, part)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ServiceError> {
        self.inner
            .complete_multipart_upload(credential, destination, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
    ) -> Result<(), ServiceError> {
        self.inner
            .abort_multipart_upload(credential, destination, upload_id)
            .await
    }
}
