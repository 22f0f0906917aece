use std::sync::Arc;

use tracing::{debug, info, warn};
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::contract::{ManifestEntry, TransferResult};
use xacct_transfer_core::error::ServiceError;
use xacct_transfer_core::multipart::{plan_parts, select_strategy, CopyStrategy};

use crate::adapters::credentials::ScopedCredential;
use crate::adapters::object_store::{DestinationEncryption, ObjectLocation, ObjectStore};
use crate::retry::retry_throttled;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub source_bucket: String,
    pub destination_bucket: String,
    pub encryption: DestinationEncryption,
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub throttle: BackoffPolicy,
}

/// Copies one manifest entry from source to destination.
///
/// Never returns an error: every failure is folded into a `FAILED`
/// `TransferResult` carrying the error kind.
pub struct TransferExecutor {
    store: Arc<dyn ObjectStore>,
    settings: ExecutorSettings,
}

impl TransferExecutor {
    pub fn new(store: Arc<dyn ObjectStore>, settings: ExecutorSettings) -> Self {
        Self { store, settings }
    }

    pub async fn copy(
        &self,
        entry: &ManifestEntry,
        destination_key: &str,
        credential: &ScopedCredential,
    ) -> TransferResult {
        let source = ObjectLocation::new(&self.settings.source_bucket, &entry.key);
        let destination = ObjectLocation::new(&self.settings.destination_bucket, destination_key);
        let strategy = select_strategy(entry.size, self.settings.multipart_threshold);

        let outcome = match strategy {
            CopyStrategy::SingleCopy => self.single_copy(&source, &destination, credential).await,
            CopyStrategy::Multipart => {
                self.multipart_copy(entry.size, &source, &destination, credential)
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                debug!(
                    component = "transfer_executor",
                    event = "item_copied",
                    key = %entry.key,
                    destination_key,
                    bytes = entry.size,
                    strategy = ?strategy,
                    "object copied"
                );
                TransferResult::succeeded(&entry.key, destination_key, entry.size)
            }
            Err(error) => {
                warn!(
                    component = "transfer_executor",
                    event = "item_failed",
                    key = %entry.key,
                    destination_key,
                    error_kind = %error.kind,
                    strategy = ?strategy,
                    "{}",
                    error.message
                );
                TransferResult::failed(&entry.key, destination_key, &error)
            }
        }
    }

    async fn single_copy(
        &self,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        credential: &ScopedCredential,
    ) -> Result<(), ServiceError> {
        retry_throttled(&self.settings.throttle, "copy_object", || {
            self.store
                .copy_object(credential, source, destination, &self.settings.encryption)
        })
        .await
    }

    async fn multipart_copy(
        &self,
        size: u64,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        credential: &ScopedCredential,
    ) -> Result<(), ServiceError> {
        let parts = plan_parts(size, self.settings.part_size)?;
        let throttle = &self.settings.throttle;

        let upload_id = retry_throttled(throttle, "create_multipart_upload", || {
            self.store
                .create_multipart_upload(credential, destination, &self.settings.encryption)
        })
        .await?;

        info!(
            component = "transfer_executor",
            event = "multipart_started",
            key = %source.key,
            upload_id = %upload_id,
            parts = parts.len(),
            "multipart copy started"
        );

        let mut completed = Vec::with_capacity(parts.len());
        for part in &parts {
            let copied = retry_throttled(throttle, "upload_part_copy", || {
                self.store
                    .upload_part_copy(credential, source, destination, &upload_id, part)
            })
            .await;
            match copied {
                Ok(value) => completed.push(value),
                Err(error) => {
                    self.abort(credential, destination, &upload_id).await;
                    return Err(error);
                }
            }
        }

        let finished = retry_throttled(throttle, "complete_multipart_upload", || {
            self.store
                .complete_multipart_upload(credential, destination, &upload_id, &completed)
        })
        .await;
        if let Err(error) = finished {
            self.abort(credential, destination, &upload_id).await;
            return Err(error);
        }
        Ok(())
    }

    /// Best effort; a failed abort leaves an invisible incomplete upload.
    async fn abort(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
    ) {
        let aborted = retry_throttled(&self.settings.throttle, "abort_multipart_upload", || {
            self.store
                .abort_multipart_upload(credential, destination, upload_id)
        })
        .await;
        if let Err(error) = aborted {
            warn!(
                component = "transfer_executor",
                event = "multipart_abort_failed",
                key = %destination.key,
                upload_id,
                error_kind = %error.kind,
                "{}",
                error.message
            );
        }
    }
}
