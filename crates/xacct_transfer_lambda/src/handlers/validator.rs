use std::sync::Arc;

use tracing::{info, warn};
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::contract::{Manifest, Mismatch, MismatchReason, ValidationResult};
use xacct_transfer_core::sampling::sample_indices;

use crate::adapters::credentials::ScopedCredential;
use crate::adapters::object_store::{ObjectLocation, ObjectMetadata, ObjectStore};
use crate::error::PipelineError;
use crate::retry::retry_throttled;

/// Post-transfer check: destination count plus a random size sample.
///
/// Reads only. The destination count is taken from a fresh listing, so
/// anything already under the destination prefix is counted too.
pub struct Validator {
    objects: Arc<dyn ObjectStore>,
    sample_size: usize,
    throttle: BackoffPolicy,
}

impl Validator {
    pub fn new(objects: Arc<dyn ObjectStore>, sample_size: usize, throttle: BackoffPolicy) -> Self {
        Self {
            objects,
            sample_size,
            throttle,
        }
    }

    /// `source_credential` reads the source side of each sample,
    /// `destination_credential` lists and reads the destination.
    pub async fn validate(
        &self,
        manifest: &Manifest,
        source_credential: &ScopedCredential,
        destination_credential: &ScopedCredential,
    ) -> Result<ValidationResult, PipelineError> {
        let found_count = self
            .count_destination(manifest, destination_credential)
            .await?;

        let indices = {
            let mut rng = rand::thread_rng();
            sample_indices(manifest.entries.len(), self.sample_size, &mut rng)
        };

        let mut mismatches = Vec::new();
        for index in &indices {
            let entry = &manifest.entries[*index];
            let source = ObjectLocation::new(&manifest.source_bucket, &entry.key);
            let destination = ObjectLocation::new(
                &manifest.destination_bucket,
                manifest.destination_key_for(entry),
            );

            if let Some(mismatch) = self
                .compare(&source, &destination, source_credential, destination_credential)
                .await
            {
                warn!(
                    component = "validator",
                    event = "sample_mismatch",
                    execution_id = %manifest.execution_id,
                    key = %entry.key,
                    reason = ?mismatch.reason,
                    "sampled object does not match"
                );
                mismatches.push(mismatch);
            }
        }

        let result = ValidationResult::evaluate(
            manifest.total_objects,
            found_count,
            indices.len() as u64,
            mismatches,
            &manifest.destination_prefix,
        );

        info!(
            component = "validator",
            event = "validation_complete",
            execution_id = %manifest.execution_id,
            status = result.status.as_str(),
            expected = result.expected_count,
            found = result.found_count,
            samples_checked = result.samples_checked,
            samples_passed = result.samples_passed,
            "validation finished"
        );
        Ok(result)
    }

    async fn count_destination(
        &self,
        manifest: &Manifest,
        credential: &ScopedCredential,
    ) -> Result<u64, PipelineError> {
        let mut found = 0u64;
        let mut cursor: Option<String> = None;
        loop {
            let page = retry_throttled(&self.throttle, "list_objects", || {
                self.objects.list_page(
                    credential,
                    &manifest.destination_bucket,
                    &manifest.destination_prefix,
                    cursor.as_deref(),
                )
            })
            .await?;
            found += page.objects.len() as u64;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(found),
            }
        }
    }

    async fn compare(
        &self,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        source_credential: &ScopedCredential,
        destination_credential: &ScopedCredential,
    ) -> Option<Mismatch> {
        let source_meta = match self.head(source_credential, source).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                return Some(head_failed(source, "source object no longer exists".to_string()));
            }
            Err(message) => return Some(head_failed(source, message)),
        };

        let destination_meta = match self.head(destination_credential, destination).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                return Some(Mismatch {
                    key: destination.key.clone(),
                    reason: MismatchReason::MissingDestination,
                    expected_size: Some(source_meta.size),
                    actual_size: None,
                    detail: None,
                });
            }
            Err(message) => return Some(head_failed(destination, message)),
        };

        (source_meta.size != destination_meta.size).then(|| Mismatch {
            key: destination.key.clone(),
            reason: MismatchReason::SizeMismatch,
            expected_size: Some(source_meta.size),
            actual_size: Some(destination_meta.size),
            detail: None,
        })
    }

    async fn head(
        &self,
        credential: &ScopedCredential,
        location: &ObjectLocation,
    ) -> Result<Option<ObjectMetadata>, String> {
        retry_throttled(&self.throttle, "head_object", || {
            self.objects.head_object(credential, location)
        })
        .await
        .map_err(|error| error.to_string())
    }
}

fn head_failed(location: &ObjectLocation, detail: String) -> Mismatch {
    Mismatch {
        key: location.key.clone(),
        reason: MismatchReason::HeadFailed,
        expected_size: None,
        actual_size: None,
        detail: Some(detail),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use xacct_transfer_core::contract::{ManifestEntry, StartRequest, VerificationStatus};
    use xacct_transfer_core::error::ErrorKind;

    use super::*;
    use crate::test_support::{test_credential, FaultRule, InMemoryObjectStore, StoreOperation};

    fn manifest(sizes: &[u64]) -> Manifest {
        let request = StartRequest {
            execution_id: "exec-validate".to_string(),
            source_prefix: "in/".to_string(),
            destination_prefix: "out/".to_string(),
        };
        let entries = sizes
            .iter()
            .enumerate()
            .map(|(index, size)| ManifestEntry::new(format!("in/{index:05}"), *size))
            .collect();
        Manifest::new(&request, "src", "dst", entries, Utc::now())
    }

    fn mirrored_store(manifest: &Manifest) -> Arc<InMemoryObjectStore> {
        let store = Arc::new(InMemoryObjectStore::new().with_page_size(7));
        for entry in &manifest.entries {
            store.put_object("src", &entry.key, entry.size);
            store.put_object("dst", &manifest.destination_key_for(entry), entry.size);
        }
        store
    }

    fn validator(store: Arc<InMemoryObjectStore>) -> Validator {
        Validator::new(store, 10, BackoffPolicy::throttle())
    }

    #[tokio::test(start_paused = true)]
    async fn passes_when_destination_mirrors_manifest() {
        let manifest = manifest(&[10, 20, 30]);
        let store = mirrored_store(&manifest);

        let result = validator(store.clone())
            .validate(&manifest, &test_credential(), &test_credential())
            .await
            .expect("validation should run");

        assert_eq!(result.status, VerificationStatus::Passed);
        assert_eq!(result.expected_count, 3);
        assert_eq!(result.found_count, 3);
        assert_eq!(result.samples_checked, 3);
        assert_eq!(store.calls(StoreOperation::Head), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_at_most_ten_distinct_objects() {
        let sizes: Vec<u64> = (1..=500).collect();
        let manifest = manifest(&sizes);
        let store = mirrored_store(&manifest);

        let result = validator(store.clone())
            .validate(&manifest, &test_credential(), &test_credential())
            .await
            .expect("validation should run");

        assert_eq!(result.samples_checked, 10);
        let headed = store.headed_keys("dst");
        assert_eq!(headed.len(), 10);
        let mut unique = headed.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_destination_object_fails_count_and_sample() {
        let manifest = manifest(&[10]);
        let store = Arc::new(InMemoryObjectStore::new());
        store.put_object("src", "in/00000", 10);

        let result = validator(store)
            .validate(&manifest, &test_credential(), &test_credential())
            .await
            .expect("validation should run");

        assert_eq!(result.status, VerificationStatus::Failed);
        assert_eq!(result.found_count, 0);
        let reasons: Vec<MismatchReason> =
            result.mismatch_details.iter().map(|mismatch| mismatch.reason).collect();
        assert_eq!(
            reasons,
            vec![MismatchReason::CountMismatch, MismatchReason::MissingDestination]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn size_drift_is_reported() {
        let manifest = manifest(&[10, 20]);
        let store = mirrored_store(&manifest);
        store.put_object("dst", "out/00001", 19);

        let result = validator(store)
            .validate(&manifest, &test_credential(), &test_credential())
            .await
            .expect("validation should run");

        assert_eq!(result.status, VerificationStatus::Failed);
        assert_eq!(result.mismatches, vec!["out/00001".to_string()]);
        assert_eq!(result.mismatch_details[0].reason, MismatchReason::SizeMismatch);
        assert_eq!(result.mismatch_details[0].actual_size, Some(19));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_manifest_and_destination_passes() {
        let manifest = manifest(&[]);
        let store = Arc::new(InMemoryObjectStore::new());

        let result = validator(store)
            .validate(&manifest, &test_credential(), &test_credential())
            .await
            .expect("validation should run");

        assert_eq!(result.status, VerificationStatus::Passed);
        assert_eq!(result.samples_checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failure_is_a_stage_error() {
        let manifest = manifest(&[10]);
        let store = mirrored_store(&manifest);
        store.inject(FaultRule::always(StoreOperation::List, ErrorKind::ServiceFault));

        let error = validator(store)
            .validate(&manifest, &test_credential(), &test_credential())
            .await
            .expect_err("listing failure should surface");
        assert_eq!(error.kind(), ErrorKind::ServiceFault);
    }
}
