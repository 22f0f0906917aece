use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::contract::{sha256_hex, Manifest, ManifestEntry, StartRequest};
use xacct_transfer_core::storage_keys::manifest_object_key;

use crate::adapters::credentials::ScopedCredential;
use crate::adapters::manifest_store::ManifestStore;
use crate::adapters::object_store::ObjectStore;
use crate::error::PipelineError;
use crate::retry::retry_throttled;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSummary {
    pub manifest_key: String,
    pub manifest_location: String,
    pub manifest_sha256: String,
    pub total_count: u64,
    pub total_bytes: u64,
}

/// Enumerates the source prefix and persists the manifest.
pub struct Lister {
    objects: Arc<dyn ObjectStore>,
    manifests: Arc<dyn ManifestStore>,
    source_bucket: String,
    destination_bucket: String,
    throttle: BackoffPolicy,
}

impl Lister {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        manifests: Arc<dyn ManifestStore>,
        source_bucket: impl Into<String>,
        destination_bucket: impl Into<String>,
        throttle: BackoffPolicy,
    ) -> Self {
        Self {
            objects,
            manifests,
            source_bucket: source_bucket.into(),
            destination_bucket: destination_bucket.into(),
            throttle,
        }
    }

    /// Pages through the source prefix in cursor order and writes one manifest.
    ///
    /// Any page failure that survives throttle retry aborts the listing; a
    /// partial manifest is never written.
    pub async fn list(
        &self,
        request: &StartRequest,
        credential: &ScopedCredential,
    ) -> Result<ListingSummary, PipelineError> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u64;

        loop {
            let page = retry_throttled(&self.throttle, "list_objects", || {
                self.objects.list_page(
                    credential,
                    &self.source_bucket,
                    &request.source_prefix,
                    cursor.as_deref(),
                )
            })
            .await?;
            pages += 1;

            entries.extend(page.objects.into_iter().map(|object| ManifestEntry {
                key: object.key,
                size: object.size,
                etag: object.etag,
            }));

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let manifest = Manifest::new(
            request,
            &self.source_bucket,
            &self.destination_bucket,
            entries,
            Utc::now(),
        );
        let body = manifest.encode()?;
        let manifest_sha256 = sha256_hex(&body);
        let manifest_key = manifest_object_key(&request.execution_id);

        let receipt = self.manifests.put(&manifest_key, body).await?;

        info!(
            component = "lister",
            event = "manifest_written",
            execution_id = %request.execution_id,
            manifest_key = %receipt.key,
            version_id = receipt.version_id.as_deref().unwrap_or("-"),
            pages,
            total_count = manifest.total_objects,
            total_bytes = manifest.total_size_bytes,
            "source listing complete"
        );

        Ok(ListingSummary {
            manifest_location: self.manifests.location(&manifest_key),
            manifest_key,
            manifest_sha256,
            total_count: manifest.total_objects,
            total_bytes: manifest.total_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use xacct_transfer_core::error::ErrorKind;

    use super::*;
    use crate::test_support::{
        test_credential, FaultRule, InMemoryManifestStore, InMemoryObjectStore, StoreOperation,
    };

    fn request(prefix: &str) -> StartRequest {
        StartRequest {
            execution_id: "exec-list-1".to_string(),
            source_prefix: prefix.to_string(),
            destination_prefix: "out/".to_string(),
        }
    }

    fn lister(
        objects: Arc<InMemoryObjectStore>,
        manifests: Arc<InMemoryManifestStore>,
    ) -> Lister {
        Lister::new(objects, manifests, "src", "dst", BackoffPolicy::throttle())
    }

    #[tokio::test(start_paused = true)]
    async fn walks_every_page_and_persists_manifest() {
        let objects = Arc::new(InMemoryObjectStore::new().with_page_size(2));
        for (key, size) in [("in/a", 1), ("in/b", 2), ("in/c", 3), ("in/d", 4), ("in/e", 5)] {
            objects.put_object("src", key, size);
        }
        objects.put_object("src", "other/x", 100);
        let manifests = Arc::new(InMemoryManifestStore::new("hub"));

        let summary = lister(objects.clone(), manifests.clone())
            .list(&request("in/"), &test_credential())
            .await
            .expect("listing should pass");

        assert_eq!(summary.total_count, 5);
        assert_eq!(summary.total_bytes, 15);
        assert_eq!(summary.manifest_key, "manifests/exec-list-1/manifest.json");
        assert_eq!(
            summary.manifest_location,
            "s3://hub/manifests/exec-list-1/manifest.json"
        );
        assert_eq!(objects.calls(StoreOperation::List), 3);

        let stored = manifests
            .latest(&summary.manifest_key)
            .expect("manifest should be stored");
        assert_eq!(sha256_hex(&stored), summary.manifest_sha256);
        let manifest = Manifest::decode(&stored).expect("manifest should decode");
        let keys: Vec<&str> = manifest.entries.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["in/a", "in/b", "in/c", "in/d", "in/e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_prefix_yields_empty_manifest() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let manifests = Arc::new(InMemoryManifestStore::new("hub"));

        let summary = lister(objects, manifests.clone())
            .list(&request("nothing/"), &test_credential())
            .await
            .expect("listing should pass");

        assert_eq!(summary.total_count, 0);
        assert_eq!(summary.total_bytes, 0);
        assert_eq!(manifests.put_count(&summary.manifest_key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_failure_writes_no_manifest() {
        let objects = Arc::new(InMemoryObjectStore::new().with_page_size(1));
        objects.put_object("src", "in/a", 1);
        objects.put_object("src", "in/b", 1);
        objects.inject(
            FaultRule::always(StoreOperation::List, ErrorKind::AccessDenied).after_successes(1),
        );
        let manifests = Arc::new(InMemoryManifestStore::new("hub"));

        let error = lister(objects, manifests.clone())
            .list(&request("in/"), &test_credential())
            .await
            .expect_err("listing should fail");

        assert_eq!(error.kind(), ErrorKind::AccessDenied);
        assert_eq!(manifests.put_count("manifests/exec-list-1/manifest.json"), 0);
    }
}
