//! In-memory fakes for every port plus shared fixtures.
//!
//! Used by unit tests here and by the `tests/` scenarios. The fakes keep
//! call counters and accept scripted faults so retry and concurrency
//! behavior can be asserted without AWS.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::contract::TerminalPolicy;
use xacct_transfer_core::error::{ErrorKind, ServiceError};
use xacct_transfer_core::multipart::{PartRange, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE};
use xacct_transfer_core::storage_keys::s3_uri;

use crate::adapters::credentials::{AssumeRoleRequest, CredentialBroker, ScopedCredential};
use crate::adapters::manifest_store::{ManifestStore, PutReceipt};
use crate::adapters::notifier::Notifier;
use crate::adapters::object_store::{
    CompletedPart, DestinationEncryption, ListPage, ObjectLocation, ObjectMetadata, ObjectStore,
    ObjectSummary,
};
use crate::config::TransferConfig;

pub const TEST_SOURCE_BUCKET: &str = "source-bucket";
pub const TEST_DESTINATION_BUCKET: &str = "destination-bucket";
pub const TEST_MANIFEST_BUCKET: &str = "hub-bucket";
pub const TEST_EXTERNAL_ID: &str = "shared-token";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Config pointing at the `TEST_*` buckets with production retry policies.
///
/// Prefixes are `in/` and `out/`. Pair with `start_paused` tokio tests so
/// backoff sleeps complete instantly.
pub fn test_config() -> TransferConfig {
    TransferConfig {
        source_role_arn: "arn:aws:iam::111111111111:role/source-read".to_string(),
        destination_role_arn: "arn:aws:iam::222222222222:role/destination-write".to_string(),
        external_id: TEST_EXTERNAL_ID.to_string(),
        source_bucket: TEST_SOURCE_BUCKET.to_string(),
        source_prefix: "in/".to_string(),
        destination_bucket: TEST_DESTINATION_BUCKET.to_string(),
        destination_prefix: "out/".to_string(),
        manifest_bucket: TEST_MANIFEST_BUCKET.to_string(),
        manifest_kms_key_id: None,
        source_kms_key_id: None,
        destination_kms_key_id: Some("alias/destination".to_string()),
        max_concurrency: 40,
        multipart_threshold_bytes: DEFAULT_MULTIPART_THRESHOLD,
        multipart_part_size_bytes: DEFAULT_PART_SIZE,
        throttle_retry: BackoffPolicy::throttle(),
        stage_retry: BackoffPolicy::stage(),
        item_timeout: Duration::from_secs(900),
        transfer_stage_timeout: None,
        validation_sample_size: 10,
        credential_duration: Duration::from_secs(3600),
        credential_refresh_margin: Duration::from_secs(300),
        sns_topic_arn: None,
        terminal_policy: TerminalPolicy::default(),
    }
}

pub fn test_credential() -> ScopedCredential {
    let issued_at = Utc::now();
    ScopedCredential {
        role_ref: "arn:aws:iam::000000000000:role/test".to_string(),
        access_key_id: "ASIATESTKEY".to_string(),
        secret_access_key: "test-secret".to_string(),
        session_token: "test-session".to_string(),
        issued_at,
        expires_at: issued_at + chrono::Duration::hours(1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    List,
    Head,
    Copy,
    CreateMultipart,
    UploadPartCopy,
    CompleteMultipart,
    AbortMultipart,
}

/// Scripted failure for one store operation.
#[derive(Debug, Clone)]
pub struct FaultRule {
    operation: StoreOperation,
    kind: ErrorKind,
    key_contains: Option<String>,
    skip: u32,
    remaining: Option<u32>,
}

impl FaultRule {
    /// Fails every matching call.
    pub fn always(operation: StoreOperation, kind: ErrorKind) -> Self {
        Self {
            operation,
            kind,
            key_contains: None,
            skip: 0,
            remaining: None,
        }
    }

    /// Fails the first `count` matching calls.
    pub fn times(operation: StoreOperation, kind: ErrorKind, count: u32) -> Self {
        Self {
            remaining: Some(count),
            ..Self::always(operation, kind)
        }
    }

    /// Lets `count` matching calls through before the rule starts firing.
    pub fn after_successes(mut self, count: u32) -> Self {
        self.skip = count;
        self
    }

    /// Restricts the rule to keys containing `fragment`.
    pub fn for_key(mut self, fragment: impl Into<String>) -> Self {
        self.key_contains = Some(fragment.into());
        self
    }

    fn matches(&self, operation: StoreOperation, key: &str) -> bool {
        self.operation == operation
            && self
                .key_contains
                .as_deref()
                .map_or(true, |fragment| key.contains(fragment))
    }

    /// Returns whether this call should fail, consuming budget.
    fn fire(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        match self.remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    size: u64,
    kms_key_id: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingUpload {
    location: ObjectLocation,
    kms_key_id: Option<String>,
    parts: BTreeMap<u32, u64>,
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ObjectLocation, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    faults: Vec<FaultRule>,
    calls: HashMap<StoreOperation, usize>,
    headed: Vec<ObjectLocation>,
}

/// Object store backed by a sorted map.
///
/// Listing returns keys in lexicographic order with the last returned key as
/// the cursor.
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
    page_size: usize,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            page_size: 1000,
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay applied to every copy directive (single or part).
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn put_object(&self, bucket: &str, key: &str, size: u64) {
        lock(&self.state).objects.insert(
            ObjectLocation::new(bucket, key),
            StoredObject {
                size,
                kms_key_id: None,
            },
        );
    }

    pub fn object_size(&self, bucket: &str, key: &str) -> Option<u64> {
        lock(&self.state)
            .objects
            .get(&ObjectLocation::new(bucket, key))
            .map(|object| object.size)
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .objects
            .keys()
            .filter(|location| location.bucket == bucket)
            .map(|location| location.key.clone())
            .collect()
    }

    pub fn last_encryption(&self, bucket: &str, key: &str) -> Option<String> {
        lock(&self.state)
            .objects
            .get(&ObjectLocation::new(bucket, key))
            .and_then(|object| object.kms_key_id.clone())
    }

    pub fn inject(&self, rule: FaultRule) {
        lock(&self.state).faults.push(rule);
    }

    pub fn calls(&self, operation: StoreOperation) -> usize {
        lock(&self.state)
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn pending_uploads(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    /// Keys headed in `bucket`, in call order.
    pub fn headed_keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .headed
            .iter()
            .filter(|location| location.bucket == bucket)
            .map(|location| location.key.clone())
            .collect()
    }

    /// Highest number of copy directives observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record_call(&self, operation: StoreOperation, key: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        *state.calls.entry(operation).or_insert(0) += 1;
        let fired = state
            .faults
            .iter_mut()
            .filter(|rule| rule.matches(operation, key))
            .find_map(|rule| rule.fire().then_some(rule.kind));
        match fired {
            Some(kind) => Err(ServiceError::new(
                kind,
                format!("{operation:?}"),
                format!("injected {kind} for {key}"),
            )),
            None => Ok(()),
        }
    }

    async fn simulate_copy_latency(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn source_size(&self, source: &ObjectLocation) -> Result<u64, ServiceError> {
        lock(&self.state)
            .objects
            .get(source)
            .map(|object| object.size)
            .ok_or_else(|| {
                ServiceError::new(
                    ErrorKind::InvalidInput,
                    "copy_object",
                    format!("NoSuchKey: {}", s3_uri(&source.bucket, &source.key)),
                )
            })
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_page(
        &self,
        _credential: &ScopedCredential,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<ListPage, ServiceError> {
        self.record_call(StoreOperation::List, prefix)?;
        let state = lock(&self.state);
        let mut matching = state
            .objects
            .iter()
            .filter(|(location, _)| location.bucket == bucket && location.key.starts_with(prefix))
            .filter(|(location, _)| cursor.map_or(true, |after| location.key.as_str() > after));

        let objects: Vec<ObjectSummary> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(location, object)| ObjectSummary {
                key: location.key.clone(),
                size: object.size,
                etag: Some(format!("\"etag-{}\"", object.size)),
            })
            .collect();
        let has_more = matching.next().is_some();

        Ok(ListPage {
            next_cursor: if has_more {
                objects.last().map(|object| object.key.clone())
            } else {
                None
            },
            objects,
        })
    }

    async fn head_object(
        &self,
        _credential: &ScopedCredential,
        location: &ObjectLocation,
    ) -> Result<Option<ObjectMetadata>, ServiceError> {
        self.record_call(StoreOperation::Head, &location.key)?;
        let mut state = lock(&self.state);
        state.headed.push(location.clone());
        Ok(state.objects.get(location).map(|object| ObjectMetadata {
            size: object.size,
            etag: None,
        }))
    }

    async fn copy_object(
        &self,
        _credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<(), ServiceError> {
        self.record_call(StoreOperation::Copy, &source.key)?;
        self.simulate_copy_latency().await;
        let size = self.source_size(source)?;
        lock(&self.state).objects.insert(
            destination.clone(),
            StoredObject {
                size,
                kms_key_id: encryption.kms_key_id.clone(),
            },
        );
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        _credential: &ScopedCredential,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<String, ServiceError> {
        self.record_call(StoreOperation::CreateMultipart, &destination.key)?;
        let mut state = lock(&self.state);
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                location: destination.clone(),
                kms_key_id: encryption.kms_key_id.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part_copy(
        &self,
        _credential: &ScopedCredential,
        source: &ObjectLocation,
        _destination: &ObjectLocation,
        upload_id: &str,
        part: &PartRange,
    ) -> Result<CompletedPart, ServiceError> {
        self.record_call(StoreOperation::UploadPartCopy, &source.key)?;
        self.simulate_copy_latency().await;
        let size = self.source_size(source)?;
        if part.end_inclusive >= size {
            return Err(ServiceError::new(
                ErrorKind::InvalidInput,
                "upload_part_copy",
                format!("InvalidRange: {} beyond {size}", part.http_range()),
            ));
        }

        let mut state = lock(&self.state);
        let upload = state.uploads.get_mut(upload_id).ok_or_else(|| {
            ServiceError::new(ErrorKind::InvalidInput, "upload_part_copy", "NoSuchUpload")
        })?;
        upload.parts.insert(part.part_number, part.byte_len());
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: format!("\"part-{}\"", part.part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        _credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ServiceError> {
        self.record_call(StoreOperation::CompleteMultipart, &destination.key)?;
        let mut state = lock(&self.state);
        let upload = state.uploads.remove(upload_id).ok_or_else(|| {
            ServiceError::new(ErrorKind::InvalidInput, "complete_multipart_upload", "NoSuchUpload")
        })?;

        let listed: BTreeSet<u32> = parts.iter().map(|part| part.part_number).collect();
        let uploaded: BTreeSet<u32> = upload.parts.keys().copied().collect();
        if listed != uploaded {
            return Err(ServiceError::new(
                ErrorKind::InvalidInput,
                "complete_multipart_upload",
                "InvalidPart: completed part list does not match uploaded parts",
            ));
        }

        let size = upload.parts.values().sum();
        state.objects.insert(
            upload.location,
            StoredObject {
                size,
                kms_key_id: upload.kms_key_id,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
    ) -> Result<(), ServiceError> {
        self.record_call(StoreOperation::AbortMultipart, &destination.key)?;
        lock(&self.state).uploads.remove(upload_id);
        Ok(())
    }
}

#[derive(Default)]
struct ManifestState {
    versions: HashMap<String, Vec<Vec<u8>>>,
    failing_puts: Option<(ErrorKind, u32)>,
    failing_gets: Option<(ErrorKind, u32)>,
}

/// Versioned in-memory manifest/report store.
pub struct InMemoryManifestStore {
    bucket: String,
    state: Mutex<ManifestState>,
}

impl InMemoryManifestStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::new(ManifestState::default()),
        }
    }

    /// Fails the next `count` puts with `kind`.
    pub fn fail_puts(&self, kind: ErrorKind, count: u32) {
        lock(&self.state).failing_puts = Some((kind, count));
    }

    /// Fails the next `count` gets with `kind`.
    pub fn fail_gets(&self, kind: ErrorKind, count: u32) {
        lock(&self.state).failing_gets = Some((kind, count));
    }

    /// Successful writes to `key`.
    pub fn put_count(&self, key: &str) -> usize {
        lock(&self.state).versions.get(key).map_or(0, Vec::len)
    }

    pub fn latest(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .versions
            .get(key)
            .and_then(|versions| versions.last().cloned())
    }
}

fn take_failure(slot: &mut Option<(ErrorKind, u32)>) -> Option<ErrorKind> {
    match slot {
        Some((kind, left)) if *left > 0 => {
            *left -= 1;
            Some(*kind)
        }
        _ => None,
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<PutReceipt, ServiceError> {
        let mut state = lock(&self.state);
        if let Some(kind) = take_failure(&mut state.failing_puts) {
            return Err(ServiceError::new(kind, "put_object", format!("injected {kind}")));
        }
        let versions = state.versions.entry(key.to_string()).or_default();
        versions.push(body);
        Ok(PutReceipt {
            key: key.to_string(),
            version_id: Some(format!("v{}", versions.len())),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let mut state = lock(&self.state);
        if let Some(kind) = take_failure(&mut state.failing_gets) {
            return Err(ServiceError::new(kind, "get_object", format!("injected {kind}")));
        }
        state
            .versions
            .get(key)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| {
                ServiceError::new(
                    ErrorKind::InvalidInput,
                    "get_object",
                    format!("NoSuchKey: {key}"),
                )
            })
    }

    fn location(&self, key: &str) -> String {
        s3_uri(&self.bucket, key)
    }
}

/// Notifier that records `(subject, message)` pairs.
pub struct RecordingNotifier {
    published: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Every publish fails with `ServiceFault`.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, subject: &str, message: &str) -> Result<(), ServiceError> {
        if self.fail {
            return Err(ServiceError::service_fault("publish", "topic unavailable"));
        }
        lock(&self.published).push((subject.to_string(), message.to_string()));
        Ok(())
    }
}

/// Broker that mints credentials locally and refuses denied roles or
/// requests with the wrong external token.
pub struct StaticCredentialBroker {
    expected_token: String,
    lifetime: chrono::Duration,
    denied_roles: Mutex<BTreeSet<String>>,
    requests: Mutex<Vec<AssumeRoleRequest>>,
}

impl Default for StaticCredentialBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticCredentialBroker {
    pub fn new() -> Self {
        Self {
            expected_token: TEST_EXTERNAL_ID.to_string(),
            lifetime: chrono::Duration::hours(1),
            denied_roles: Mutex::new(BTreeSet::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn deny_role(&self, role_ref: &str) {
        lock(&self.denied_roles).insert(role_ref.to_string());
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn session_names(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|request| request.session_name.clone())
            .collect()
    }
}

#[async_trait]
impl CredentialBroker for StaticCredentialBroker {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<ScopedCredential, ServiceError> {
        lock(&self.requests).push(request.clone());
        if request.external_token != self.expected_token {
            return Err(ServiceError::access_denied(
                "assume_role",
                "external token does not match trust policy",
            ));
        }
        if lock(&self.denied_roles).contains(&request.role_ref) {
            return Err(ServiceError::access_denied(
                "assume_role",
                format!("not authorized to assume {}", request.role_ref),
            ));
        }

        let issued_at = Utc::now();
        Ok(ScopedCredential {
            role_ref: request.role_ref.clone(),
            access_key_id: format!("ASIA{:04}", self.calls()),
            secret_access_key: "minted-secret".to_string(),
            session_token: "minted-session".to_string(),
            issued_at,
            expires_at: issued_at + self.lifetime,
        })
    }
}
