//! Sequential stage machine for one transfer execution.
//!
//! `Listing -> Transferring -> Validating -> Reporting -> {Succeeded|Failed}`,
//! with any live stage able to abort to `Failed`. The transfer stage fans out
//! over the manifest with at most `max_concurrency` items in flight; results
//! are only merged at the join point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::contract::{
    normalize_start, ExecutionState, Manifest, ManifestEntry, NotificationMessage, Report,
    ReportContext, StartPayload, StartRequest, TransferResult, TransferTally, ValidationResult,
    VerificationStatus,
};
use xacct_transfer_core::error::{ErrorKind, ServiceError};
use xacct_transfer_core::storage_keys::s3_uri;

use crate::adapters::credentials::{
    session_name, AssumeRoleRequest, CredentialBroker, CredentialLease,
};
use crate::adapters::manifest_store::ManifestStore;
use crate::adapters::notifier::Notifier;
use crate::adapters::object_store::{DestinationEncryption, ObjectStore};
use crate::config::TransferConfig;
use crate::error::PipelineError;
use crate::handlers::executor::{ExecutorSettings, TransferExecutor};
use crate::handlers::lister::{Lister, ListingSummary};
use crate::handlers::reporter::Reporter;
use crate::handlers::validator::Validator;
use crate::retry::{retry_stage, retry_with};

/// External capabilities the pipeline runs against.
#[derive(Clone)]
pub struct PipelineDeps {
    pub broker: Arc<dyn CredentialBroker>,
    pub objects: Arc<dyn ObjectStore>,
    pub manifests: Arc<dyn ManifestStore>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TransferStats {
    pub issued: u64,
    pub peak_in_flight: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub state: ExecutionState,
    pub history: Vec<ExecutionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_status: Option<VerificationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub report: Option<Report>,
}

pub struct Orchestrator {
    config: Arc<TransferConfig>,
    deps: PipelineDeps,
    lister: Lister,
    executor: Arc<TransferExecutor>,
    validator: Validator,
    reporter: Reporter,
}

struct TransferBatch {
    tally: TransferTally,
    stats: TransferStats,
}

impl Orchestrator {
    pub fn new(config: TransferConfig, deps: PipelineDeps) -> Self {
        let lister = Lister::new(
            Arc::clone(&deps.objects),
            Arc::clone(&deps.manifests),
            &config.source_bucket,
            &config.destination_bucket,
            config.throttle_retry,
        );
        let executor = TransferExecutor::new(
            Arc::clone(&deps.objects),
            ExecutorSettings {
                source_bucket: config.source_bucket.clone(),
                destination_bucket: config.destination_bucket.clone(),
                encryption: DestinationEncryption {
                    kms_key_id: config.destination_kms_key_id.clone(),
                },
                multipart_threshold: config.multipart_threshold_bytes,
                part_size: config.multipart_part_size_bytes,
                throttle: config.throttle_retry,
            },
        );
        let validator = Validator::new(
            Arc::clone(&deps.objects),
            config.validation_sample_size,
            config.throttle_retry,
        );
        let reporter = Reporter::new(
            Arc::clone(&deps.manifests),
            deps.notifier.clone(),
            config.stage_retry,
        );

        Self {
            config: Arc::new(config),
            deps,
            lister,
            executor: Arc::new(executor),
            validator,
            reporter,
        }
    }

    /// Runs one execution to a terminal state.
    ///
    /// Only a malformed start payload is returned as `Err`; stage failures
    /// end in `Failed` and are reported through the outcome.
    pub async fn run(
        &self,
        payload: StartPayload,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let request = normalize_start(
            payload,
            &self.config.source_prefix,
            &self.config.destination_prefix,
            || Uuid::new_v4().to_string(),
        )?;
        let started_at = Utc::now();
        let mut tracker = StateTracker::start(&request.execution_id);

        info!(
            component = "orchestrator",
            event = "execution_started",
            execution_id = %request.execution_id,
            source = %s3_uri(&self.config.source_bucket, &request.source_prefix),
            destination = %s3_uri(&self.config.destination_bucket, &request.destination_prefix),
            "transfer execution started"
        );

        let listing = match self.run_listing(&request).await {
            Ok(value) => value,
            Err(error) => return Ok(self.abort(tracker, &request, None, error).await),
        };

        tracker.advance(ExecutionState::Transferring);
        let manifest = match self.load_manifest(&listing).await {
            Ok(value) => Arc::new(value),
            Err(error) => return Ok(self.abort(tracker, &request, Some(&listing), error).await),
        };
        let batch = match self.run_transfers(Arc::clone(&manifest), &cancel).await {
            Ok(value) => value,
            Err(error) => return Ok(self.abort(tracker, &request, Some(&listing), error).await),
        };

        tracker.advance(ExecutionState::Validating);
        let validation = match self.run_validation(&manifest).await {
            Ok(value) => value,
            Err(error) => return Ok(self.abort(tracker, &request, Some(&listing), error).await),
        };

        tracker.advance(ExecutionState::Reporting);
        let report = Report::build(
            ReportContext {
                execution_id: request.execution_id.clone(),
                source: s3_uri(&manifest.source_bucket, &manifest.source_prefix),
                destination: s3_uri(&manifest.destination_bucket, &manifest.destination_prefix),
                manifest_location: listing.manifest_location.clone(),
                manifest_sha256: listing.manifest_sha256.clone(),
                source_kms_key_id: self.config.source_kms_key_id.clone(),
                destination_kms_key_id: self.config.destination_kms_key_id.clone(),
                total_objects: manifest.total_objects,
                total_size_bytes: manifest.total_size_bytes,
                started_at,
                cancelled: batch.stats.cancelled,
            },
            &batch.tally,
            validation,
            self.config.terminal_policy,
            Utc::now(),
        );

        let report_location = match self.reporter.persist(&report).await {
            Ok(value) => value,
            Err(error) => return Ok(self.abort(tracker, &request, Some(&listing), error).await),
        };
        self.reporter
            .notify(&NotificationMessage::from_report(&report, &report_location))
            .await;

        tracker.advance(report.execution_state);
        info!(
            component = "orchestrator",
            event = "execution_finished",
            execution_id = %request.execution_id,
            state = ?tracker.current,
            status = report.status.as_str(),
            succeeded = report.succeeded_count,
            failed = report.failed_count,
            bytes_copied = report.bytes_copied,
            "transfer execution finished"
        );

        Ok(ExecutionOutcome {
            execution_id: request.execution_id,
            state: tracker.current,
            history: tracker.history,
            report_status: Some(report.status),
            report_location: Some(report_location),
            manifest_location: Some(listing.manifest_location),
            transfer: Some(batch.stats),
            error: None,
            report: Some(report),
        })
    }

    fn lease(
        &self,
        role_ref: &str,
        stage: &str,
        execution_id: &str,
    ) -> Result<CredentialLease, ServiceError> {
        let request = AssumeRoleRequest::new(
            role_ref,
            &self.config.external_id,
            session_name(stage, execution_id),
            self.config.credential_duration,
        )?;
        Ok(CredentialLease::new(
            Arc::clone(&self.deps.broker),
            request,
            self.config.credential_refresh_margin,
            self.config.throttle_retry,
        ))
    }

    async fn run_listing(&self, request: &StartRequest) -> Result<ListingSummary, PipelineError> {
        let lease = self.lease(&self.config.source_role_arn, "listing", &request.execution_id)?;
        let lease = &lease;
        retry_with(
            &self.config.stage_retry,
            "listing",
            move || async move {
                let credential = lease.get().await?;
                self.lister.list(request, &credential).await
            },
            is_stage_retryable,
        )
        .await
    }

    async fn load_manifest(&self, listing: &ListingSummary) -> Result<Manifest, PipelineError> {
        let body = retry_stage(&self.config.stage_retry, "get_manifest", || {
            self.deps.manifests.get(&listing.manifest_key)
        })
        .await?;
        Ok(Manifest::decode(&body)?)
    }

    async fn run_transfers(
        &self,
        manifest: Arc<Manifest>,
        cancel: &CancellationToken,
    ) -> Result<TransferBatch, PipelineError> {
        let lease = Arc::new(self.lease(
            &self.config.destination_role_arn,
            "transfer",
            &manifest.execution_id,
        )?);
        retry_stage(&self.config.stage_retry, "transfer_credentials", || lease.get()).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let gauge = Arc::new(InFlightGauge::default());
        let deadline = self
            .config
            .transfer_stage_timeout
            .map(|timeout| Instant::now() + timeout);
        let total = manifest.entries.len();
        let mut settled = vec![false; total];
        let mut tally = TransferTally::default();
        let mut join_set = JoinSet::new();
        let mut issued = 0usize;
        let mut stop_reason: Option<&'static str> = None;

        for index in 0..total {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop_reason = Some("cancelled");
                    break;
                }
                _ = wait_for_deadline(deadline) => {
                    stop_reason = Some("stage_timeout");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|error| PipelineError::WorkerPool(error.to_string()))?
                }
            };

            while let Some(joined) = join_set.try_join_next() {
                settle(joined, &mut settled, &mut tally);
            }

            let item_deadline = Instant::now() + self.config.item_timeout;
            let worker = ItemWorker {
                manifest: Arc::clone(&manifest),
                executor: Arc::clone(&self.executor),
                lease: Arc::clone(&lease),
                gauge: Arc::clone(&gauge),
                stage_retry: self.config.stage_retry,
                deadline: deadline.map_or(item_deadline, |stage| stage.min(item_deadline)),
            };
            join_set.spawn(async move {
                let _permit = permit;
                (index, worker.run(index).await)
            });
            issued += 1;
        }

        if let Some(reason) = stop_reason {
            warn!(
                component = "orchestrator",
                event = "issuance_stopped",
                execution_id = %manifest.execution_id,
                reason,
                issued,
                remaining = total - issued,
                "no further items will be issued"
            );
        }

        // In-flight work is awaited only while the stage is live. Directives
        // already sent to the store are left to finish on their own.
        let mut interrupted: Option<ErrorKind> = None;
        loop {
            let joined = tokio::select! {
                biased;
                joined = join_set.join_next() => joined,
                _ = cancel.cancelled(), if interrupted.is_none() => {
                    interrupted = Some(ErrorKind::Cancelled);
                    join_set.abort_all();
                    continue;
                }
                _ = wait_for_deadline(deadline), if interrupted.is_none() => {
                    interrupted = Some(ErrorKind::Timeout);
                    join_set.abort_all();
                    continue;
                }
            };
            match joined {
                Some(joined) => settle(joined, &mut settled, &mut tally),
                None => break,
            }
        }

        if let Some(kind) = interrupted {
            warn!(
                component = "orchestrator",
                event = "in_flight_abandoned",
                execution_id = %manifest.execution_id,
                error_kind = %kind,
                unsettled = settled.iter().filter(|done| !**done).count(),
                "stopped waiting for in-flight items"
            );
        }

        for (index, done) in settled.iter().enumerate() {
            if *done {
                continue;
            }
            let entry = &manifest.entries[index];
            let error = if index < issued {
                match interrupted {
                    Some(kind) => ServiceError::new(
                        kind,
                        "transfer_item",
                        "stage ended before the item settled",
                    ),
                    None => ServiceError::service_fault(
                        "transfer_item",
                        "worker ended without a result",
                    ),
                }
            } else {
                ServiceError::new(
                    ErrorKind::Cancelled,
                    "transfer_item",
                    format!("not issued: {}", stop_reason.unwrap_or("cancelled")),
                )
            };
            tally.record(TransferResult::failed(
                &entry.key,
                manifest.destination_key_for(entry),
                &error,
            ));
        }

        let stats = TransferStats {
            issued: issued as u64,
            peak_in_flight: gauge.peak(),
            cancelled: stop_reason.is_some() || interrupted.is_some(),
        };
        info!(
            component = "orchestrator",
            event = "transfers_joined",
            execution_id = %manifest.execution_id,
            succeeded = tally.succeeded_count,
            failed = tally.failed_count(),
            bytes_copied = tally.bytes_copied,
            peak_in_flight = stats.peak_in_flight,
            "transfer stage joined"
        );
        Ok(TransferBatch { tally, stats })
    }

    async fn run_validation(&self, manifest: &Manifest) -> Result<ValidationResult, PipelineError> {
        let source = self.lease(
            &self.config.source_role_arn,
            "validation",
            &manifest.execution_id,
        )?;
        let destination = self.lease(
            &self.config.destination_role_arn,
            "validation",
            &manifest.execution_id,
        )?;
        let (source, destination) = (&source, &destination);

        retry_with(
            &self.config.stage_retry,
            "validation",
            move || async move {
                let source_credential = source.get().await?;
                let destination_credential = destination.get().await?;
                self.validator
                    .validate(manifest, &source_credential, &destination_credential)
                    .await
            },
            is_stage_retryable,
        )
        .await
    }

    async fn abort(
        &self,
        mut tracker: StateTracker,
        request: &StartRequest,
        listing: Option<&ListingSummary>,
        failure: PipelineError,
    ) -> ExecutionOutcome {
        let failed_stage = tracker.current;
        tracker.advance(ExecutionState::Failed);
        error!(
            component = "orchestrator",
            event = "execution_aborted",
            execution_id = %request.execution_id,
            stage = ?failed_stage,
            error_kind = %failure.kind(),
            "{failure}"
        );

        let message = NotificationMessage {
            execution_id: request.execution_id.clone(),
            status: VerificationStatus::Failed.as_str().to_string(),
            execution_state: ExecutionState::Failed,
            total_objects: listing.map_or(0, |summary| summary.total_count),
            total_size_bytes: listing.map_or(0, |summary| summary.total_bytes),
            succeeded_count: 0,
            failed_count: 0,
            source: s3_uri(&self.config.source_bucket, &request.source_prefix),
            destination: s3_uri(&self.config.destination_bucket, &request.destination_prefix),
            report_location: None,
            error: Some(format!("{failed_stage:?} stage failed: {failure}")),
        };
        self.reporter.notify(&message).await;

        ExecutionOutcome {
            execution_id: request.execution_id.clone(),
            state: tracker.current,
            history: tracker.history,
            report_status: None,
            report_location: None,
            manifest_location: listing.map(|summary| summary.manifest_location.clone()),
            transfer: None,
            error: message.error,
            report: None,
        }
    }
}

fn is_stage_retryable<T>(outcome: &Result<T, PipelineError>) -> bool {
    matches!(outcome, Err(error) if error.kind().is_stage_retryable())
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn settle(
    joined: Result<(usize, TransferResult), JoinError>,
    settled: &mut [bool],
    tally: &mut TransferTally,
) {
    match joined {
        Ok((index, result)) => {
            settled[index] = true;
            tally.record(result);
        }
        Err(join_error) if join_error.is_cancelled() => {}
        Err(join_error) => {
            error!(
                component = "orchestrator",
                event = "worker_crashed",
                "transfer worker did not complete: {join_error}"
            );
        }
    }
}

struct StateTracker {
    execution_id: String,
    current: ExecutionState,
    history: Vec<ExecutionState>,
}

impl StateTracker {
    fn start(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            current: ExecutionState::Listing,
            history: vec![ExecutionState::Listing],
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        if !self.current.can_transition_to(next) {
            warn!(
                component = "orchestrator",
                event = "illegal_transition",
                execution_id = %self.execution_id,
                from = ?self.current,
                to = ?next,
                "ignoring out-of-order state transition"
            );
            return;
        }
        info!(
            component = "orchestrator",
            event = "stage_transition",
            execution_id = %self.execution_id,
            from = ?self.current,
            to = ?next,
            "stage transition"
        );
        self.current = next;
        self.history.push(next);
    }
}

/// Tracks items currently inside a worker, including time spent in backoff.
#[derive(Default)]
struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard<'a>(&'a InFlightGauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ItemWorker {
    manifest: Arc<Manifest>,
    executor: Arc<TransferExecutor>,
    lease: Arc<CredentialLease>,
    gauge: Arc<InFlightGauge>,
    stage_retry: BackoffPolicy,
    /// Item budget, already capped at the stage deadline.
    deadline: Instant,
}

impl ItemWorker {
    /// One manifest entry, with stage-level retry on service faults and an
    /// overall deadline.
    async fn run(self, index: usize) -> TransferResult {
        let _in_flight = self.gauge.enter();
        let entry = &self.manifest.entries[index];
        let destination_key = self.manifest.destination_key_for(entry);

        let attempts = retry_with(
            &self.stage_retry,
            "transfer_item",
            || self.attempt(entry, &destination_key),
            |result: &TransferResult| {
                result
                    .error_kind
                    .is_some_and(ErrorKind::is_stage_retryable)
            },
        );

        match tokio::time::timeout_at(self.deadline, attempts).await {
            Ok(result) => result,
            Err(_) => TransferResult::failed(
                &entry.key,
                &destination_key,
                &ServiceError::new(ErrorKind::Timeout, "transfer_item", "item budget exhausted"),
            ),
        }
    }

    async fn attempt(&self, entry: &ManifestEntry, destination_key: &str) -> TransferResult {
        match self.lease.get().await {
            Ok(credential) => self.executor.copy(entry, destination_key, &credential).await,
            Err(error) => TransferResult::failed(&entry.key, destination_key, &error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{
        test_config, FaultRule, InMemoryManifestStore, InMemoryObjectStore, RecordingNotifier,
        StaticCredentialBroker, StoreOperation,
    };

    struct Harness {
        objects: Arc<InMemoryObjectStore>,
        manifests: Arc<InMemoryManifestStore>,
        notifier: Arc<RecordingNotifier>,
        broker: Arc<StaticCredentialBroker>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                objects: Arc::new(InMemoryObjectStore::new()),
                manifests: Arc::new(InMemoryManifestStore::new("hub-bucket")),
                notifier: Arc::new(RecordingNotifier::new()),
                broker: Arc::new(StaticCredentialBroker::new()),
            }
        }

        fn orchestrator(&self, config: TransferConfig) -> Orchestrator {
            Orchestrator::new(
                config,
                PipelineDeps {
                    broker: self.broker.clone(),
                    objects: self.objects.clone(),
                    manifests: self.manifests.clone(),
                    notifier: Some(self.notifier.clone()),
                },
            )
        }

        fn seed(&self, count: usize, size: u64) {
            for index in 0..count {
                self.objects
                    .put_object("source-bucket", &format!("in/{index:04}.bin"), size);
            }
        }
    }

    fn payload(execution_id: &str) -> StartPayload {
        StartPayload {
            execution_id: Some(execution_id.to_string()),
            ..StartPayload::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn walks_every_stage_in_order() {
        let harness = Harness::new();
        harness.seed(3, 100);

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-order"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(
            outcome.history,
            vec![
                ExecutionState::Listing,
                ExecutionState::Transferring,
                ExecutionState::Validating,
                ExecutionState::Reporting,
                ExecutionState::Succeeded,
            ]
        );
        assert_eq!(outcome.report_status, Some(VerificationStatus::Passed));
    }

    #[tokio::test(start_paused = true)]
    async fn generates_execution_id_when_missing() {
        let harness = Harness::new();
        let outcome = harness
            .orchestrator(test_config())
            .run(StartPayload::default(), CancellationToken::new())
            .await
            .expect("execution should run");

        assert!(Uuid::parse_str(&outcome.execution_id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_malformed_execution_id() {
        let harness = Harness::new();
        let error = harness
            .orchestrator(test_config())
            .run(payload("bad/id"), CancellationToken::new())
            .await
            .expect_err("payload should be rejected");

        assert_eq!(error.kind(), ErrorKind::InvalidInput);
        assert_eq!(harness.broker.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_access_denied_aborts_without_stage_retry() {
        let harness = Harness::new();
        harness.seed(2, 10);
        harness
            .objects
            .inject(FaultRule::always(StoreOperation::List, ErrorKind::AccessDenied));

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-denied"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(
            outcome.history,
            vec![ExecutionState::Listing, ExecutionState::Failed]
        );
        assert_eq!(harness.objects.calls(StoreOperation::List), 1);
        assert_eq!(harness.manifests.put_count("reports/exec-denied/report.json"), 0);
        let published = harness.notifier.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "S3 Transfer FAILED: exec-den");
    }

    #[tokio::test(start_paused = true)]
    async fn listing_service_fault_is_retried_three_times() {
        let harness = Harness::new();
        harness.seed(1, 10);
        harness
            .objects
            .inject(FaultRule::always(StoreOperation::List, ErrorKind::ServiceFault));

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-fault"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(harness.objects.calls(StoreOperation::List), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn item_service_fault_is_retried_at_stage_level() {
        let harness = Harness::new();
        harness.seed(1, 10);
        harness
            .objects
            .inject(FaultRule::times(StoreOperation::Copy, ErrorKind::ServiceFault, 2));

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-item-retry"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(outcome.report_status, Some(VerificationStatus::Passed));
        assert_eq!(harness.objects.calls(StoreOperation::Copy), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_bound_during_backoff() {
        let harness = Harness::new();
        harness.seed(60, 10);
        harness.objects.set_latency(Duration::from_millis(250));
        harness
            .objects
            .inject(FaultRule::times(StoreOperation::Copy, ErrorKind::Throttled, 30));
        let mut config = test_config();
        config.max_concurrency = 4;

        let outcome = harness
            .orchestrator(config)
            .run(payload("exec-bound"), CancellationToken::new())
            .await
            .expect("execution should run");

        let stats = outcome.transfer.expect("transfer stats");
        assert!(stats.peak_in_flight <= 4);
        assert_eq!(stats.issued, 60);
        assert!(harness.objects.max_in_flight() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_marks_unissued_items_and_fails() {
        let harness = Harness::new();
        harness.seed(20, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-cancel"), cancel)
            .await
            .expect("execution should run");

        assert_eq!(outcome.state, ExecutionState::Failed);
        let report = outcome.report.expect("report is still written");
        assert_eq!(report.failed_count, 20);
        assert!(report
            .failed_items
            .iter()
            .all(|item| item.error_kind == ErrorKind::Cancelled));
        assert_eq!(harness.manifests.put_count("reports/exec-cancel/report.json"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_timeout_stops_issuance() {
        let harness = Harness::new();
        harness.seed(10, 10);
        let objects = harness.objects.clone();
        objects.set_latency(Duration::from_secs(30));
        let mut config = test_config();
        config.max_concurrency = 2;
        config.transfer_stage_timeout = Some(Duration::from_secs(45));

        let outcome = harness
            .orchestrator(config)
            .run(payload("exec-stage-timeout"), CancellationToken::new())
            .await
            .expect("execution should run");

        let stats = outcome.transfer.expect("transfer stats");
        assert!(stats.cancelled);
        assert_eq!(stats.issued, 4);
        let report = outcome.report.expect("report");
        assert_eq!(report.succeeded_count, 2);
        assert_eq!(report.failed_count, 8);
        assert_eq!(outcome.state, ExecutionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_budget_caps_in_flight_items() {
        let harness = Harness::new();
        harness.seed(4, 10);
        harness.objects.set_latency(Duration::from_secs(600));
        let mut config = test_config();
        config.max_concurrency = 2;
        config.transfer_stage_timeout = Some(Duration::from_secs(45));

        let started = Instant::now();
        let outcome = harness
            .orchestrator(config)
            .run(payload("exec-budget"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert!(started.elapsed() <= Duration::from_secs(46));
        assert_eq!(outcome.state, ExecutionState::Failed);
        let report = outcome.report.expect("report is written within the budget");
        assert_eq!(report.succeeded_count, 0);
        let mut kinds: Vec<ErrorKind> = report
            .failed_items
            .iter()
            .map(|item| item.error_kind)
            .collect();
        kinds.sort_by_key(|kind| kind.as_str());
        assert_eq!(
            kinds,
            vec![
                ErrorKind::Cancelled,
                ErrorKind::Cancelled,
                ErrorKind::Timeout,
                ErrorKind::Timeout,
            ]
        );
        assert_eq!(harness.manifests.put_count("reports/exec-budget/report.json"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting_for_in_flight_items() {
        let harness = Harness::new();
        harness.seed(3, 10);
        harness.objects.set_latency(Duration::from_secs(600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-cancel-mid"), cancel)
            .await
            .expect("execution should run");

        assert!(started.elapsed() < Duration::from_secs(11));
        assert_eq!(outcome.state, ExecutionState::Failed);
        let report = outcome.report.expect("report");
        assert_eq!(report.failed_count, 3);
        assert!(report
            .failed_items
            .iter()
            .all(|item| item.error_kind == ErrorKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn manifest_read_fault_is_retried_at_stage_level() {
        let harness = Harness::new();
        harness.seed(2, 10);
        harness.manifests.fail_gets(ErrorKind::ServiceFault, 2);

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-get-retry"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(outcome.state, ExecutionState::Succeeded);
        assert_eq!(outcome.report_status, Some(VerificationStatus::Passed));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_manifest_read_retry_aborts_transfer_stage() {
        let harness = Harness::new();
        harness.seed(2, 10);
        harness.manifests.fail_gets(ErrorKind::ServiceFault, 3);

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("exec-get-fail"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(
            outcome.history,
            vec![
                ExecutionState::Listing,
                ExecutionState::Transferring,
                ExecutionState::Failed
            ]
        );
        assert_eq!(harness.objects.calls(StoreOperation::Copy), 0);
        assert_eq!(harness.manifests.put_count("reports/exec-get-fail/report.json"), 0);
        assert_eq!(harness.notifier.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_credential_is_reacquired_near_expiry() {
        let mut harness = Harness::new();
        harness.broker =
            Arc::new(StaticCredentialBroker::new().with_lifetime(chrono::Duration::minutes(4)));
        harness.seed(3, 10);

        let outcome = harness
            .orchestrator(test_config())
            .run(payload("0123456789abcdef"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(outcome.report_status, Some(VerificationStatus::Passed));
        let transfer_sessions = harness
            .broker
            .session_names()
            .iter()
            .filter(|name| name.as_str() == "transfer-01234567")
            .count();
        assert_eq!(transfer_sessions, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn item_timeout_fails_only_that_item() {
        let harness = Harness::new();
        harness.seed(2, 10);
        harness.objects.set_latency(Duration::from_secs(120));
        let mut config = test_config();
        config.item_timeout = Duration::from_secs(60);

        let outcome = harness
            .orchestrator(config)
            .run(payload("exec-item-timeout"), CancellationToken::new())
            .await
            .expect("execution should run");

        let report = outcome.report.expect("report");
        assert_eq!(report.failed_count, 2);
        assert!(report
            .failed_items
            .iter()
            .all(|item| item.error_kind == ErrorKind::Timeout));
        assert_eq!(outcome.state, ExecutionState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_destination_role_aborts_transfer_stage() {
        let harness = Harness::new();
        harness.seed(2, 10);
        let config = test_config();
        harness.broker.deny_role(&config.destination_role_arn);

        let outcome = harness
            .orchestrator(config)
            .run(payload("exec-dest-denied"), CancellationToken::new())
            .await
            .expect("execution should run");

        assert_eq!(
            outcome.history,
            vec![
                ExecutionState::Listing,
                ExecutionState::Transferring,
                ExecutionState::Failed
            ]
        );
        assert_eq!(harness.objects.calls(StoreOperation::Copy), 0);
        assert!(outcome.manifest_location.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn session_names_carry_stage_and_short_id() {
        let harness = Harness::new();
        harness.seed(1, 10);

        harness
            .orchestrator(test_config())
            .run(payload("0123456789abcdef"), CancellationToken::new())
            .await
            .expect("execution should run");

        let sessions = harness.broker.session_names();
        assert!(sessions.contains(&"listing-01234567".to_string()));
        assert!(sessions.contains(&"transfer-01234567".to_string()));
        assert!(sessions.contains(&"validation-01234567".to_string()));
    }
}
