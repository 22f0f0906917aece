use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{ErrorKind, ServiceError};
use crate::storage_keys::destination_key;

pub const MANIFEST_SCHEMA_VERSION: &str = "v1";
pub const REPORT_SCHEMA_VERSION: &str = "v1";
pub const MAX_EXECUTION_ID_LEN: usize = 128;
pub const NOTIFICATION_SUBJECT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("execution_id cannot be empty")]
    EmptyExecutionId,
    #[error("execution_id '{0}' must be at most 128 characters of [A-Za-z0-9._-]")]
    InvalidExecutionId(String),
    #[error("malformed contract JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest invariant violated: {0}")]
    ManifestInvariant(String),
}

/// Trigger payload. Every field is optional so a bare scheduled event works.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartPayload {
    #[serde(default, alias = "sourcePrefix")]
    pub source_prefix: Option<String>,
    #[serde(default, alias = "destPrefix", alias = "dest_prefix")]
    pub destination_prefix: Option<String>,
    #[serde(default, alias = "executionId")]
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartRequest {
    pub execution_id: String,
    pub source_prefix: String,
    pub destination_prefix: String,
}

pub fn normalize_start(
    payload: StartPayload,
    default_source_prefix: &str,
    default_destination_prefix: &str,
    generate_execution_id: impl FnOnce() -> String,
) -> Result<StartRequest, ContractError> {
    let execution_id = match payload.execution_id {
        Some(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Err(ContractError::EmptyExecutionId);
            }
            trimmed
        }
        None => generate_execution_id(),
    };

    let valid_chars = execution_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    // A leading dot would allow `.`/`..` path segments in storage keys.
    if execution_id.len() > MAX_EXECUTION_ID_LEN
        || !valid_chars
        || execution_id.starts_with('.')
    {
        return Err(ContractError::InvalidExecutionId(execution_id));
    }

    Ok(StartRequest {
        execution_id,
        source_prefix: payload
            .source_prefix
            .unwrap_or_else(|| default_source_prefix.to_string()),
        destination_prefix: payload
            .destination_prefix
            .unwrap_or_else(|| default_destination_prefix.to_string()),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ManifestEntry {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            etag: None,
        }
    }
}

/// Immutable enumeration of one execution's population.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub schema_version: String,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub source_bucket: String,
    pub source_prefix: String,
    pub destination_bucket: String,
    pub destination_prefix: String,
    pub total_objects: u64,
    pub total_size_bytes: u64,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(
        request: &StartRequest,
        source_bucket: impl Into<String>,
        destination_bucket: impl Into<String>,
        entries: Vec<ManifestEntry>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let total_size_bytes = entries
            .iter()
            .fold(0u64, |total, entry| total.saturating_add(entry.size));
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            execution_id: request.execution_id.clone(),
            created_at,
            source_bucket: source_bucket.into(),
            source_prefix: request.source_prefix.clone(),
            destination_bucket: destination_bucket.into(),
            destination_prefix: request.destination_prefix.clone(),
            total_objects: entries.len() as u64,
            total_size_bytes,
            entries,
        }
    }

    pub fn destination_key_for(&self, entry: &ManifestEntry) -> String {
        destination_key(&entry.key, &self.source_prefix, &self.destination_prefix)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ContractError> {
        self.check_invariants()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ContractError> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.check_invariants()?;
        Ok(manifest)
    }

    fn check_invariants(&self) -> Result<(), ContractError> {
        if self.total_objects != self.entries.len() as u64 {
            return Err(ContractError::ManifestInvariant(format!(
                "total_objects={} but manifest holds {} entries",
                self.total_objects,
                self.entries.len()
            )));
        }

        let summed = self
            .entries
            .iter()
            .fold(0u64, |total, entry| total.saturating_add(entry.size));
        if summed != self.total_size_bytes {
            return Err(ContractError::ManifestInvariant(format!(
                "total_size_bytes={} but entries sum to {summed}",
                self.total_size_bytes
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferResult {
    pub key: String,
    pub destination_key: String,
    pub status: TransferStatus,
    pub bytes_copied: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransferResult {
    pub fn succeeded(
        key: impl Into<String>,
        destination_key: impl Into<String>,
        bytes: u64,
    ) -> Self {
        Self {
            key: key.into(),
            destination_key: destination_key.into(),
            status: TransferStatus::Succeeded,
            bytes_copied: bytes,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failed(
        key: impl Into<String>,
        destination_key: impl Into<String>,
        error: &ServiceError,
    ) -> Self {
        Self {
            key: key.into(),
            destination_key: destination_key.into(),
            status: TransferStatus::Failed,
            bytes_copied: 0,
            error_kind: Some(error.kind),
            error_message: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Succeeded
    }
}

/// Join-point aggregate of transfer results.
///
/// Successes are only counted so that memory stays proportional to the
/// number of failures rather than to the population.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferTally {
    pub succeeded_count: u64,
    pub bytes_copied: u64,
    pub failures: Vec<TransferResult>,
}

impl TransferTally {
    pub fn record(&mut self, result: TransferResult) {
        if result.is_success() {
            self.succeeded_count += 1;
            self.bytes_copied = self.bytes_copied.saturating_add(result.bytes_copied);
        } else {
            self.failures.push(result);
        }
    }

    pub fn failed_count(&self) -> u64 {
        self.failures.len() as u64
    }
}

impl FromIterator<TransferResult> for TransferTally {
    fn from_iter<I: IntoIterator<Item = TransferResult>>(iter: I) -> Self {
        let mut tally = Self::default();
        for result in iter {
            tally.record(result);
        }
        tally
    }
}

/// Outcome of a data check, used for both validation and the report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Passed,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    CountMismatch,
    SizeMismatch,
    MissingDestination,
    HeadFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mismatch {
    pub key: String,
    pub reason: MismatchReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub status: VerificationStatus,
    #[serde(rename = "total_expected")]
    pub expected_count: u64,
    #[serde(rename = "total_found")]
    pub found_count: u64,
    pub samples_checked: u64,
    pub samples_passed: u64,
    pub mismatches: Vec<String>,
    pub mismatch_details: Vec<Mismatch>,
}

impl ValidationResult {
    /// `Passed` iff counts agree and every sampled pair matched.
    ///
    /// `sample_mismatches` holds only per-sample failures; a count mismatch
    /// entry keyed by `destination_prefix` is added here.
    pub fn evaluate(
        expected_count: u64,
        found_count: u64,
        samples_checked: u64,
        sample_mismatches: Vec<Mismatch>,
        destination_prefix: &str,
    ) -> Self {
        let samples_passed = samples_checked.saturating_sub(sample_mismatches.len() as u64);
        let mut details = Vec::with_capacity(sample_mismatches.len() + 1);
        if expected_count != found_count {
            details.push(Mismatch {
                key: destination_prefix.to_string(),
                reason: MismatchReason::CountMismatch,
                expected_size: None,
                actual_size: None,
                detail: Some(format!("expected {expected_count} objects, found {found_count}")),
            });
        }
        details.extend(sample_mismatches);

        let status = if details.is_empty() {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };

        Self {
            status,
            expected_count,
            found_count,
            samples_checked,
            samples_passed,
            mismatches: details.iter().map(|mismatch| mismatch.key.clone()).collect(),
            mismatch_details: details,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Listing,
    Transferring,
    Validating,
    Reporting,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Stage-level transitions are strictly sequential; any live stage may
    /// abort to `Failed`.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Listing, Self::Transferring)
            | (Self::Transferring, Self::Validating)
            | (Self::Validating, Self::Reporting)
            | (Self::Reporting, Self::Succeeded) => true,
            (current, Self::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Decides how a finished report maps onto the terminal execution state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalPolicy {
    pub demote_on_validation_failure: bool,
}

impl TerminalPolicy {
    pub fn terminal_state(
        self,
        report_status: VerificationStatus,
        cancelled: bool,
    ) -> ExecutionState {
        if cancelled {
            return ExecutionState::Failed;
        }
        match (report_status, self.demote_on_validation_failure) {
            (VerificationStatus::Failed, true) => ExecutionState::Failed,
            _ => ExecutionState::Succeeded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedItem {
    pub key: String,
    pub error_kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal audit record; persisted once per execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub schema_version: String,
    pub execution_id: String,
    pub status: VerificationStatus,
    pub execution_state: ExecutionState,
    pub total_objects: u64,
    pub total_size_bytes: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub bytes_copied: u64,
    pub validation: ValidationResult,
    pub failed_keys: Vec<String>,
    pub failed_items: Vec<FailedItem>,
    pub source: String,
    pub destination: String,
    pub manifest_location: String,
    pub manifest_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kms_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_kms_key_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportContext {
    pub execution_id: String,
    pub source: String,
    pub destination: String,
    pub manifest_location: String,
    pub manifest_sha256: String,
    pub source_kms_key_id: Option<String>,
    pub destination_kms_key_id: Option<String>,
    pub total_objects: u64,
    pub total_size_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl Report {
    pub fn build(
        context: ReportContext,
        tally: &TransferTally,
        validation: ValidationResult,
        policy: TerminalPolicy,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let failed_items: Vec<FailedItem> = tally
            .failures
            .iter()
            .map(|result| FailedItem {
                key: result.key.clone(),
                error_kind: result.error_kind.unwrap_or(ErrorKind::ServiceFault),
                message: result.error_message.clone(),
            })
            .collect();

        let status = if validation.status == VerificationStatus::Passed
            && failed_items.is_empty()
            && !context.cancelled
        {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };

        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            execution_id: context.execution_id,
            status,
            execution_state: policy.terminal_state(status, context.cancelled),
            total_objects: context.total_objects,
            total_size_bytes: context.total_size_bytes,
            succeeded_count: tally.succeeded_count,
            failed_count: tally.failed_count(),
            bytes_copied: tally.bytes_copied,
            validation,
            failed_keys: failed_items.iter().map(|item| item.key.clone()).collect(),
            failed_items,
            source: context.source,
            destination: context.destination,
            manifest_location: context.manifest_location,
            manifest_sha256: context.manifest_sha256,
            source_kms_key_id: context.source_kms_key_id,
            destination_kms_key_id: context.destination_kms_key_id,
            started_at: context.started_at,
            finished_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ContractError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Message published to the notification capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationMessage {
    pub execution_id: String,
    pub status: String,
    pub execution_state: ExecutionState,
    pub total_objects: u64,
    pub total_size_bytes: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationMessage {
    pub fn from_report(report: &Report, report_location: impl Into<String>) -> Self {
        Self {
            execution_id: report.execution_id.clone(),
            status: report.status.as_str().to_string(),
            execution_state: report.execution_state,
            total_objects: report.total_objects,
            total_size_bytes: report.total_size_bytes,
            succeeded_count: report.succeeded_count,
            failed_count: report.failed_count,
            source: report.source.clone(),
            destination: report.destination.clone(),
            report_location: Some(report_location.into()),
            error: None,
        }
    }

    pub fn subject(&self) -> String {
        let short_id: String = self.execution_id.chars().take(8).collect();
        let subject = format!("S3 Transfer {}: {short_id}", self.status);
        subject.chars().take(NOTIFICATION_SUBJECT_LIMIT).collect()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn request() -> StartRequest {
        StartRequest {
            execution_id: "exec-0001".to_string(),
            source_prefix: "in/".to_string(),
            destination_prefix: "out/".to_string(),
        }
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn context(cancelled: bool) -> ReportContext {
        ReportContext {
            execution_id: "exec-0001".to_string(),
            source: "s3://src/in/".to_string(),
            destination: "s3://dst/out/".to_string(),
            manifest_location: "s3://hub/manifests/exec-0001/manifest.json".to_string(),
            manifest_sha256: sha256_hex(b"manifest"),
            source_kms_key_id: None,
            destination_kms_key_id: Some("alias/destination".to_string()),
            total_objects: 2,
            total_size_bytes: 30,
            started_at: created_at(),
            cancelled,
        }
    }

    #[test]
    fn normalize_start_uses_defaults_and_generated_id() {
        let normalized = normalize_start(StartPayload::default(), "in/", "out/", || {
            "generated-id".to_string()
        })
        .expect("payload should pass");

        assert_eq!(normalized.execution_id, "generated-id");
        assert_eq!(normalized.source_prefix, "in/");
        assert_eq!(normalized.destination_prefix, "out/");
    }

    #[test]
    fn normalize_start_accepts_camel_case_aliases() {
        let raw = r#"{"sourcePrefix":"a/","destPrefix":"b/","executionId":" run-7 "}"#;
        let payload: StartPayload = serde_json::from_str(raw).expect("payload should parse");
        let normalized =
            normalize_start(payload, "", "", || unreachable!()).expect("payload should pass");

        assert_eq!(normalized.execution_id, "run-7");
        assert_eq!(normalized.source_prefix, "a/");
        assert_eq!(normalized.destination_prefix, "b/");
    }

    #[test]
    fn normalize_start_rejects_dot_segment_ids() {
        for id in [".", "..", ".hidden"] {
            let payload = StartPayload {
                execution_id: Some(id.to_string()),
                ..StartPayload::default()
            };
            let error = normalize_start(payload, "", "", String::new).expect_err("id should fail");
            assert!(matches!(error, ContractError::InvalidExecutionId(_)));
        }

        let payload = StartPayload {
            execution_id: Some("run.2026-10-16".to_string()),
            ..StartPayload::default()
        };
        assert!(normalize_start(payload, "", "", String::new).is_ok());
    }

    #[test]
    fn normalize_start_rejects_unsafe_execution_ids() {
        let payload = StartPayload {
            execution_id: Some("../etc".to_string()),
            ..StartPayload::default()
        };
        let error = normalize_start(payload, "", "", String::new).expect_err("id should fail");
        assert!(matches!(error, ContractError::InvalidExecutionId(_)));

        let payload = StartPayload {
            execution_id: Some("  ".to_string()),
            ..StartPayload::default()
        };
        let error = normalize_start(payload, "", "", String::new).expect_err("id should fail");
        assert!(matches!(error, ContractError::EmptyExecutionId));
    }

    #[test]
    fn manifest_serializes_entries_with_key_and_size_fields() {
        let manifest = Manifest::new(
            &request(),
            "src",
            "dst",
            vec![ManifestEntry::new("in/a.txt", 10)],
            created_at(),
        );
        let value: serde_json::Value =
            serde_json::from_slice(&manifest.encode().expect("manifest should encode"))
                .expect("manifest should be JSON");

        assert_eq!(value["entries"][0]["Key"], "in/a.txt");
        assert_eq!(value["entries"][0]["Size"], 10);
        assert_eq!(value["total_objects"], 1);
        assert_eq!(value["execution_id"], "exec-0001");
    }

    #[test]
    fn manifest_decode_rejects_count_drift() {
        let mut manifest = Manifest::new(
            &request(),
            "src",
            "dst",
            vec![ManifestEntry::new("in/a.txt", 10), ManifestEntry::new("in/b.txt", 20)],
            created_at(),
        );
        manifest.total_objects = 3;
        let bytes = serde_json::to_vec(&manifest).expect("raw manifest should serialize");

        let error = Manifest::decode(&bytes).expect_err("count drift should fail");
        assert!(error.to_string().contains("total_objects=3"));
    }

    #[test]
    fn manifest_maps_destination_keys() {
        let manifest = Manifest::new(
            &request(),
            "src",
            "dst",
            vec![ManifestEntry::new("in/nested/a.txt", 10)],
            created_at(),
        );
        assert_eq!(
            manifest.destination_key_for(&manifest.entries[0]),
            "out/nested/a.txt"
        );
    }

    #[test]
    fn validation_passes_only_with_matching_count_and_samples() {
        let passed = ValidationResult::evaluate(3, 3, 3, Vec::new(), "out/");
        assert_eq!(passed.status, VerificationStatus::Passed);
        assert_eq!(passed.samples_passed, 3);
        assert!(passed.mismatches.is_empty());

        let short = ValidationResult::evaluate(3, 2, 3, Vec::new(), "out/");
        assert_eq!(short.status, VerificationStatus::Failed);
        assert_eq!(short.mismatches, vec!["out/".to_string()]);
        assert_eq!(short.mismatch_details[0].reason, MismatchReason::CountMismatch);
    }

    #[test]
    fn validation_serializes_with_report_field_names() {
        let result = ValidationResult::evaluate(3, 3, 3, Vec::new(), "out/");
        let value = serde_json::to_value(&result).expect("validation should serialize");
        assert_eq!(value["status"], "PASSED");
        assert_eq!(value["total_expected"], 3);
        assert_eq!(value["total_found"], 3);
        assert_eq!(value["samples_checked"], 3);
        assert_eq!(value["samples_passed"], 3);
    }

    #[test]
    fn state_machine_is_strictly_sequential() {
        assert!(ExecutionState::Listing.can_transition_to(ExecutionState::Transferring));
        assert!(ExecutionState::Reporting.can_transition_to(ExecutionState::Succeeded));
        assert!(ExecutionState::Transferring.can_transition_to(ExecutionState::Failed));
        assert!(!ExecutionState::Listing.can_transition_to(ExecutionState::Validating));
        assert!(!ExecutionState::Transferring.can_transition_to(ExecutionState::Succeeded));
        assert!(!ExecutionState::Succeeded.can_transition_to(ExecutionState::Failed));
    }

    #[test]
    fn report_lists_failed_keys_and_fails_status() {
        let tally: TransferTally = vec![
            TransferResult::succeeded("in/a", "out/a", 10),
            TransferResult::failed(
                "in/b",
                "out/b",
                &ServiceError::access_denied("copy_object", "denied"),
            ),
        ]
        .into_iter()
        .collect();
        let validation = ValidationResult::evaluate(2, 1, 1, Vec::new(), "out/");
        let report = Report::build(
            context(false),
            &tally,
            validation,
            TerminalPolicy::default(),
            created_at(),
        );

        assert_eq!(report.status, VerificationStatus::Failed);
        assert_eq!(report.execution_state, ExecutionState::Succeeded);
        assert_eq!(report.failed_keys, vec!["in/b".to_string()]);
        assert_eq!(report.failed_items[0].error_kind, ErrorKind::AccessDenied);
        assert_eq!(report.succeeded_count, 1);
        assert_eq!(report.bytes_copied, 10);
    }

    #[test]
    fn demotion_policy_fails_execution_on_failed_report() {
        let validation = ValidationResult::evaluate(2, 1, 1, Vec::new(), "out/");
        let report = Report::build(
            context(false),
            &TransferTally::default(),
            validation,
            TerminalPolicy {
                demote_on_validation_failure: true,
            },
            created_at(),
        );
        assert_eq!(report.execution_state, ExecutionState::Failed);
    }

    #[test]
    fn cancelled_execution_never_reports_passed() {
        let validation = ValidationResult::evaluate(0, 0, 0, Vec::new(), "out/");
        let report = Report::build(
            context(true),
            &TransferTally::default(),
            validation,
            TerminalPolicy::default(),
            created_at(),
        );
        assert_eq!(report.status, VerificationStatus::Failed);
        assert_eq!(report.execution_state, ExecutionState::Failed);
    }

    #[test]
    fn report_serializes_external_field_names() {
        let validation = ValidationResult::evaluate(2, 2, 2, Vec::new(), "out/");
        let tally: TransferTally = vec![
            TransferResult::succeeded("in/a", "out/a", 10),
            TransferResult::succeeded("in/b", "out/b", 20),
        ]
        .into_iter()
        .collect();
        let report = Report::build(
            context(false),
            &tally,
            validation,
            TerminalPolicy::default(),
            created_at(),
        );
        let value: serde_json::Value =
            serde_json::from_slice(&report.encode().expect("report should encode"))
                .expect("report should be JSON");

        assert_eq!(value["execution_id"], "exec-0001");
        assert_eq!(value["status"], "PASSED");
        assert_eq!(value["total_objects"], 2);
        assert_eq!(value["total_size_bytes"], 30);
        assert_eq!(value["validation"]["total_found"], 2);
        assert_eq!(value["destination_kms_key_id"], "alias/destination");
        assert!(value.get("source_kms_key_id").is_none());
    }

    #[test]
    fn notification_subject_uses_short_execution_id() {
        let validation = ValidationResult::evaluate(0, 0, 0, Vec::new(), "out/");
        let report = Report::build(
            context(false),
            &TransferTally::default(),
            validation,
            TerminalPolicy::default(),
            created_at(),
        );
        let message = NotificationMessage::from_report(&report, "s3://hub/reports/x/report.json");
        assert_eq!(message.subject(), "S3 Transfer PASSED: exec-000");
    }
}
