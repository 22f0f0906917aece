use std::sync::Arc;

use tracing::{info, warn};
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::contract::{NotificationMessage, Report};
use xacct_transfer_core::storage_keys::report_object_key;

use crate::adapters::manifest_store::ManifestStore;
use crate::adapters::notifier::Notifier;
use crate::error::PipelineError;
use crate::retry::retry_stage;

/// Persists the terminal report and publishes the summary notification.
pub struct Reporter {
    manifests: Arc<dyn ManifestStore>,
    notifier: Option<Arc<dyn Notifier>>,
    stage_retry: BackoffPolicy,
}

impl Reporter {
    pub fn new(
        manifests: Arc<dyn ManifestStore>,
        notifier: Option<Arc<dyn Notifier>>,
        stage_retry: BackoffPolicy,
    ) -> Self {
        Self {
            manifests,
            notifier,
            stage_retry,
        }
    }

    /// Writes the report under `reports/{execution_id}/report.json` and
    /// returns its location.
    pub async fn persist(&self, report: &Report) -> Result<String, PipelineError> {
        let key = report_object_key(&report.execution_id);
        let body = report.encode()?;

        let receipt = retry_stage(&self.stage_retry, "put_report", || {
            self.manifests.put(&key, body.clone())
        })
        .await?;

        let location = self.manifests.location(&receipt.key);
        info!(
            component = "reporter",
            event = "report_written",
            execution_id = %report.execution_id,
            status = report.status.as_str(),
            execution_state = ?report.execution_state,
            report_location = %location,
            "report persisted"
        );
        Ok(location)
    }

    /// Best effort. Returns whether a message was delivered.
    pub async fn notify(&self, message: &NotificationMessage) -> bool {
        let Some(notifier) = self.notifier.as_ref() else {
            return false;
        };

        let body = match serde_json::to_string_pretty(message) {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    component = "reporter",
                    event = "notification_failed",
                    execution_id = %message.execution_id,
                    "failed to serialize notification: {error}"
                );
                return false;
            }
        };

        match notifier.publish(&message.subject(), &body).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    component = "reporter",
                    event = "notification_failed",
                    execution_id = %message.execution_id,
                    error_kind = %error.kind,
                    "{}",
                    error.message
                );
                false
            }
        }
    }
}
