use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use xacct_transfer_core::backoff::BackoffPolicy;
use xacct_transfer_core::error::{ErrorKind, ServiceError};

use crate::retry::retry_throttled;

/// Short-lived credential for one role.
///
/// `Debug` never prints the secret parts.
#[derive(Clone, PartialEq, Eq)]
pub struct ScopedCredential {
    pub role_ref: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ScopedCredential {
    /// True when the credential is already expired or expires within `margin`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(horizon) => self.expires_at <= horizon,
            None => true,
        }
    }
}

impl fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredential")
            .field("role_ref", &self.role_ref)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_ref: String,
    pub external_token: String,
    pub session_name: String,
    pub duration: Duration,
}

impl AssumeRoleRequest {
    /// Rejects requests without the shared external token before any call is
    /// made.
    pub fn new(
        role_ref: impl Into<String>,
        external_token: impl Into<String>,
        session_name: impl Into<String>,
        duration: Duration,
    ) -> Result<Self, ServiceError> {
        let role_ref = role_ref.into();
        let external_token = external_token.into();
        if role_ref.trim().is_empty() {
            return Err(ServiceError::new(
                ErrorKind::InvalidInput,
                "assume_role",
                "role reference must not be empty",
            ));
        }
        if external_token.trim().is_empty() {
            return Err(ServiceError::new(
                ErrorKind::InvalidInput,
                "assume_role",
                format!("external token is required to assume {role_ref}"),
            ));
        }
        Ok(Self {
            role_ref,
            external_token,
            session_name: session_name.into(),
            duration,
        })
    }
}

impl fmt::Debug for AssumeRoleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssumeRoleRequest")
            .field("role_ref", &self.role_ref)
            .field("external_token", &"<redacted>")
            .field("session_name", &self.session_name)
            .field("duration", &self.duration)
            .finish()
    }
}

/// `{stage}-{first 8 chars of execution id}`.
pub fn session_name(stage: &str, execution_id: &str) -> String {
    let short_id: String = execution_id.chars().take(8).collect();
    format!("{stage}-{short_id}")
}

#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<ScopedCredential, ServiceError>;
}

/// Holds the credential for one role across a stage and re-acquires it once
/// it gets within `refresh_margin` of expiry.
pub struct CredentialLease {
    broker: Arc<dyn CredentialBroker>,
    request: AssumeRoleRequest,
    refresh_margin: Duration,
    throttle: BackoffPolicy,
    current: Mutex<Option<ScopedCredential>>,
}

impl CredentialLease {
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        request: AssumeRoleRequest,
        refresh_margin: Duration,
        throttle: BackoffPolicy,
    ) -> Self {
        Self {
            broker,
            request,
            refresh_margin,
            throttle,
            current: Mutex::new(None),
        }
    }

    /// Returns a credential valid for at least `refresh_margin`.
    ///
    /// Concurrent callers wait on the same refresh instead of each issuing
    /// their own assume-role call.
    pub async fn get(&self) -> Result<ScopedCredential, ServiceError> {
        let mut current = self.current.lock().await;
        if let Some(credential) = current.as_ref() {
            if !credential.expires_within(Utc::now(), self.refresh_margin) {
                return Ok(credential.clone());
            }
            debug!(
                component = "credential_lease",
                event = "refresh",
                role_ref = %self.request.role_ref,
                expires_at = %credential.expires_at,
                "credential close to expiry"
            );
        }

        let broker = Arc::clone(&self.broker);
        let request = &self.request;
        let credential = retry_throttled(&self.throttle, "assume_role", || {
            let broker = Arc::clone(&broker);
            async move { broker.assume_role(request).await }
        })
        .await?;

        info!(
            component = "credential_lease",
            event = "acquired",
            role_ref = %credential.role_ref,
            session_name = %self.request.session_name,
            expires_at = %credential.expires_at,
            "scoped credential acquired"
        );
        *current = Some(credential.clone());
        Ok(credential)
    }
}
