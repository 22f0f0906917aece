//! Environment-driven configuration, loaded once per process.

use std::time::Duration;

use thiserror::Error;
use xacct_transfer_core::backoff::{BackoffPolicy, Jitter, STAGE_MAX_DELAY, THROTTLE_MAX_ATTEMPTS};
use xacct_transfer_core::contract::TerminalPolicy;
use xacct_transfer_core::multipart::{
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE, MAX_PART_SIZE, MIN_PART_SIZE,
};
use xacct_transfer_core::sampling::DEFAULT_SAMPLE_SIZE;

pub const DEFAULT_MAX_CONCURRENCY: usize = 40;
pub const MAX_CONCURRENCY_LIMIT: usize = 1_000;
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(900);
pub const DEFAULT_CREDENTIAL_DURATION: Duration = Duration::from_secs(3600);
pub const DEFAULT_CREDENTIAL_REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be configured")]
    Missing(&'static str),
    #[error("{name}='{value}' is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, PartialEq)]
pub struct TransferConfig {
    pub source_role_arn: String,
    pub destination_role_arn: String,
    pub external_id: String,
    pub source_bucket: String,
    pub source_prefix: String,
    pub destination_bucket: String,
    pub destination_prefix: String,
    pub manifest_bucket: String,
    pub manifest_kms_key_id: Option<String>,
    pub source_kms_key_id: Option<String>,
    pub destination_kms_key_id: Option<String>,
    pub max_concurrency: usize,
    pub multipart_threshold_bytes: u64,
    pub multipart_part_size_bytes: u64,
    pub throttle_retry: BackoffPolicy,
    pub stage_retry: BackoffPolicy,
    pub item_timeout: Duration,
    pub transfer_stage_timeout: Option<Duration>,
    pub validation_sample_size: usize,
    pub credential_duration: Duration,
    pub credential_refresh_margin: Duration,
    pub sns_topic_arn: Option<String>,
    pub terminal_policy: TerminalPolicy,
}

impl std::fmt::Debug for TransferConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferConfig")
            .field("source_role_arn", &self.source_role_arn)
            .field("destination_role_arn", &self.destination_role_arn)
            .field("external_id", &"<redacted>")
            .field("source_bucket", &self.source_bucket)
            .field("source_prefix", &self.source_prefix)
            .field("destination_bucket", &self.destination_bucket)
            .field("destination_prefix", &self.destination_prefix)
            .field("manifest_bucket", &self.manifest_bucket)
            .field("max_concurrency", &self.max_concurrency)
            .field("multipart_threshold_bytes", &self.multipart_threshold_bytes)
            .field("multipart_part_size_bytes", &self.multipart_part_size_bytes)
            .field("item_timeout", &self.item_timeout)
            .field("transfer_stage_timeout", &self.transfer_stage_timeout)
            .field("validation_sample_size", &self.validation_sample_size)
            .field("sns_topic_arn", &self.sns_topic_arn)
            .finish_non_exhaustive()
    }
}

impl TransferConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Blank values are
    /// treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup: &lookup };

        let throttle_retry = BackoffPolicy {
            max_attempts: vars.parse_or("MAX_RETRY_ATTEMPTS", THROTTLE_MAX_ATTEMPTS)?,
            base_delay: vars.seconds_or("RETRY_BASE_DELAY", 1.0)?,
            max_delay: vars.seconds_or("RETRY_MAX_DELAY", 60.0)?,
            jitter: Jitter::Full,
        };
        if throttle_retry.max_attempts == 0 {
            return Err(vars.invalid("MAX_RETRY_ATTEMPTS", "must be at least 1"));
        }
        if throttle_retry.base_delay > throttle_retry.max_delay {
            return Err(vars.invalid("RETRY_BASE_DELAY", "must not exceed RETRY_MAX_DELAY"));
        }

        let stage_retry = BackoffPolicy {
            max_attempts: vars.parse_or("STAGE_RETRY_ATTEMPTS", 3u32)?,
            base_delay: vars.seconds_or("STAGE_RETRY_BASE_DELAY", 2.0)?,
            max_delay: STAGE_MAX_DELAY,
            jitter: Jitter::None,
        };
        if stage_retry.max_attempts == 0 {
            return Err(vars.invalid("STAGE_RETRY_ATTEMPTS", "must be at least 1"));
        }

        let max_concurrency = vars.parse_or("MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)?;
        if !(1..=MAX_CONCURRENCY_LIMIT).contains(&max_concurrency) {
            return Err(vars.invalid(
                "MAX_CONCURRENCY",
                &format!("must be between 1 and {MAX_CONCURRENCY_LIMIT}"),
            ));
        }

        let multipart_part_size_bytes =
            vars.parse_or("MULTIPART_CHUNK_SIZE_BYTES", DEFAULT_PART_SIZE)?;
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&multipart_part_size_bytes) {
            return Err(vars.invalid(
                "MULTIPART_CHUNK_SIZE_BYTES",
                &format!("must be between {MIN_PART_SIZE} and {MAX_PART_SIZE}"),
            ));
        }

        let multipart_threshold_bytes =
            vars.parse_or("MULTIPART_THRESHOLD_BYTES", DEFAULT_MULTIPART_THRESHOLD)?;
        if multipart_threshold_bytes == 0 || multipart_threshold_bytes > MAX_PART_SIZE {
            return Err(vars.invalid(
                "MULTIPART_THRESHOLD_BYTES",
                &format!("must be between 1 and {MAX_PART_SIZE}"),
            ));
        }

        let credential_duration = Duration::from_secs(
            vars.parse_or("CREDENTIAL_DURATION_SECONDS", DEFAULT_CREDENTIAL_DURATION.as_secs())?,
        );
        if !(900..=43_200).contains(&credential_duration.as_secs()) {
            return Err(vars.invalid(
                "CREDENTIAL_DURATION_SECONDS",
                "must be between 900 and 43200",
            ));
        }
        let credential_refresh_margin = Duration::from_secs(vars.parse_or(
            "CREDENTIAL_REFRESH_MARGIN_SECONDS",
            DEFAULT_CREDENTIAL_REFRESH_MARGIN.as_secs(),
        )?);
        if credential_refresh_margin >= credential_duration {
            return Err(vars.invalid(
                "CREDENTIAL_REFRESH_MARGIN_SECONDS",
                "must be shorter than CREDENTIAL_DURATION_SECONDS",
            ));
        }

        let item_timeout = Duration::from_secs(
            vars.parse_or("ITEM_TIMEOUT_SECONDS", DEFAULT_ITEM_TIMEOUT.as_secs())?,
        );
        if item_timeout.is_zero() {
            return Err(vars.invalid("ITEM_TIMEOUT_SECONDS", "must be positive"));
        }
        let transfer_stage_timeout = vars
            .parse::<u64>("TRANSFER_STAGE_TIMEOUT_SECONDS")?
            .map(Duration::from_secs);

        Ok(Self {
            source_role_arn: vars.required("SOURCE_ROLE_ARN")?,
            destination_role_arn: vars.required("DESTINATION_ROLE_ARN")?,
            external_id: vars.required("EXTERNAL_ID")?,
            source_bucket: vars.required("SOURCE_BUCKET")?,
            source_prefix: vars.raw("SOURCE_PREFIX").unwrap_or_default(),
            destination_bucket: vars.required("DESTINATION_BUCKET")?,
            destination_prefix: vars.raw("DESTINATION_PREFIX").unwrap_or_default(),
            manifest_bucket: vars.required("MANIFEST_BUCKET")?,
            manifest_kms_key_id: vars.raw("MANIFEST_KMS_KEY_ID"),
            source_kms_key_id: vars.raw("SOURCE_KMS_KEY_ID"),
            destination_kms_key_id: vars.raw("DESTINATION_KMS_KEY_ID"),
            max_concurrency,
            multipart_threshold_bytes,
            multipart_part_size_bytes,
            throttle_retry,
            stage_retry,
            item_timeout,
            transfer_stage_timeout,
            validation_sample_size: vars.parse_or("VALIDATION_SAMPLE_SIZE", DEFAULT_SAMPLE_SIZE)?,
            credential_duration,
            credential_refresh_margin,
            sns_topic_arn: vars.raw("SNS_TOPIC_ARN"),
            terminal_policy: TerminalPolicy {
                demote_on_validation_failure: vars
                    .parse_or("DEMOTE_ON_VALIDATION_FAILURE", false)?,
            },
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.raw(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(name) else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|error| ConfigError::Invalid {
                name,
                value,
                reason: error.to_string(),
            })
    }

    fn parse_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(name)?.unwrap_or(default))
    }

    fn seconds_or(&self, name: &'static str, default: f64) -> Result<Duration, ConfigError> {
        let seconds = self.parse_or(name, default)?;
        Duration::try_from_secs_f64(seconds).map_err(|error| ConfigError::Invalid {
            name,
            value: seconds.to_string(),
            reason: error.to_string(),
        })
    }

    fn invalid(&self, name: &'static str, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            name,
            value: self.raw(name).unwrap_or_default(),
            reason: reason.to_string(),
        }
    }
}
