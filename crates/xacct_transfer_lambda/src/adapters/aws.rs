//! AWS implementations of the ports: STS broker, S3 object and manifest
//! stores, SNS notifier.

use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, ServerSideEncryption};
use chrono::{DateTime, Utc};
use xacct_transfer_core::error::{classify_error_code, ErrorKind, ServiceError};
use xacct_transfer_core::multipart::PartRange;
use xacct_transfer_core::storage_keys::s3_uri;

use crate::adapters::credentials::{AssumeRoleRequest, CredentialBroker, ScopedCredential};
use crate::adapters::manifest_store::{ManifestStore, PutReceipt};
use crate::adapters::notifier::Notifier;
use crate::adapters::object_store::{
    CompletedPart, DestinationEncryption, ListPage, ObjectLocation, ObjectMetadata, ObjectStore,
    ObjectSummary,
};

const CREDENTIAL_PROVIDER_NAME: &str = "xacct-transfer-broker";

/// Maps an SDK failure onto the shared taxonomy.
///
/// Dispatch and timeout failures never reached the service and are treated
/// as transient faults; service responses are classified by error code, then
/// by HTTP status when the body carried no code (e.g. HEAD responses).
pub fn classify_sdk_error<E>(operation: &str, error: SdkError<E, HttpResponse>) -> ServiceError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let kind = match &error {
        SdkError::TimeoutError(_) => ErrorKind::Timeout,
        SdkError::DispatchFailure(_) => ErrorKind::ServiceFault,
        SdkError::ServiceError(context) => match context.err().code() {
            Some(code) => classify_error_code(code),
            None => classify_status(context.raw().status().as_u16()),
        },
        SdkError::ResponseError(context) => classify_status(context.raw().status().as_u16()),
        _ => ErrorKind::ServiceFault,
    };
    ServiceError::new(kind, operation, DisplayErrorContext(&error).to_string())
}

fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::AccessDenied,
        429 | 503 => ErrorKind::Throttled,
        400 | 404 | 405 | 409 | 411 | 412 | 416 => ErrorKind::InvalidInput,
        408 => ErrorKind::Timeout,
        _ => ErrorKind::ServiceFault,
    }
}

/// `bucket/key` with each key segment percent-encoded, as required by the
/// copy-source header.
pub fn copy_source(location: &ObjectLocation) -> String {
    let encoded: Vec<String> = location
        .key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", location.bucket, encoded.join("/"))
}

fn missing_field(operation: &str, field: &str) -> ServiceError {
    ServiceError::service_fault(operation, format!("response is missing {field}"))
}

pub struct StsCredentialBroker {
    client: aws_sdk_sts::Client,
}

impl StsCredentialBroker {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_sts::Client::new(config),
        }
    }
}

#[async_trait]
impl CredentialBroker for StsCredentialBroker {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<ScopedCredential, ServiceError> {
        let duration_seconds = i32::try_from(request.duration.as_secs()).map_err(|_| {
            ServiceError::new(
                ErrorKind::InvalidInput,
                "sts:AssumeRole",
                "credential duration out of range",
            )
        })?;

        let output = self
            .client
            .assume_role()
            .role_arn(&request.role_ref)
            .role_session_name(&request.session_name)
            .external_id(&request.external_token)
            .duration_seconds(duration_seconds)
            .send()
            .await
            .map_err(|error| classify_sdk_error("sts:AssumeRole", error))?;

        let credentials = output
            .credentials()
            .ok_or_else(|| missing_field("sts:AssumeRole", "Credentials"))?;
        let expires_at = DateTime::<Utc>::from_timestamp(credentials.expiration().secs(), 0)
            .ok_or_else(|| missing_field("sts:AssumeRole", "a valid Expiration"))?;

        Ok(ScopedCredential {
            role_ref: request.role_ref.clone(),
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            issued_at: Utc::now(),
            expires_at,
        })
    }
}

/// S3 object store; each call builds a client bound to the caller's scoped
/// credential on top of the shared SDK config.
pub struct S3ObjectStore {
    base_config: SdkConfig,
}

impl S3ObjectStore {
    pub fn new(base_config: SdkConfig) -> Self {
        Self { base_config }
    }

    fn client_for(&self, credential: &ScopedCredential) -> aws_sdk_s3::Client {
        let expiry = u64::try_from(credential.expires_at.timestamp())
            .ok()
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
        let provider = aws_sdk_s3::config::Credentials::new(
            &credential.access_key_id,
            &credential.secret_access_key,
            Some(credential.session_token.clone()),
            expiry,
            CREDENTIAL_PROVIDER_NAME,
        );
        let config = aws_sdk_s3::config::Builder::from(&self.base_config)
            .credentials_provider(provider)
            .build();
        aws_sdk_s3::Client::from_conf(config)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(
        &self,
        credential: &ScopedCredential,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> Result<ListPage, ServiceError> {
        let output = self
            .client_for(credential)
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix((!prefix.is_empty()).then(|| prefix.to_string()))
            .set_continuation_token(cursor.map(str::to_string))
            .send()
            .await
            .map_err(|error| classify_sdk_error("s3:ListObjectsV2", error))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    size: object.size().and_then(|size| u64::try_from(size).ok())?,
                    etag: object.e_tag().map(str::to_string),
                })
            })
            .collect();

        let next_cursor = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            objects,
            next_cursor,
        })
    }

    async fn head_object(
        &self,
        credential: &ScopedCredential,
        location: &ObjectLocation,
    ) -> Result<Option<ObjectMetadata>, ServiceError> {
        let response = self
            .client_for(credential)
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await;

        match response {
            Ok(output) => Ok(Some(ObjectMetadata {
                size: output
                    .content_length()
                    .and_then(|size| u64::try_from(size).ok())
                    .unwrap_or(0),
                etag: output.e_tag().map(str::to_string),
            })),
            Err(SdkError::ServiceError(context)) if context.err().is_not_found() => Ok(None),
            Err(error) => Err(classify_sdk_error("s3:HeadObject", error)),
        }
    }

    async fn copy_object(
        &self,
        credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<(), ServiceError> {
        let mut request = self
            .client_for(credential)
            .copy_object()
            .copy_source(copy_source(source))
            .bucket(&destination.bucket)
            .key(&destination.key);
        if let Some(key_id) = encryption.kms_key_id.as_deref() {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(|error| classify_sdk_error("s3:CopyObject", error))
    }

    async fn create_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        encryption: &DestinationEncryption,
    ) -> Result<String, ServiceError> {
        let mut request = self
            .client_for(credential)
            .create_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key);
        if let Some(key_id) = encryption.kms_key_id.as_deref() {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }

        let output = request
            .send()
            .await
            .map_err(|error| classify_sdk_error("s3:CreateMultipartUpload", error))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("s3:CreateMultipartUpload", "UploadId"))
    }

    async fn upload_part_copy(
        &self,
        credential: &ScopedCredential,
        source: &ObjectLocation,
        destination: &ObjectLocation,
        upload_id: &str,
        part: &PartRange,
    ) -> Result<CompletedPart, ServiceError> {
        let part_number = i32::try_from(part.part_number).map_err(|_| {
            ServiceError::new(
                ErrorKind::ObjectTooLarge,
                "s3:UploadPartCopy",
                "part number out of range",
            )
        })?;

        let output = self
            .client_for(credential)
            .upload_part_copy()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .copy_source(copy_source(source))
            .copy_source_range(part.http_range())
            .send()
            .await
            .map_err(|error| classify_sdk_error("s3:UploadPartCopy", error))?;

        let etag = output
            .copy_part_result()
            .and_then(|result| result.e_tag())
            .ok_or_else(|| missing_field("s3:UploadPartCopy", "CopyPartResult.ETag"))?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ServiceError> {
        let completed: Vec<aws_sdk_s3::types::CompletedPart> = parts
            .iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(i32::try_from(part.part_number).unwrap_or(i32::MAX))
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        self.client_for(credential)
            .complete_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map(|_| ())
            .map_err(|error| classify_sdk_error("s3:CompleteMultipartUpload", error))
    }

    async fn abort_multipart_upload(
        &self,
        credential: &ScopedCredential,
        destination: &ObjectLocation,
        upload_id: &str,
    ) -> Result<(), ServiceError> {
        self.client_for(credential)
            .abort_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|error| classify_sdk_error("s3:AbortMultipartUpload", error))
    }
}

/// Manifest and report store in the pipeline's own account.
pub struct S3ManifestStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    kms_key_id: Option<String>,
}

impl S3ManifestStore {
    pub fn new(config: &SdkConfig, bucket: impl Into<String>, kms_key_id: Option<String>) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
            bucket: bucket.into(),
            kms_key_id,
        }
    }
}

#[async_trait]
impl ManifestStore for S3ManifestStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<PutReceipt, ServiceError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body));
        if let Some(key_id) = self.kms_key_id.as_deref() {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }

        let output = request
            .send()
            .await
            .map_err(|error| classify_sdk_error("s3:PutObject", error))?;
        Ok(PutReceipt {
            key: key.to_string(),
            version_id: output.version_id().map(str::to_string),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| classify_sdk_error("s3:GetObject", error))?;
        let body = output.body.collect().await.map_err(|error| {
            ServiceError::service_fault("s3:GetObject", format!("failed to read body: {error}"))
        })?;
        Ok(body.into_bytes().to_vec())
    }

    fn location(&self, key: &str) -> String {
        s3_uri(&self.bucket, key)
    }
}

pub struct SnsNotifier {
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(config: &SdkConfig, topic_arn: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sns::Client::new(config),
            topic_arn: topic_arn.into(),
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn publish(&self, subject: &str, message: &str) -> Result<(), ServiceError> {
        self.client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(subject)
            .message(message)
            .send()
            .await
            .map(|_| ())
            .map_err(|error| classify_sdk_error("sns:Publish", error))
    }
}
