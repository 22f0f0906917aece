use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xacct_transfer_lambda::adapters::aws::{
    S3ManifestStore, S3ObjectStore, SnsNotifier, StsCredentialBroker,
};
use xacct_transfer_lambda::adapters::notifier::Notifier;
use xacct_transfer_lambda::config::TransferConfig;
use xacct_transfer_lambda::handlers::orchestrator::{Orchestrator, PipelineDeps};
use xacct_transfer_lambda::handlers::start::handle_start_event;
use xacct_transfer_lambda::logging;

/// Time reserved after cancellation for validation and the report write.
const DEADLINE_RESERVE: Duration = Duration::from_secs(90);

async fn handle_request(
    event: LambdaEvent<Value>,
    orchestrator: Arc<Orchestrator>,
) -> Result<Value, Error> {
    let cancel = CancellationToken::new();
    let watchdog = arm_deadline(cancel.clone(), event.context.deadline);

    let result = handle_start_event(event.payload, &orchestrator, cancel).await;
    watchdog.abort();
    result.map_err(|error| Error::from(error.to_string()))
}

/// Cancels the execution shortly before the invocation deadline.
fn arm_deadline(cancel: CancellationToken, deadline_ms: u64) -> tokio::task::JoinHandle<()> {
    let remaining = remaining_until(deadline_ms, SystemTime::now());
    tokio::spawn(async move {
        let Some(wait) = remaining.and_then(|left| left.checked_sub(DEADLINE_RESERVE)) else {
            warn!(
                component = "runtime",
                event = "deadline_tight",
                "invocation deadline leaves no reserve; cancelling immediately"
            );
            cancel.cancel();
            return;
        };
        tokio::time::sleep(wait).await;
        warn!(
            component = "runtime",
            event = "deadline_cancel",
            "approaching invocation deadline; cancelling transfer stage"
        );
        cancel.cancel();
    })
}

fn remaining_until(deadline_ms: u64, now: SystemTime) -> Option<Duration> {
    let deadline = UNIX_EPOCH + Duration::from_millis(deadline_ms);
    deadline.duration_since(now).ok()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    logging::init(&default_level);

    let config = TransferConfig::from_env()?;
    let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let notifier = config
        .sns_topic_arn
        .as_ref()
        .map(|topic| Arc::new(SnsNotifier::new(&sdk_config, topic)) as Arc<dyn Notifier>);
    let deps = PipelineDeps {
        broker: Arc::new(StsCredentialBroker::new(&sdk_config)),
        objects: Arc::new(S3ObjectStore::new(sdk_config.clone())),
        manifests: Arc::new(S3ManifestStore::new(
            &sdk_config,
            config.manifest_bucket.clone(),
            config.manifest_kms_key_id.clone(),
        )),
        notifier,
    };

    info!(
        component = "runtime",
        event = "runtime_ready",
        source_bucket = %config.source_bucket,
        destination_bucket = %config.destination_bucket,
        max_concurrency = config.max_concurrency,
        "transfer runtime initialized"
    );

    let orchestrator = Arc::new(Orchestrator::new(config, deps));
    lambda_runtime::run(service_fn(move |event| {
        handle_request(event, Arc::clone(&orchestrator))
    }))
    .await
}
