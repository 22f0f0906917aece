use tracing_subscriber::EnvFilter;

/// Initialize JSON logging for the Lambda runtime.
///
/// Uses `RUST_LOG` if set, otherwise falls back to `default_level`. Safe to
/// call more than once; later calls are ignored.
pub fn init(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_current_span(false)
        .without_time()
        .try_init();
}
