use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Registry};

/// Diagnostic output of the pipeline itself.
///
/// **Fields**
/// - `default_filter`: directive used when `RUST_LOG` is not set.
/// - `enable_stdout`: if `false`, no `fmt` layer is installed and
///   diagnostics are discarded.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub default_filter: String,
    pub enable_stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            enable_stdout: true,
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// **Returns**
/// - `Err(..)` if a global subscriber was already installed.
pub fn init_tracing_with_config(config: LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let fmt_layer = config
        .enable_stdout
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    Registry::default().with(filter).with(fmt_layer).try_init()
}

/// Equivalent to [`init_tracing_with_config`] with [`LoggingConfig::default`].
pub fn init_tracing() -> Result<(), TryInitError> {
    init_tracing_with_config(LoggingConfig::default())
}
