//! Logging setup

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

const DEFAULT_FILTER: &str = "info,xdl_operator=debug,kube=info,tower=warn,hyper=warn";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. With `json` set, every event is
/// written as one JSON object per line.
pub fn init_logging(json: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| Error::Logging(e.to_string()))
}
