//! Tracing setup with a reloadable filter, so the log level can be changed
//! at runtime in both processes.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

pub type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Install the global subscriber. JSON output when `LOG_FORMAT=json`.
pub fn init() -> LogHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (filter, handle) = reload::Layer::new(filter);

    let json = std::env::var("LOG_FORMAT").unwrap_or_default() == "json";
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();

    handle
}

/// Replace the active filter with `level`, e.g. `debug` or `ding=trace,info`.
pub fn set_level(handle: &LogHandle, level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(level).map_err(|e| format!("bad log level {level:?}: {e}"))?;
    handle
        .reload(filter)
        .map_err(|e| format!("reloading log filter: {e}"))?;
    tracing::info!(level, "log level changed");
    Ok(())
}
