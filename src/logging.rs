//! xtunneld/src/logging.rs
//! Logging initialization and runtime updates.

use std::sync::Mutex;
use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{
    filter::EnvFilter, fmt, reload::Handle as ReloadHandle, reload::Layer as ReloadLayer,
};

static LOG_INIT: Once = Once::new();

lazy_static::lazy_static! {
    static ref RELOAD_HANDLE: Mutex<Option<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
        Mutex::new(None);
}

/// Initialize logging once for the process. Safe to call more than once;
/// only the first call takes effect.
pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::new(default);
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry()
            .with(reload_layer)
            .with(fmt::layer());
        tracing::subscriber::set_global_default(subscriber).unwrap();
        *RELOAD_HANDLE.lock().unwrap() = Some(handle);
    });
}

/// Change the active log level at runtime.
pub fn set_log_level(level: &str) -> Result<(), String> {
    match RELOAD_HANDLE.lock().unwrap().as_ref() {
        Some(handle) => handle
            .reload(EnvFilter::new(level))
            .map_err(|e| e.to_string()),
        None => Err("logging not initialized".to_string()),
    }
}
