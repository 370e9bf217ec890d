//! Telemetry helpers for structured logging and tracing.

/// Initialize tracing. Applications can install their own subscriber; this
/// helper installs a default env-filtered fmt subscriber if none is set.
///
/// The components never install a subscriber themselves; every log call is a
/// plain `tracing` event and costs nothing without one.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

/// Extract a readable message from a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
