//! Small helpers shared across modules, mirroring `zng-task`'s `crate_util.rs`.

/// Converts a [`std::panic::catch_unwind`] payload to a str.
pub(crate) fn panic_str(payload: &(dyn std::any::Any + Send + 'static)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<unknown-panic-message-type>"
    }
}
