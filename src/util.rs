use std::any::Any;

/// Extract a human-readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("job panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("job panicked: {message}");
    }
    "job panicked".to_owned()
}
