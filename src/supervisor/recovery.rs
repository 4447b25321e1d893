//! Panic containment for worker threads and hook calls.
//!
//! A panicking hook must cost one worker, never the engine: the panic is
//! caught at the worker boundary, logged, and turned into a crash exit that
//! the restart policy then evaluates.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::types::{Error, Result};

/// Run `operation`, converting a panic into [`Error::Internal`].
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "panic recovered"
            );
            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Best-effort text of a panic payload.
pub fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_passes_results_through() {
        assert_eq!(with_recovery(|| Ok(42), "op").unwrap(), 42);
        let err = with_recovery::<_, ()>(|| Err(Error::processing("nope")), "op").unwrap_err();
        assert!(matches!(err, Error::Processing(_)));
    }

    #[test]
    fn test_with_recovery_catches_panics() {
        let result: Result<()> = with_recovery(|| panic!("segment PID missing"), "worker adt-in#0");
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("panic in worker adt-in#0"));
        assert!(msg.contains("segment PID missing"));
    }

    #[test]
    fn test_extract_panic_message() {
        let payload = catch_unwind(|| panic!("{}-{}", "formatted", 7)).unwrap_err();
        assert_eq!(extract_panic_message(payload.as_ref()), "formatted-7");

        let payload = catch_unwind(|| std::panic::panic_any(17_u32)).unwrap_err();
        assert!(extract_panic_message(payload.as_ref()).contains("unknown panic"));
    }
}
