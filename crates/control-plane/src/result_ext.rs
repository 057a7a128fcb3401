//! Logging helper for fallible operations whose error is handled elsewhere
//! or deliberately dropped.

use std::fmt::Display;
use tracing::error;

/// Adds `log` to `Result`, recording the error with the caller's location.
pub trait ResultExt<T, E> {
    /// Log the error with `context` if this is an `Err`, returning `self`.
    ///
    /// ```ignore
    /// use execflow_control_plane::result_ext::ResultExt;
    ///
    /// let _ = store.save_checkpoint(&run_id, &state).await.log("saving checkpoint");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "execflow_control_plane",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_passes_through() {
        let result: Result<i32, &str> = Ok(42);
        assert_eq!(result.log("reading seq").unwrap(), 42);
    }

    #[test]
    fn test_err_is_preserved() {
        let result: Result<i32, String> = Err("disk full".to_string());
        assert_eq!(result.log("appending event").unwrap_err(), "disk full");
    }
}
