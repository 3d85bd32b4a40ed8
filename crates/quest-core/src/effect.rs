//! Side effects whose failure must never change the caller's outcome.

use std::fmt::Display;
use std::future::Future;

/// Await `effect`, logging and swallowing any error.
///
/// Use only for effects such as metrics or push notifications. Anything the
/// caller's correctness depends on must propagate its error instead.
pub async fn best_effort<T, E, F>(operation: &'static str, effect: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match effect.await {
        Ok(value) => Some(value),
        Err(e) => {
            ::tracing::warn!(operation, error = %e, "best-effort operation failed");
            None
        }
    }
}
