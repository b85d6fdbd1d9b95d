// Panic isolation for user-supplied handlers
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed
    Success(T),
    /// Execution panicked
    Panicked(String),
}

/// Execute a closure with panic isolation
///
/// A panicking handler must not take the worker loop down with it: the
/// panic is caught and returned as `PanicGuardResult::Panicked`.
pub fn execute_guarded<F, T>(f: F) -> PanicGuardResult<T>
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => PanicGuardResult::Success(result),
        Err(payload) => {
            let panic_msg = panic_message(payload);
            error!(panic_msg = %panic_msg, "Handler panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

/// Await a future with panic isolation
pub async fn execute_guarded_async<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => PanicGuardResult::Success(result),
        Err(payload) => {
            let panic_msg = panic_message(payload);
            error!(panic_msg = %panic_msg, "Async handler panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_closure_catches_panic() {
        let result = execute_guarded(|| -> u32 { panic!("boom") });
        assert!(matches!(result, PanicGuardResult::Panicked(msg) if msg == "boom"));

        let result = execute_guarded(|| 7);
        assert!(matches!(result, PanicGuardResult::Success(7)));
    }

    #[tokio::test]
    async fn test_guarded_future_catches_panic() {
        let result = execute_guarded_async(async {
            tokio::task::yield_now().await;
            panic!("async {}", "boom");
        })
        .await;
        let _: &PanicGuardResult<()> = &result;
        assert!(matches!(result, PanicGuardResult::Panicked(msg) if msg == "async boom"));

        let result = execute_guarded_async(async { 42 }).await;
        assert!(matches!(result, PanicGuardResult::Success(42)));
    }
}
