//! Driver calls on the blocking pool
//!
//! Engine drivers block, so each call runs on tokio's blocking pool and is
//! abandoned when the command timeout elapses. A timeout surfaces as a
//! communication timeout and is retried like any transient failure.

use crate::core::command::Command;
use crate::core::error::{codes, EngineError, Result};
use crate::core::retry::RetryPolicy;
use std::time::Duration;

/// Run a blocking driver call with a timeout
pub(crate) async fn run_blocking<T, F>(timeout: Duration, call: F) -> std::result::Result<T, EngineError>
where
    F: FnOnce() -> std::result::Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(call);

    // Use select! to abort task on timeout
    tokio::select! {
        result = &mut task => {
            result.map_err(|e| EngineError::new(codes::GENERAL, format!("Task join error: {}", e)))?
        }
        _ = tokio::time::sleep(timeout) => {
            task.abort();
            Err(EngineError::new(
                codes::COMMUNICATION_TIMEOUT,
                format!("driver call timed out after {}ms", timeout.as_millis()),
            ))
        }
    }
}

/// Submit a command through the retry policy.
///
/// Each attempt calls `call` on the blocking pool with a clone of `state` and
/// the command as rewritten by the policy.
pub(crate) async fn submit<S, T, F>(retry: &RetryPolicy, command: &Command, state: S, call: F) -> Result<T>
where
    S: Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(S, Command) -> std::result::Result<T, EngineError> + Clone + Send + Sync + 'static,
{
    retry
        .run(command, |current| {
            let state = state.clone();
            let call = call.clone();
            let timeout = current.timeout();
            async move { run_blocking(timeout, move || call(state, current)).await }
        })
        .await
}
