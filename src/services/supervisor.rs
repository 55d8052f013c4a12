//! Fault isolation for spawned work.
//!
//! Every delivery, bus receive loop and bus handler call runs through
//! [`run_isolated`], so a panic is logged with its scope and stops there.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::error;

/// Await `fut`, converting a panic into `None` after logging it.
pub async fn run_isolated<F>(scope: &str, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Some(output),
        Err(panic) => {
            error!(scope, panic = %panic_message(&panic), "task panicked; fault contained");
            None
        }
    }
}

/// Spawn `fut` on the runtime under [`run_isolated`].
pub fn spawn_isolated<F>(scope: impl Into<String>, fut: F) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let scope = scope.into();
    tokio::spawn(async move { run_isolated(&scope, fut).await })
}

pub fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
