// Handlers and tasks
//
// INTENTION: Normalize application callbacks, synchronous or asynchronous,
// into a single boxed-future form so the dispatch engine and the scheduler
// invoke every one of them the same way.

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::util::duration::Seconds;

/// Future returned by every handler and task
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Event handler invoked with `(event, data)`
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(String, Value) -> HandlerFuture + Send + Sync>);

impl Handler {
    /// Wrap an async callback
    pub fn from_async<F, Fut>(callback: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Handler(Arc::new(move |event, data| Box::pin(callback(event, data))))
    }

    /// Wrap a plain function. It runs when the dispatched task is first
    /// polled, not inside the dispatch loop.
    pub fn from_sync<F>(callback: F) -> Self
    where
        F: Fn(String, Value) -> Result<()> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        Handler(Arc::new(move |event, data| {
            let callback = callback.clone();
            Box::pin(async move { callback(event, data) })
        }))
    }

    pub fn invoke(&self, event: String, data: Value) -> HandlerFuture {
        (self.0)(event, data)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// A unit of background work handed to the scheduler. It is called on the
/// scheduler thread, so building the future may touch the runtime.
pub type TaskFactory = Box<dyn FnOnce() -> HandlerFuture + Send>;

pub(crate) fn task_from_async<F, Fut>(task: F) -> TaskFactory
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(task()))
}

pub(crate) fn task_from_sync<F>(task: F) -> TaskFactory
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    Box::new(move || Box::pin(async move { task() }))
}

/// Run `body`, wait for it, sleep `period`, forever. A failing iteration is
/// reported through `on_error` and the loop carries on.
pub(crate) fn periodic<F, Fut>(
    period: Seconds,
    body: F,
    on_error: impl Fn(anyhow::Error) + Send + Sync + 'static,
) -> TaskFactory
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let period = period.as_duration();
    Box::new(move || Box::pin(run_periodic(period, body, on_error)))
}

async fn run_periodic<F, Fut, E>(period: Duration, body: F, on_error: E) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
    E: Fn(anyhow::Error),
{
    loop {
        if let Err(e) = body().await {
            on_error(e);
        }
        tokio::time::sleep(period).await;
    }
}

/// Suspend the calling task without blocking the rest of the scheduler
pub fn sleep(duration: impl Into<Seconds>) -> tokio::time::Sleep {
    tokio::time::sleep(duration.into().as_duration())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sync_and_async_handlers_share_one_contract() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sync_handler = Handler::from_sync(move |event, data| {
            assert_eq!(event, "nav/heading");
            assert_eq!(data, json!(42));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let counter = calls.clone();
        let async_handler = Handler::from_async(move |_event, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(10, Ordering::SeqCst);
                Ok(())
            }
        });

        for handler in [sync_handler, async_handler] {
            handler.invoke("nav/heading".into(), json!(42)).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_sync_handler_is_deferred_until_polled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Handler::from_sync(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let pending = handler.invoke("a".into(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        pending.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_survives_failing_iterations() {
        let runs = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let failed = failures.clone();
        let task = periodic(
            Seconds::from(1u64),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n % 2 == 0 {
                        Err(anyhow!("sensor not ready"))
                    } else {
                        Ok(())
                    }
                }
            },
            move |_| {
                failed.fetch_add(1, Ordering::SeqCst);
            },
        );

        let handle = tokio::spawn(task());
        tokio::time::sleep(Duration::from_millis(4500)).await;
        handle.abort();

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }
}
