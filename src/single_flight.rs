//! One-in-flight guard.
//!
//! Concurrent callers of [`SingleFlight::run`] share a single execution of the
//! work. The work runs on its own task, so it completes even if every caller
//! stops waiting, and the task empties the slot itself once the work is done.
//! Every waiter therefore observes the slot already cleared.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{PreviewError, Result};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlight<T: Clone> {
    ticket: u64,
    future: SharedResult<T>,
}

pub struct SingleFlight<T: Clone> {
    name: &'static str,
    slot: Arc<Mutex<Option<InFlight<T>>>>,
    tickets: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(None)),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Return `ready()` if it yields a value, else join the in-flight call, else
    /// start `work`. `ready` is evaluated under the slot lock, so a result the
    /// work published just before finishing is never missed.
    pub async fn run<R, W, Fut>(&self, ready: R, work: W) -> Result<T>
    where
        R: FnOnce() -> Option<T> + Send,
        W: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let future = {
            let mut slot = self.slot.lock();
            if let Some(value) = ready() {
                return Ok(value);
            }
            match slot.as_ref() {
                Some(in_flight) => {
                    tracing::debug!(guard = self.name, "joining in-flight call");
                    in_flight.future.clone()
                }
                None => {
                    let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                    let future = self.spawn(ticket, work());
                    *slot = Some(InFlight {
                        ticket,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    fn spawn<Fut>(&self, ticket: u64, work: Fut) -> SharedResult<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let slot = Arc::clone(&self.slot);
        let name = self.name;
        let handle = tokio::spawn(async move {
            // Cleared on unwind as well, so a panicking task cannot wedge the slot.
            let release = Release { slot, ticket };
            let outcome = work.await;
            drop(release);
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(PreviewError::Internal(format!("{name} task failed: {e}"))),
            }
        }
        .boxed()
        .shared()
    }
}

struct Release<T: Clone> {
    slot: Arc<Mutex<Option<InFlight<T>>>>,
    ticket: u64,
}

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|f| f.ticket == self.ticket) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let guard = Arc::new(SingleFlight::<u32>::new("test"));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = Arc::clone(&guard);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                guard
                    .run(
                        || None,
                        move || async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(7)
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!guard.is_running());
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_allows_retry() {
        let guard = SingleFlight::<u32>::new("test");

        let (a, b) = tokio::join!(
            guard.run(|| None, || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(PreviewError::Boot("no wasm".into()))
            }),
            guard.run(|| None, || async { Ok(1) }),
        );
        assert_eq!(a, Err(PreviewError::Boot("no wasm".into())));
        assert_eq!(b, a);

        let retry = guard.run(|| None, || async { Ok(2) }).await;
        assert_eq!(retry, Ok(2));
    }

    #[tokio::test]
    async fn ready_value_skips_work() {
        let guard = SingleFlight::<u32>::new("test");
        let out = guard
            .run(|| Some(9), || async {
                Err(PreviewError::Internal("work must not start".into()))
            })
            .await;
        assert_eq!(out, Ok(9));
        assert!(!guard.is_running());
    }

    async fn explode() -> Result<u32> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_work_becomes_internal_error() {
        let guard = SingleFlight::<u32>::new("boot");
        let out = guard.run(|| None, explode).await;
        assert!(matches!(out, Err(PreviewError::Internal(msg)) if msg.starts_with("boot task failed")));
        assert!(!guard.is_running());
    }
}
