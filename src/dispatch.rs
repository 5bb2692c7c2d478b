//! Bounded-concurrency admission control for outbound requests.
//!
//! At most `capacity` dispatched tasks run at once. Callers beyond that wait
//! in arrival order: `tokio::sync::Semaphore` is fair, so permits are handed
//! out FIFO. A task's slot is held by an owned permit that moves into the
//! spawned task and is released when the task finishes, whether it returns
//! normally or panics.

use snafu::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::emit;
use crate::error::{ForwardError, QueueClosedSnafu};
use crate::metrics::events::{DispatchInFlight, DispatchWaiting};

/// FIFO queue bounding the number of concurrently running tasks.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    slots: Arc<Semaphore>,
    capacity: usize,
    waiting: Arc<AtomicUsize>,
}

impl DispatchQueue {
    /// Create a queue allowing `capacity` concurrent tasks, clamped to
    /// `1..=Semaphore::MAX_PERMITS`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start `task` once a slot is free.
    ///
    /// Resolves when the task has been admitted and spawned, not when it
    /// completes; await the returned handle for the task's output. The queue
    /// imposes no timeout of its own.
    pub async fn submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>, ForwardError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.acquire().await?;
        emit!(DispatchInFlight {
            count: self.in_flight()
        });

        let slots = self.slots.clone();
        let capacity = self.capacity;
        Ok(tokio::spawn(async move {
            let _slot = SlotGuard {
                _permit: permit,
                slots,
                capacity,
            };
            task.await
        }))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ForwardError> {
        let _waiting = WaitingGuard::enter(self.waiting.clone());
        self.slots
            .clone()
            .acquire_owned()
            .await
            .ok()
            .context(QueueClosedSnafu)
    }

    /// Number of tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Number of callers waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Counts a caller as waiting until it is admitted or gives up.
struct WaitingGuard(Arc<AtomicUsize>);

impl WaitingGuard {
    fn enter(waiting: Arc<AtomicUsize>) -> Self {
        let count = waiting.fetch_add(1, Ordering::SeqCst) + 1;
        emit!(DispatchWaiting { count });
        Self(waiting)
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        let count = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        emit!(DispatchWaiting { count });
    }
}

/// Holds a slot for the lifetime of a dispatched task.
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // The permit field drops after this body runs, so it is still held here.
        let in_flight = self.capacity - self.slots.available_permits() - 1;
        emit!(DispatchInFlight { count: in_flight });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    /// Submit a task that reports its id on start and then waits to be released.
    async fn submit_blocked(
        queue: &DispatchQueue,
        id: usize,
        started: mpsc::UnboundedSender<usize>,
    ) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (release, wait) = oneshot::channel::<()>();
        let handle = queue
            .submit(async move {
                let _ = started.send(id);
                let _ = wait.await;
            })
            .await
            .unwrap();
        (release, handle)
    }

    #[tokio::test]
    async fn test_third_task_waits_for_a_slot() {
        let queue = DispatchQueue::new(2);
        let (started_tx, mut started) = mpsc::unbounded_channel();

        let (release_first, first) = submit_blocked(&queue, 1, started_tx.clone()).await;
        let (_release_second, _second) = submit_blocked(&queue, 2, started_tx.clone()).await;
        assert_eq!(started.recv().await, Some(1));
        assert_eq!(started.recv().await, Some(2));
        assert_eq!(queue.in_flight(), 2);

        let third_queue = queue.clone();
        let third_tx = started_tx.clone();
        let third = tokio::spawn(async move { submit_blocked(&third_queue, 3, third_tx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.try_recv().is_err(), "third task must not start yet");
        assert_eq!(queue.waiting(), 1);
        assert_eq!(queue.in_flight(), 2);

        release_first.send(()).unwrap();
        first.await.unwrap();

        assert_eq!(started.recv().await, Some(3));
        assert_eq!(queue.waiting(), 0);
        assert_eq!(queue.in_flight(), 2);
        drop(third.await.unwrap());
    }

    #[tokio::test]
    async fn test_waiters_released_in_arrival_order() {
        let queue = DispatchQueue::new(1);
        let (started_tx, mut started) = mpsc::unbounded_channel();

        let (release_first, _first) = submit_blocked(&queue, 0, started_tx.clone()).await;
        assert_eq!(started.recv().await, Some(0));

        let mut waiters = Vec::new();
        for id in 1..=3 {
            let queue = queue.clone();
            let tx = started_tx.clone();
            waiters.push(tokio::spawn(async move { submit_blocked(&queue, id, tx).await }));
            // Let each waiter reach the semaphore before the next arrives.
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.waiting(), 3);

        release_first.send(()).unwrap();
        let mut order = Vec::new();
        for waiter in waiters {
            order.push(started.recv().await.unwrap());
            let (release, handle) = waiter.await.unwrap();
            release.send(()).unwrap();
            handle.await.unwrap();
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_panics() {
        let queue = DispatchQueue::new(1);

        let handle = queue
            .submit(async { panic!("downstream exploded") })
            .await
            .unwrap();
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(queue.in_flight(), 0);

        let handle = queue.submit(async { 42 }).await.unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_capacity() {
        let queue = DispatchQueue::new(3);
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let peak = peak.clone();
            let running = running.clone();
            handles.push(
                queue
                    .submit(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_not_counted() {
        let queue = DispatchQueue::new(1);
        let (release, wait) = oneshot::channel::<()>();
        let _held = queue.submit(async move { let _ = wait.await; }).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(10), queue.submit(async {})).await;
        assert!(pending.is_err());
        assert_eq!(queue.waiting(), 0);
        drop(release);
    }

    #[tokio::test]
    async fn test_capacity_is_clamped_to_semaphore_limits() {
        assert_eq!(DispatchQueue::new(0).capacity(), 1);

        let queue = DispatchQueue::new(usize::MAX);
        assert_eq!(queue.capacity(), Semaphore::MAX_PERMITS);
        assert_eq!(queue.in_flight(), 0);
        let handle = queue.submit(async { 7 }).await.unwrap();
        assert_eq!(handle.await.unwrap(), 7);
    }
}
