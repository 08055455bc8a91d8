//! Bounded async job pool with FIFO fairness.
//!
//! Jobs are fed through a command channel to a single dispatcher that
//! acquires a semaphore permit before spawning each job, so jobs start
//! strictly in submit order and at most `capacity` run at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Future handle for a submitted job.
///
/// Resolves with `Some(result)` when the job settles, or `None` if the
/// limiter shut down before the job ran. Dropping the slot does not cancel
/// the job; cancellation is the job's own concern (a shared token).
pub struct JoinSlot<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for JoinSlot<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.ok())
    }
}

/// FIFO worker pool bounded at `capacity` concurrent jobs.
pub struct Limiter {
    capacity: usize,
    job_tx: mpsc::UnboundedSender<Job>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
}

impl Limiter {
    /// Create a pool. Must be called from within a Tokio runtime; the
    /// dispatcher runs as a background task.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let idle_notify = Arc::new(Notify::new());

        let semaphore = Arc::new(Semaphore::new(capacity));
        let dispatcher_queued = Arc::clone(&queued);
        let dispatcher_active = Arc::clone(&active);
        let dispatcher_notify = Arc::clone(&idle_notify);

        tokio::spawn(async move {
            debug!(target: "limiter", capacity, "Dispatcher started");
            while let Some(job) = job_rx.recv().await {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                // Order matters: queued + active must never dip to zero
                // while this job is in hand, or drain() wakes early.
                dispatcher_active.fetch_add(1, Ordering::SeqCst);
                dispatcher_queued.fetch_sub(1, Ordering::SeqCst);

                let active = Arc::clone(&dispatcher_active);
                let notify = Arc::clone(&dispatcher_notify);
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                    active.fetch_sub(1, Ordering::SeqCst);
                    notify.notify_waiters();
                });
            }
            debug!(target: "limiter", "Dispatcher stopped");
        });

        Arc::new(Self {
            capacity,
            job_tx,
            queued,
            active,
            idle_notify,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting for a permit
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Submit a job. Returns a future resolving with the job's result.
    pub fn submit<F, T>(&self, fut: F) -> JoinSlot<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = fut.await;
            // Receiver may have been dropped; the job still ran to completion
            let _ = tx.send(result);
        });

        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.job_tx.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        JoinSlot { rx }
    }

    /// Wait until every queued and active job has settled.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queued.load(Ordering::SeqCst) + self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn returns_job_results() {
        let limiter = Limiter::new(2);
        let slot = limiter.submit(async { 41 + 1 });
        assert_eq!(slot.await, Some(42));
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let limiter = Limiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let slots: Vec<_> = (0..20)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                limiter.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for slot in slots {
            slot.await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn jobs_start_in_submit_order() {
        let limiter = Limiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let slots: Vec<_> = (0..10)
            .map(|i| {
                let order = Arc::clone(&order);
                limiter.submit(async move {
                    order.lock().unwrap().push(i);
                })
            })
            .collect();

        for slot in slots {
            slot.await;
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drain_waits_for_queued_and_active() {
        let limiter = Limiter::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = Arc::clone(&done);
            let _ = limiter.submit(async move {
                sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        limiter.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn drain_on_idle_limiter_returns_immediately() {
        let limiter = Limiter::new(1);
        limiter.drain().await;
    }

    #[tokio::test]
    async fn dropping_the_slot_does_not_cancel_the_job() {
        let limiter = Limiter::new(1);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        drop(limiter.submit(async move {
            sleep(Duration::from_millis(5)).await;
            ran_clone.store(true, Ordering::SeqCst);
        }));
        limiter.drain().await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
