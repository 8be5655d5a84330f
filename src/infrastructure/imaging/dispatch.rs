//! Delivery context for completion and progress callbacks.

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

/// Where the manager runs caller callbacks.
#[derive(Clone, Default)]
pub enum Dispatcher {
    /// Run callbacks on whichever worker task produced the result.
    #[default]
    Immediate,
    /// Post callbacks to a [`DispatchQueue`] drained by the caller.
    Queue(mpsc::UnboundedSender<Job>),
}

impl Dispatcher {
    /// Creates a queued dispatcher and the queue the caller must drain.
    #[must_use]
    pub fn queue() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Queue(tx), DispatchQueue { rx })
    }

    /// Runs `job` now or posts it to the queue.
    ///
    /// A job posted after the queue was dropped is discarded.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            Self::Immediate => job(),
            Self::Queue(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    tracing::trace!("Dispatch queue closed, dropping callback");
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "Dispatcher::Immediate"),
            Self::Queue(_) => write!(f, "Dispatcher::Queue"),
        }
    }
}

/// Receiving end of [`Dispatcher::queue`], owned by the delivery thread.
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl DispatchQueue {
    /// Runs every callback already queued without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            count += 1;
        }
        count
    }

    /// Waits for the next callback and runs it. Returns false once every dispatcher is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs callbacks on the current thread until every dispatcher is gone.
    ///
    /// Must not be called from within an async context.
    pub fn run_blocking(mut self) {
        while let Some(job) = self.rx.blocking_recv() {
            job();
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_immediate_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        Dispatcher::Immediate.dispatch(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_defers_until_drained() {
        let (dispatcher, mut queue) = Dispatcher::queue();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = counter.clone();
            dispatcher.dispatch(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_next_stops_when_dispatchers_dropped() {
        let (dispatcher, mut queue) = Dispatcher::queue();
        dispatcher.dispatch(|| {});
        drop(dispatcher);

        assert!(queue.run_next().await);
        assert!(!queue.run_next().await);
    }

    #[test]
    fn test_dispatch_after_queue_dropped_is_discarded() {
        let (dispatcher, queue) = Dispatcher::queue();
        drop(queue);
        dispatcher.dispatch(|| panic!("must not run"));
    }
}
