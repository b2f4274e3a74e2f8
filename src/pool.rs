//! The worker-pool dispatcher.
//!
//! Two independent [`WorkerPool`]s are wired up by [`Dispatcher`]: foreground
//! (user-blocking FUSE calls) and background (prefill/readahead). Each
//! worker owns one [`RequestExecutor`] for its whole lifetime — binding an
//! HTTP session to a thread rather than sharing it, so no executor is ever
//! driven from two threads at once.

use crate::error::FsError;
use crate::executor::RequestExecutor;
use crate::hook::Hook;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often an idle worker wakes to check the shutdown flag. Keeping this
/// short (rather than blocking forever on `recv`) means `shutdown()` never
/// has to close the channel to unblock a worker.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Thunk = Box<dyn FnOnce(&mut RequestExecutor) -> i32 + Send + 'static>;

struct WorkItem {
    thunk: Thunk,
    completion_tx: Sender<i32>,
}

/// A one-shot handle to a posted item's eventual result.
pub struct PendingResult {
    rx: Receiver<i32>,
}

impl PendingResult {
    /// Blocks until the worker completes the thunk (or the pool tears down
    /// mid-flight, in which case this returns `-ESHUTDOWN`).
    pub fn wait(self) -> i32 {
        self.rx.recv().unwrap_or(-libc::ESHUTDOWN)
    }
}

fn shutdown_result() -> i32 {
    -FsError::Shutdown.to_errno()
}

/// A fixed-size pool of workers, each dequeuing [`WorkItem`]s and running
/// their thunk against its own long-lived [`RequestExecutor`].
pub struct WorkerPool {
    sender: Sender<WorkItem>,
    drain_rx: Receiver<WorkItem>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` long-lived threads, each with its own executor.
    pub fn new(
        pool_name: &'static str,
        worker_count: usize,
        queue_bound: usize,
        max_transfer_retries: u32,
        request_timeout: Duration,
        hook: Arc<dyn Hook>,
    ) -> Self {
        let (sender, receiver) = bounded::<WorkItem>(queue_bound.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for idx in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let shutdown = Arc::clone(&shutdown);
            let hook = Arc::clone(&hook);
            let handle = std::thread::Builder::new()
                .name(format!("{pool_name}-{idx}"))
                .spawn(move || worker_loop(receiver, shutdown, hook, max_transfer_retries, request_timeout))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            sender,
            drain_rx: receiver,
            shutdown,
            workers,
        }
    }

    /// Enqueues a thunk and returns a handle to its eventual result.
    /// Returns immediately; the caller decides whether to `wait()`.
    pub fn post(&self, thunk: Thunk) -> PendingResult {
        let (completion_tx, completion_rx) = bounded(1);
        if self.shutdown.load(Ordering::Acquire) {
            let _ = completion_tx.send(shutdown_result());
            return PendingResult { rx: completion_rx };
        }
        let item = WorkItem { thunk, completion_tx };
        if self.sender.send(item).is_err() {
            // Every worker's receiver clone is gone; nothing will ever run this.
            // Can't recover the item's completion_tx from a failed send, so
            // synthesize the same outcome the caller would have observed.
            let (tx, rx) = bounded(1);
            let _ = tx.send(shutdown_result());
            return PendingResult { rx };
        }
        PendingResult { rx: completion_rx }
    }

    /// Wakes workers, fails every queued item with `ESHUTDOWN`, and joins.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Drain whatever is still queued; a worker that pops the same item
        // first will see the flag itself and fail it the same way, so racing
        // here is harmless (each item is claimed exactly once by the channel).
        while let Ok(item) = self.drain_rx.try_recv() {
            let _ = item.completion_tx.send(shutdown_result());
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    receiver: Receiver<WorkItem>,
    shutdown: Arc<AtomicBool>,
    hook: Arc<dyn Hook>,
    max_transfer_retries: u32,
    _request_timeout: Duration,
) {
    let mut executor = RequestExecutor::new(max_transfer_retries);
    executor.set_hook(Arc::clone(&hook));

    loop {
        match receiver.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(item) => {
                if shutdown.load(Ordering::Acquire) {
                    let _ = item.completion_tx.send(shutdown_result());
                    continue;
                }
                let result = (item.thunk)(&mut executor);
                let _ = item.completion_tx.send(result);
                if !executor.is_usable() {
                    executor = RequestExecutor::new(max_transfer_retries);
                    executor.set_hook(Arc::clone(&hook));
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Foreground/background split: background exists only to keep prefill
/// traffic from competing with user-visible calls.
pub struct Dispatcher {
    foreground: WorkerPool,
    background: WorkerPool,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        fg_worker_count: usize,
        bg_worker_count: usize,
        queue_bound: usize,
        max_transfer_retries: u32,
        request_timeout: Duration,
        hook: Arc<dyn Hook>,
    ) -> Self {
        Self {
            foreground: WorkerPool::new(
                "fg",
                fg_worker_count,
                queue_bound,
                max_transfer_retries,
                request_timeout,
                Arc::clone(&hook),
            ),
            background: WorkerPool::new(
                "bg",
                bg_worker_count,
                queue_bound,
                max_transfer_retries,
                request_timeout,
                hook,
            ),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Submits to the foreground pool and blocks until it completes.
    pub fn run_fg(&self, thunk: Thunk) -> i32 {
        self.foreground.post(thunk).wait()
    }

    /// Submits to the foreground pool without blocking the caller.
    pub fn post_fg(&self, thunk: Thunk) -> PendingResult {
        self.foreground.post(thunk)
    }

    /// Submits to the background pool; the result is discarded.
    pub fn post_bg(&self, thunk: Thunk) {
        let _ = self.background.post(thunk);
    }

    /// Tears down both pools, failing in-flight work with `ESHUTDOWN`.
    pub fn shutdown(self) {
        self.foreground.shutdown();
        self.background.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::ListingPage;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct NullHook;
    impl Hook for NullHook {
        fn adjust_url(&self, url: &str) -> String {
            url.to_string()
        }
        fn pre_run(&self, _txn: &mut crate::executor::Transaction, _attempt: u32) {}
        fn should_retry(&self, _txn: &crate::executor::Transaction, _attempt: u32) -> bool {
            false
        }
        fn list_query(&self, _prefix: &str, _marker: Option<&str>) -> String {
            String::new()
        }
        fn parse_listing(&self, _body: &[u8]) -> crate::error::FsResult<ListingPage> {
            Ok(ListingPage::default())
        }
        fn metadata_header_prefix(&self) -> &str {
            "x-amz-meta-"
        }
    }

    fn test_pool(workers: usize) -> WorkerPool {
        WorkerPool::new(
            "test",
            workers,
            16,
            3,
            Duration::from_secs(5),
            Arc::new(NullHook),
        )
    }

    #[test]
    fn post_runs_exactly_once_and_returns_result() {
        let pool = test_pool(2);
        let result = pool.post(Box::new(|_exec| 42)).wait();
        assert_eq!(result, 42);
        pool.shutdown();
    }

    #[test]
    fn concurrent_posts_each_observe_one_result() {
        let pool = test_pool(4);
        let counter = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.post(Box::new(move |_exec| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    0
                }))
            })
            .collect();
        for h in handles {
            assert_eq!(h.wait(), 0);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        pool.shutdown();
    }

    #[test]
    fn shutdown_fails_pending_items_with_eshutdown() {
        let pool = test_pool(1);
        // Occupy the only worker so the next item sits in the queue.
        let (release_tx, release_rx) = bounded::<()>(0);
        let occupying = pool.post(Box::new(move |_exec| {
            let _ = release_rx.recv();
            0
        }));
        let queued = pool.post(Box::new(|_exec| 7));

        pool.shutdown.store(true, Ordering::Release);
        while let Ok(item) = pool.drain_rx.try_recv() {
            let _ = item.completion_tx.send(shutdown_result());
        }
        drop(release_tx);
        assert_eq!(occupying.wait(), 0);
        assert_eq!(queued.wait(), -libc::ESHUTDOWN);
        pool.shutdown();
    }

    #[test]
    fn dispatcher_post_bg_does_not_block_caller() {
        let dispatcher = Dispatcher::new(1, 1, 16, 3, Duration::from_secs(5), Arc::new(NullHook));
        dispatcher.post_bg(Box::new(|_exec| 0));
        dispatcher.shutdown();
    }
}
