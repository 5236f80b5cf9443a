//! Cache scan worker.
//!
//! The host wires its signal handler (or any other wakeup source) to
//! `trigger`; the scan itself always runs on this worker task, never in the
//! signal handler. Triggers arriving while a scan is running coalesce into
//! one follow-up scan.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct CacheScanner {
    notify: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl CacheScanner {
    /// Spawn the scan worker. `scan` runs once per wakeup.
    pub fn spawn<F, Fut>(mut scan: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let worker_notify = Arc::clone(&notify);
        let worker = tokio::spawn(async move {
            loop {
                worker_notify.notified().await;
                debug!("cache scan triggered");
                scan().await;
            }
        });
        Self { notify, worker }
    }

    /// Wake the scan worker. Safe to call from any task, any number of
    /// times; concurrent triggers coalesce.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

impl Drop for CacheScanner {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
