use tokio::sync::Notify;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts jobs running in this process and wakes the poller when a slot frees up.
pub(crate) struct JobTracker {
    max_jobs: usize,
    running: AtomicUsize,
    notify: Notify,
}

impl JobTracker {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs: max_jobs.max(1),
            running: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.running.load(Ordering::SeqCst) < self.max_jobs
    }

    pub fn n_running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn dispatch_job(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub fn job_completed(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
