use tokio::task::JoinHandle;

/// Background task that is aborted when its owner goes away.
pub(crate) struct OwnedTaskHandle(Option<JoinHandle<()>>);

impl OwnedTaskHandle {
    pub fn new(inner: JoinHandle<()>) -> Self {
        Self(Some(inner))
    }

    /// Abort the task and wait until it has unwound.
    pub async fn stop(mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for OwnedTaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
