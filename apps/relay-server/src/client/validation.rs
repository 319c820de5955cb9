use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Debounced runner where the newest submission cancels any pending or
/// in-flight one. A superseded caller sees its receiver close without a value.
#[derive(Debug)]
pub struct LatestOnly {
    debounce: Duration,
    current: Mutex<Option<CancellationToken>>,
}

impl LatestOnly {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            current: Mutex::new(None),
        }
    }

    pub fn submit<F, Fut, T>(&self, job: F) -> oneshot::Receiver<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = oneshot::channel();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            let work = job(token.clone());
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("Validation superseded while running");
                }
                value = work => {
                    let _ = tx.send(value);
                }
            }
        });
        rx
    }

    /// Cancel whatever is pending without submitting a replacement.
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }
}
