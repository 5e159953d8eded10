// =============================================================================
// Long-lived services and their shared lifecycle plumbing
// =============================================================================
//
// Each service is a single cooperative loop: consume (or poll), handle,
// advance the cursor, check the stop signal. Per-iteration errors are logged
// and the loop continues; only setup-phase failures terminate the process.
// =============================================================================

pub mod data;
pub mod execution;
pub mod monitor;
pub mod reconciliation;
pub mod risk;
pub mod strategy;

use tokio::sync::watch;

/// Create a linked stop-signal pair. The CLI holds the handle; services hold
/// (clones of) the signal and check it between iterations.
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// Writer side of the stop signal.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Reader side of the stop signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Sleep for `duration`, returning early if stop is requested.
    pub async fn sleep(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stopped() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_flips_the_signal_for_all_clones() {
        let (handle, shutdown) = shutdown_channel();
        let other = shutdown.clone();
        assert!(!shutdown.is_stopping());

        handle.stop();
        assert!(shutdown.is_stopping());
        assert!(other.is_stopping());
        // Resolves immediately once stopped.
        other.stopped().await;
    }

    #[tokio::test]
    async fn sleep_returns_early_on_stop() {
        let (handle, shutdown) = shutdown_channel();
        let started = std::time::Instant::now();
        let sleeper = tokio::spawn(async move {
            shutdown.sleep(std::time::Duration::from_secs(30)).await;
        });
        handle.stop();
        sleeper.await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
