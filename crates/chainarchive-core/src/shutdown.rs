//! Cooperative shutdown signal.
//!
//! Loops check [`Shutdown::is_triggered`] between units of work and wait
//! through [`Shutdown::sleep`], which returns early the moment the signal
//! fires. Dropping every [`ShutdownTrigger`] counts as a shutdown.

use std::time::Duration;

use tokio::sync::watch;

/// Sending half, held by whoever decides when to stop (e.g. a Ctrl-C handler).
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into each loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Creates a connected trigger/receiver pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Only fails when every receiver is gone, which needs no signal.
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Waits for `duration` unless shutdown fires first.
    ///
    /// Returns `true` if the full interval elapsed, `false` on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.rx.changed() => false,
        }
    }

    /// Resolves once shutdown fires.
    pub async fn wait(&mut self) {
        while !self.is_triggered() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_runs_to_completion_without_signal() {
        let (_trigger, mut shutdown) = shutdown_channel();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn trigger_interrupts_sleep() {
        let (trigger, mut shutdown) = shutdown_channel();
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        assert!(!shutdown.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
        assert!(!shutdown.sleep(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        assert!(shutdown.is_triggered());
        shutdown.wait().await;
    }
}
