//! Background eviction of idle rate limit buckets.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;
use crate::config::LimiterSettings;

/// Handle to the periodic sweep task.
///
/// The task is detached from request handling and never awaited by it.
/// Call [`Evictor::shutdown`] to stop it cleanly; dropping the handle aborts
/// the task instead.
#[derive(Debug)]
pub struct Evictor {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl Evictor {
    /// Start sweeping `limiter` every `interval`, first one interval from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(
            interval_ms = interval.as_millis() as u64,
            max_entries = limiter.max_entries(),
            "Starting rate limit evictor"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Evictor received shutdown signal");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            interval,
        }
    }

    /// Start an evictor using the configured cleanup interval.
    pub fn from_settings(limiter: Arc<RateLimiter>, settings: &LimiterSettings) -> Self {
        Self::spawn(limiter, settings.cleanup_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            // The task may already be gone; nothing to signal then
            let _ = tx.send(());
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Evictor task ended abnormally");
            }
        }

        info!("Rate limit evictor stopped");
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
