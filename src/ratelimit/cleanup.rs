//! Background eviction of idle rate limit state.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Result, TurnstileError};

/// A store whose entries can be dropped once they go unused.
pub trait Evict: Send + Sync + 'static {
    /// Remove every entry last touched more than `ttl` before `now`.
    ///
    /// Returns the number of entries removed.
    fn evict_idle(&self, now: SystemTime, ttl: Duration) -> usize;
}

/// Handle to a running cleanup task.
///
/// Dropping the handle signals the task to stop; [`CleanupTask::shutdown`]
/// also waits for it to finish.
pub struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rate limit cleanup task ended abnormally");
            }
        }
    }

    /// Check whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawn a task on the current tokio runtime that evicts idle entries from
/// `store` every `interval`.
pub fn spawn(store: Arc<dyn Evict>, interval: Duration, ttl: Duration) -> Result<CleanupTask> {
    if interval.is_zero() {
        return Err(TurnstileError::Config("cleanup interval must be non-zero".to_string()));
    }
    if ttl.is_zero() {
        return Err(TurnstileError::Config("entry ttl must be non-zero".to_string()));
    }
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
        TurnstileError::Config(format!("cleanup requires a tokio runtime: {}", e))
    })?;

    let (shutdown, mut stopped) = watch::channel(false);

    let handle = runtime.spawn(async move {
        info!(interval = ?interval, ttl = ?ttl, "Rate limit cleanup started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.evict_idle(SystemTime::now(), ttl);
                    if removed > 0 {
                        debug!(removed, "Evicted idle rate limit entries");
                    }
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Rate limit cleanup stopped");
    });

    Ok(CleanupTask {
        shutdown,
        handle: Some(handle),
    })
}
