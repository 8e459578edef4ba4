//! 后台清理任务：由服务显式持有、可取消的周期性清扫。
//!
//! Owned periodic sweep task.
//!
//! Services that accumulate per-key state (cache entries, throttle windows,
//! per-identity quota records) implement [`Sweep`] and own a [`Sweeper`]. The
//! task is started when the service is constructed and stopped by
//! [`Sweeper::shutdown`] or when the handle is dropped. It only holds a `Weak`
//! reference, so a dropped service also ends its task.

use std::sync::{Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A service with state that can be garbage-collected periodically.
pub trait Sweep: Send + Sync + 'static {
    /// Remove expired or idle records. Returns the number removed.
    fn sweep(&self) -> usize;

    /// Short name used in log fields.
    fn sweep_name(&self) -> &'static str;
}

/// Handle to a running sweep task.
pub struct Sweeper {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Spawn a sweep loop for `target` on the current tokio runtime.
    ///
    /// The first sweep runs one `interval` after spawning. If no runtime is
    /// available the returned handle is inert.
    pub fn spawn<S: Sweep>(interval: Duration, target: Weak<S>) -> Self {
        let token = CancellationToken::new();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(rt) if !interval.is_zero() => {
                let child = token.clone();
                Some(rt.spawn(run_loop(interval, target, child)))
            }
            _ => None,
        };
        Self {
            token,
            handle: Mutex::new(handle),
        }
    }

    /// Stop the sweep task. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
            && self
                .handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_loop<S: Sweep>(interval: Duration, target: Weak<S>, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(service) = target.upgrade() else { break };
                let removed = service.sweep();
                if removed > 0 {
                    debug!(service = service.sweep_name(), removed, "sweep removed idle records");
                } else {
                    trace!(service = service.sweep_name(), "sweep found nothing to remove");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        runs: AtomicUsize,
    }

    impl Sweep for Counter {
        fn sweep(&self) -> usize {
            self.runs.fetch_add(1, Ordering::SeqCst);
            0
        }
        fn sweep_name(&self) -> &'static str {
            "counter"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ticks_until_shutdown() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
        });
        let sweeper = Sweeper::spawn(Duration::from_secs(10), Arc::downgrade(&counter));
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.runs.load(Ordering::SeqCst), 3);

        sweeper.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.runs.load(Ordering::SeqCst), 3);
        assert!(!sweeper.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_service_dropped() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
        });
        let sweeper = Sweeper::spawn(Duration::from_secs(1), Arc::downgrade(&counter));
        drop(counter);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!sweeper.is_running());
    }

    #[test]
    fn test_sweeper_without_runtime_is_inert() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
        });
        let sweeper = Sweeper::spawn(Duration::from_secs(1), Arc::downgrade(&counter));
        assert!(!sweeper.is_running());
        sweeper.shutdown();
    }
}
