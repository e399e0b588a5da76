//! Timeout-bounded startup supervision.
//!
//! A module's start routine runs on its own task while the supervisor waits
//! under a deadline. Exactly one of three outcomes results: completion,
//! failure, or timeout. On failure and on timeout the task's stop routine is
//! invoked exactly once so a partially-started module is fully unwound
//! before the failure is reported upward; stop errors are logged, never
//! rethrown.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{Error, Result};

/// Fixed grace on top of the configured deadline.
pub const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// A startable unit of work under supervision.
#[async_trait::async_trait]
pub trait Supervised: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub struct Supervisor {
    timeout: Duration,
}

impl Supervisor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `task.start()` under the deadline.
    ///
    /// The caller never observes an in-flight state: by the time this
    /// returns, the task is either running or fully stopped.
    pub async fn supervise(&self, name: &str, task: Arc<dyn Supervised>) -> Result<()> {
        let start_task = Arc::clone(&task);
        let mut handle = tokio::spawn(async move { start_task.start().await });

        match tokio::time::timeout(self.timeout + STARTUP_GRACE, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                debug!(module = name, "start completed within deadline");
                Ok(())
            }
            Ok(Ok(Err(err))) => {
                warn!(module = name, %err, "start failed, unwinding");
                stop_quietly(name, &task).await;
                Err(Error::startup_failed(format!("{name}: {err}")))
            }
            Ok(Err(join_err)) => {
                warn!(module = name, %join_err, "start task aborted unexpectedly");
                stop_quietly(name, &task).await;
                Err(Error::startup_failed(format!("{name}: start task died")))
            }
            Err(_) => {
                warn!(
                    module = name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "start deadline elapsed, cancelling"
                );
                handle.abort();
                stop_quietly(name, &task).await;
                Err(Error::startup_timeout(name))
            }
        }
    }
}

async fn stop_quietly(name: &str, task: &Arc<dyn Supervised>) {
    if let Err(err) = task.stop().await {
        warn!(module = name, %err, "stop during unwind failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_ok;

    struct Probe {
        start_delay: Duration,
        fail: bool,
        stops: AtomicU32,
    }

    impl Probe {
        fn new(start_delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                start_delay,
                fail,
                stops: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Supervised for Probe {
        async fn start(&self) -> Result<()> {
            tokio::time::sleep(self.start_delay).await;
            if self.fail {
                return Err(Error::internal("boom"));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_within_deadline() {
        let supervisor = Supervisor::new(Duration::from_millis(200));
        let probe = Probe::new(Duration::from_millis(10), false);
        tokio_test::assert_ok!(supervisor.supervise("quick", probe.clone()).await);
        assert_eq!(probe.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_exactly_once() {
        let supervisor = Supervisor::new(Duration::from_millis(200));
        let probe = Probe::new(Duration::from_secs(3600), false);
        let err = supervisor.supervise("stuck", probe.clone()).await.unwrap_err();
        assert!(matches!(err, Error::StartupTimeout(_)));
        assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_unwinds_via_stop() {
        let supervisor = Supervisor::new(Duration::from_millis(200));
        let probe = Probe::new(Duration::from_millis(10), true);
        let err = supervisor.supervise("broken", probe.clone()).await.unwrap_err();
        assert!(matches!(err, Error::StartupFailed(_)));
        assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_extends_deadline() {
        let supervisor = Supervisor::new(Duration::from_millis(200));
        // Finishes inside timeout + grace.
        let probe = Probe::new(Duration::from_millis(250), false);
        supervisor.supervise("slowish", probe.clone()).await.unwrap();
        assert_eq!(probe.stops.load(Ordering::SeqCst), 0);
    }
}
