//! Background task scheduler
//!
//! Owns the shutdown channel and the shared probe-concurrency limiter.
//! Tasks are spawned with a small random start jitter so a fleet of
//! instances restarted together does not sweep the pool in lockstep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneous outbound probes across all services.
    pub probe_concurrency: usize,
    /// Fraction of a task's interval used as maximum start jitter.
    pub jitter_ratio: f64,
    /// How long shutdown waits for each task before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            probe_concurrency: 16,
            jitter_ratio: 0.1,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Supervises the long-running background services.
pub struct BackgroundScheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    limiter: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl BackgroundScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let limiter = Arc::new(Semaphore::new(config.probe_concurrency.max(1)));
        Self {
            shutdown_tx,
            tasks: Vec::new(),
            limiter,
            config,
        }
    }

    /// Probe-concurrency limiter shared by every probing service.
    pub fn probe_limiter(&self) -> Arc<Semaphore> {
        Arc::clone(&self.limiter)
    }

    /// Subscribe a receiver on the shared shutdown channel.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named service after a random delay within the jitter window
    /// derived from `interval`.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, interval: Duration, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        let delay = jitter_delay(interval, self.config.jitter_ratio);

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
            info!(service = name, "Starting background service");
            task(shutdown).await;
        });

        self.tasks.push((name, handle));
    }

    /// Signal shutdown and wait for every task, aborting stragglers past
    /// the grace period.
    pub async fn shutdown(self) {
        info!("Stopping background services");
        let _ = self.shutdown_tx.send(true);

        for (name, mut handle) in self.tasks {
            match timeout(self.config.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => info!(service = name, "Background service stopped"),
                Ok(Err(e)) => warn!(service = name, "Background service panicked: {}", e),
                Err(_) => {
                    warn!(service = name, "Background service did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

fn jitter_delay(interval: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    let window = interval.as_secs_f64() * ratio;
    if window <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..window))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_delay_within_window() {
        let interval = Duration::from_secs(60);
        for _ in 0..100 {
            let d = jitter_delay(interval, 0.1);
            assert!(d < Duration::from_secs(6));
        }
    }

    #[test]
    fn test_jitter_delay_zero_ratio() {
        assert_eq!(jitter_delay(Duration::from_secs(60), 0.0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_spawned_task_receives_shutdown() {
        let mut scheduler = BackgroundScheduler::new(SchedulerConfig {
            jitter_ratio: 0.0,
            shutdown_grace: Duration::from_secs(1),
            ..SchedulerConfig::default()
        });

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        scheduler.spawn("test-service", Duration::from_secs(60), move |mut shutdown| async move {
            loop {
                shutdown.changed().await.ok();
                if *shutdown.borrow() {
                    let _ = done_tx.send(());
                    break;
                }
            }
        });

        scheduler.shutdown().await;
        done_rx.await.expect("service observed shutdown");
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_task() {
        let mut scheduler = BackgroundScheduler::new(SchedulerConfig {
            jitter_ratio: 0.0,
            shutdown_grace: Duration::from_millis(50),
            ..SchedulerConfig::default()
        });

        scheduler.spawn("stuck-service", Duration::from_secs(60), |_shutdown| async {
            sleep(Duration::from_secs(3600)).await;
        });

        // Must return promptly despite the task ignoring the signal.
        timeout(Duration::from_secs(2), scheduler.shutdown())
            .await
            .expect("shutdown bounded by grace period");
    }

    #[test]
    fn test_probe_limiter_capacity() {
        let scheduler = BackgroundScheduler::new(SchedulerConfig {
            probe_concurrency: 4,
            ..SchedulerConfig::default()
        });
        assert_eq!(scheduler.probe_limiter().available_permits(), 4);
    }
}
