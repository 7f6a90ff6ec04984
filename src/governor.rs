//! Rate and resource governance.
//!
//! Two distinct limiters plus a CPU throttle gate all work admission and
//! outbound I/O:
//!
//! - [`RateLimiter`] — exponential backoff used by the scanner between
//!   empty passes and by the state store when retrying locked
//!   transactions.
//! - [`FixedRateLimiter`] — enforces a minimum interval between outbound
//!   calls (remote transcription requests).
//! - [`CpuMonitor`] — blocks dispatch while system CPU usage sits above a
//!   threshold. Degrades to a no-op on hosts without a load metric.
//!
//! [`QueryQueue`] serialises rate-limited outbound work through a single
//! long-lived worker task.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Hard ceiling on any backoff interval.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Counter-driven exponential backoff: each increment doubles the wait,
/// capped at the configured maximum.
#[derive(Debug)]
pub struct RateLimiter {
    counter: u32,
    max_interval: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MAX_BACKOFF)
    }
}

impl RateLimiter {
    pub fn new(max_interval: Duration) -> Self {
        Self {
            counter: 0,
            max_interval,
        }
    }

    /// Advances the backoff by one step.
    pub fn increment(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }

    /// Clears the backoff after productive work.
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Current wait: `min(2^counter, max_interval)` seconds.
    pub fn interval(&self) -> Duration {
        let secs = if self.counter >= 6 {
            MAX_BACKOFF.as_secs()
        } else {
            1u64 << self.counter
        };
        Duration::from_secs(secs).min(self.max_interval).min(MAX_BACKOFF)
    }

    /// Sleeps for the current interval.
    pub async fn sleep(&self) {
        tokio::time::sleep(self.interval()).await;
    }
}

/// Enforces a minimum interval between successive calls. An interval of
/// zero admits every call immediately.
pub struct FixedRateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl FixedRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Waits until the configured interval has elapsed since the previous
    /// permit, then takes the next one.
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Watches system CPU usage and blocks while it exceeds a threshold.
pub struct CpuMonitor {
    max_percent: f32,
    check_interval: Duration,
    system: Option<parking_lot::Mutex<System>>,
}

impl CpuMonitor {
    /// `max_percent` is the usage ceiling before throttling kicks in;
    /// `check_interval` is the pause between rechecks while throttled.
    pub fn new(max_percent: f32, check_interval: Duration) -> Self {
        let system = sysinfo::IS_SUPPORTED_SYSTEM
            .then(|| parking_lot::Mutex::new(System::new()));
        if system.is_none() {
            tracing::warn!("no CPU load metric on this host; throttle disabled");
        }
        Self {
            max_percent,
            check_interval,
            system,
        }
    }

    /// A monitor that never throttles.
    pub fn disabled() -> Self {
        Self {
            max_percent: 100.0,
            check_interval: Duration::from_millis(500),
            system: None,
        }
    }

    async fn sample(&self) -> Option<f32> {
        let system = self.system.as_ref()?;
        system.lock().refresh_cpu_usage();
        // Two refreshes a beat apart give a meaningful usage delta.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut sys = system.lock();
        sys.refresh_cpu_usage();
        Some(sys.global_cpu_usage())
    }

    /// Blocks until CPU usage drops below the ceiling. Each throttle cycle
    /// emits a visible notice so delayed work is explainable.
    pub async fn wait_for_safe_usage(&self) {
        loop {
            let Some(usage) = self.sample().await else {
                return;
            };
            if usage < self.max_percent {
                return;
            }
            tracing::warn!(
                "CPU usage {usage:.1}% exceeds limit {:.1}%; throttling",
                self.max_percent
            );
            tokio::time::sleep(self.check_interval).await;
        }
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serialises outbound calls through one worker task, gated by the CPU
/// monitor and a fixed-interval limiter.
#[derive(Clone)]
pub struct QueryQueue {
    tx: mpsc::Sender<Job>,
}

impl QueryQueue {
    pub fn start(limiter: FixedRateLimiter, cpu: CpuMonitor) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                cpu.wait_for_safe_usage().await;
                limiter.wait().await;
                job.await;
            }
            tracing::debug!("query queue drained and closed");
        });
        (Self { tx }, handle)
    }

    /// Runs `fut` on the worker once the governor admits it, returning its
    /// output. Errors only if the worker has shut down.
    pub async fn run<F, T>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("query queue worker is gone"))?;
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("query queue dropped the job"))
    }
}
