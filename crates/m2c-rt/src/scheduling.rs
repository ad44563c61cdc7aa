//! ---
//! m2c_section: "01-core-functionality"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Back-off, iteration timing and task tracking."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Linear back-off: attempt `i` (zero based) waits `(i + 1) * unit`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    unit: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(unit: Duration, max_attempts: u32) -> Self {
        Self {
            unit,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempts are spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.unit.saturating_mul(self.attempt))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Running mean of iteration durations, the `ttl` a stop waits on.
#[derive(Debug, Default)]
pub struct IterationTimer {
    inner: Mutex<(u64, Duration)>,
}

impl IterationTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += 1;
        inner.1 += elapsed;
    }

    /// Mean iteration time; zero before the first iteration completes.
    pub fn mean(&self) -> Duration {
        let inner = self.inner.lock();
        match u32::try_from(inner.0) {
            Ok(0) => Duration::ZERO,
            Ok(count) => inner.1 / count,
            Err(_) => inner.1.div_f64(inner.0 as f64),
        }
    }

    /// `min(factor * mean, cap)`.
    pub fn stop_wait(&self, factor: u32, cap: Duration) -> Duration {
        self.mean().saturating_mul(factor).min(cap)
    }

    pub fn reset(&self) {
        *self.inner.lock() = (0, Duration::ZERO);
    }
}

/// Tracks spawned long-lived tasks so the daemon can join them on shutdown.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl TaskSet {
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(fut)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Join every task, returning the first failure after all have finished.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (name, task) in self.tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(err) => Err(anyhow::anyhow!("task join failure: {err}")),
            };
            if let Err(err) = outcome {
                warn!(task = name, error = %err, "task exited with error");
                first_error.get_or_insert(err.context(format!("task {name} failed")));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
