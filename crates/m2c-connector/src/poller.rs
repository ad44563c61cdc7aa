//! ---
//! m2c_section: "07-resilience-fault-tolerance"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Cooperative polling loop with error counting and reconnects."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use m2c_logging::{m2c_info, m2c_warn, LogContext};
use m2c_metrics::ConnectorMetrics;
use m2c_msg::Replier;
use m2c_rt::IterationTimer;
use serde_json::json;
use tokio::sync::watch;

use crate::driver::DeviceDriver;
use crate::emitter::{IterationBuffer, RecordEmitter};
use crate::state::{ConnectionState, StateHandle};

/// Word written by the control handler and read at the top of every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlWord {
    Run,
    /// `stop` verb: flush, close, let the handler rewrite the state file.
    Stop,
    /// Process shutdown: flush and close, the state file is left as is.
    Shutdown,
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    Shutdown,
    /// `error_retry` consecutive polls failed.
    Faulted,
}

/// The single polling task of a running connection. It owns the driver; the
/// control handler only reaches it through the control word.
pub struct PollLoop {
    connection: String,
    driver: Box<dyn DeviceDriver>,
    emitter: RecordEmitter,
    replier: Replier,
    control: watch::Receiver<ControlWord>,
    state: StateHandle,
    timer: Arc<IterationTimer>,
    error_retry: u32,
    metrics: Option<ConnectorMetrics>,
}

impl std::fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollLoop")
            .field("connection", &self.connection)
            .field("protocol", &self.driver.protocol())
            .field("error_retry", &self.error_retry)
            .finish()
    }
}

impl PollLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: impl Into<String>,
        driver: Box<dyn DeviceDriver>,
        emitter: RecordEmitter,
        replier: Replier,
        control: watch::Receiver<ControlWord>,
        state: StateHandle,
        timer: Arc<IterationTimer>,
        error_retry: u32,
        metrics: Option<ConnectorMetrics>,
    ) -> Self {
        Self {
            connection: connection.into(),
            driver,
            emitter,
            replier,
            control,
            state,
            timer,
            error_retry: error_retry.max(1),
            metrics,
        }
    }

    fn requested(&self) -> ControlWord {
        *self.control.borrow()
    }

    /// Run until stopped or faulted. The device session is closed on every
    /// exit path that reaches the end of this function; if the task is
    /// aborted instead, dropping the driver releases the socket.
    pub async fn run(mut self) -> LoopExit {
        let protocol = self.driver.protocol().to_string();
        let connection = self.connection.clone();
        let ctx = LogContext::connection(&connection).with_protocol(&protocol);
        let interval = self.driver.interval();
        let mut buffer = IterationBuffer::new(self.driver.iterations());
        let mut consecutive_errors = 0u32;
        let mut delay = interval;
        m2c_info!(context = ctx, "polling every {:?}", interval);

        let exit = loop {
            if let Some(exit) = self.pause(delay).await {
                break exit;
            }
            delay = interval;
            let started = Instant::now();
            if let Some(metrics) = &self.metrics {
                metrics.inc_poll(&self.connection);
            }

            let polled = {
                let driver = &mut self.driver;
                let control = &mut self.control;
                tokio::select! {
                    outcome = driver.poll() => Some(outcome),
                    _ = wait_for_halt(control) => None,
                }
            };
            let Some(polled) = polled else {
                break exit_for(self.requested());
            };

            match polled {
                Ok(outcome) => {
                    consecutive_errors = 0;
                    if self.state.get() == ConnectionState::Reconnecting {
                        self.state.set(ConnectionState::Running);
                    }
                    if let Some(next) = outcome.next_delay {
                        delay = next;
                    }
                    if let Some(batch) = buffer.push(outcome.samples) {
                        self.emitter.emit(batch, &self.replier).await;
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    buffer.reset();
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_poll_error(&self.connection);
                    }
                    m2c_warn!(
                        context = ctx,
                        "poll failed ({}/{}): {}",
                        consecutive_errors,
                        self.error_retry,
                        err
                    );
                    if consecutive_errors >= self.error_retry {
                        self.replier
                            .error(json!(format!(
                                "Stopping connection after {consecutive_errors} consecutive read errors: {err}"
                            )))
                            .await;
                        break LoopExit::Faulted;
                    }
                    self.state.set(ConnectionState::Reconnecting);
                    self.driver.close().await;
                    match self.driver.open().await {
                        Ok(()) => {
                            m2c_info!(context = ctx, "device session re-established");
                            self.state.set(ConnectionState::Running);
                        }
                        Err(err) => m2c_warn!(context = ctx, "reconnect failed: {}", err),
                    }
                }
            }

            let elapsed = started.elapsed();
            self.timer.record(elapsed);
            if let Some(metrics) = &self.metrics {
                metrics.observe_iteration(&self.connection, elapsed.as_secs_f64());
            }
        };

        self.state.set(ConnectionState::Stopping);
        if exit != LoopExit::Faulted && !buffer.is_empty() {
            self.emitter.emit(buffer.take(), &self.replier).await;
        }
        self.driver.close().await;
        if let Err(err) = self.emitter.stream().flush() {
            m2c_warn!(context = ctx, "stream flush failed: {}", err);
        }
        m2c_info!(context = ctx, "polling ended: {:?}", exit);
        exit
    }

    /// Sleep `delay` unless the control word leaves `Run` first.
    async fn pause(&mut self, delay: Duration) -> Option<LoopExit> {
        if self.requested() != ControlWord::Run {
            return Some(exit_for(self.requested()));
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            _ = wait_for_halt(&mut self.control) => Some(exit_for(self.requested())),
        }
    }
}

fn exit_for(word: ControlWord) -> LoopExit {
    match word {
        ControlWord::Shutdown => LoopExit::Shutdown,
        _ => LoopExit::Stopped,
    }
}

/// Resolves once the control word is anything but `Run`, or the handler is gone.
async fn wait_for_halt(control: &mut watch::Receiver<ControlWord>) {
    let _ = control.wait_for(|word| *word != ControlWord::Run).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PollOutcome;
    use crate::Result;
    use async_trait::async_trait;
    use m2c_model::{LocationHierarchy, Protocol, Quality};
    use m2c_msg::{InMemoryBus, MessageBus};
    use m2c_persistence::{LocalRecordStream, StreamOptions};
    use m2c_protocols::{DeviceSample, ProtocolError};
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Plays back a script of poll results, then keeps failing.
    struct Scripted {
        script: Arc<Mutex<Vec<Result<PollOutcome>>>>,
        closes: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl DeviceDriver for Scripted {
        fn protocol(&self) -> Protocol {
            Protocol::OpcDa
        }
        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }
        async fn poll(&mut self) -> Result<PollOutcome> {
            let mut script = self.script.lock();
            if script.is_empty() {
                Err(ProtocolError::NotConnected.into())
            } else {
                script.remove(0)
            }
        }
        async fn diagnose(&mut self) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn close(&mut self) {
            *self.closes.lock() += 1;
        }
    }

    fn sample(value: i64) -> PollOutcome {
        PollOutcome::samples(vec![DeviceSample::new(
            "Random.Int4",
            json!(value),
            Quality::Good,
            "2021-06-03T15:14:21Z",
        )])
    }

    #[tokio::test]
    async fn consecutive_failures_fault_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(
            LocalRecordStream::open(dir.path(), "local", StreamOptions::new(1 << 20, 1 << 16), None)
                .unwrap(),
        );
        let location = LocationHierarchy::new("site", "area", "process", "machine");
        let bus = Arc::new(InMemoryBus::new());
        let replier = Replier::new(bus.clone() as Arc<dyn MessageBus>, "conn", location.clone());
        let (_tx, rx) = watch::channel(ControlWord::Run);
        let closes = Arc::new(Mutex::new(0));
        let driver = Scripted {
            script: Arc::new(Mutex::new(vec![
                Ok(sample(1)),
                Err(ProtocolError::NotConnected.into()),
                Ok(sample(2)),
            ])),
            closes: closes.clone(),
        };
        let state = StateHandle::new("conn", None);
        state.set(ConnectionState::Running);
        let poll_loop = PollLoop::new(
            "conn",
            Box::new(driver),
            RecordEmitter::new("conn", location, stream.clone(), None),
            replier,
            rx,
            state.clone(),
            Arc::new(IterationTimer::new()),
            3,
            None,
        );

        assert_eq!(poll_loop.run().await, LoopExit::Faulted);
        assert_eq!(stream.newest_sequence(), Some(1));
        assert_eq!(state.get(), ConnectionState::Stopping);
        // one close per reconnect attempt plus the final close
        assert_eq!(*closes.lock(), 4);
        let errors = bus.published_on("m2c2/error/conn");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].json().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("3 consecutive"));
    }

    #[tokio::test]
    async fn stop_word_ends_the_loop_before_the_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(
            LocalRecordStream::open(dir.path(), "local", StreamOptions::new(1 << 20, 1 << 16), None)
                .unwrap(),
        );
        let location = LocationHierarchy::new("site", "area", "process", "machine");
        let replier = Replier::new(Arc::new(InMemoryBus::new()), "conn", location.clone());
        let (tx, rx) = watch::channel(ControlWord::Run);
        let script = Arc::new(Mutex::new((0..1000).map(|i| Ok(sample(i))).collect()));
        let driver = Scripted {
            script,
            closes: Arc::new(Mutex::new(0)),
        };
        let task = tokio::spawn(
            PollLoop::new(
                "conn",
                Box::new(driver),
                RecordEmitter::new("conn", location, stream.clone(), None),
                replier,
                rx,
                StateHandle::new("conn", None),
                Arc::new(IterationTimer::new()),
                5,
                None,
            )
            .run(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send_replace(ControlWord::Stop);
        let before = stream.next_sequence();
        assert_eq!(task.await.unwrap(), LoopExit::Stopped);
        assert!(stream.next_sequence() <= before + 1);
        assert!(before >= 1);
    }
}
