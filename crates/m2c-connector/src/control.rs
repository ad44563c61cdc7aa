//! ---
//! m2c_section: "04-configuration-orchestration"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Control dispatcher: start, stop, update, push and pull for one connection."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use m2c_common::ConnectorConfig;
use m2c_logging::{m2c_error, m2c_info, m2c_warn, LogContext};
use m2c_metrics::ConnectorMetrics;
use m2c_model::{
    ConnectionDefinition, ControlMessage, ControlVerb, LocationHierarchy, ModelError,
};
use m2c_msg::{MessageBus, Replier, Subscription};
use m2c_persistence::{ConnectionStateStore, LocalRecordStream};
use m2c_rt::{IterationTimer, LinearBackoff, ReentrancyLatch};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::driver::{DeviceDriver, DriverFactory};
use crate::emitter::RecordEmitter;
use crate::poller::{ControlWord, LoopExit, PollLoop};
use crate::state::{ConnectionState, StateHandle};
use crate::{ConnectorError, Result};

/// Shortest time a stop waits for the polling task before aborting it.
const MIN_STOP_WAIT: Duration = Duration::from_millis(100);
/// `stop` waits `STOP_WAIT_FACTOR * ttl`, capped by the configured maximum.
const STOP_WAIT_FACTOR: u32 = 5;

/// Retry and timing knobs of the control handler.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub connection_retry: u32,
    pub error_retry: u32,
    pub retry_unit: Duration,
    pub stop_wait_cap: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self::from(&ConnectorConfig::default())
    }
}

impl From<&ConnectorConfig> for ConnectorSettings {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            connection_retry: config.connection_retry.max(1),
            error_retry: config.error_retry.max(1),
            retry_unit: config.retry_unit,
            stop_wait_cap: config.stop_wait_cap,
        }
    }
}

struct ActiveLoop {
    control: watch::Sender<ControlWord>,
    task: JoinHandle<LoopExit>,
    timer: Arc<IterationTimer>,
}

/// Control handler of one connection.
///
/// Verbs are serialised by a non-reentrant latch: a message that arrives while
/// another is being handled is answered with an info reply and dropped.
pub struct Connector {
    name: String,
    store: ConnectionStateStore,
    stream: Arc<LocalRecordStream>,
    factory: Arc<dyn DriverFactory>,
    bus: Arc<dyn MessageBus>,
    location: Mutex<LocationHierarchy>,
    latch: ReentrancyLatch,
    state: StateHandle,
    active: tokio::sync::Mutex<Option<ActiveLoop>>,
    settings: ConnectorSettings,
    metrics: Option<ConnectorMetrics>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Connector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        store: ConnectionStateStore,
        stream: Arc<LocalRecordStream>,
        factory: Arc<dyn DriverFactory>,
        bus: Arc<dyn MessageBus>,
        location: LocationHierarchy,
        settings: ConnectorSettings,
        metrics: Option<ConnectorMetrics>,
    ) -> Self {
        let name = name.into();
        Self {
            state: StateHandle::new(&name, metrics.clone()),
            name,
            store,
            stream,
            factory,
            bus,
            location: Mutex::new(location),
            latch: ReentrancyLatch::new(),
            active: tokio::sync::Mutex::new(None),
            settings,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// A control message is currently being handled.
    pub fn is_processing(&self) -> bool {
        self.latch.is_held()
    }

    fn replier(&self) -> Replier {
        Replier::new(Arc::clone(&self.bus), &self.name, self.location.lock().clone())
    }

    fn ctx(&self) -> LogContext<'_> {
        LogContext::connection(&self.name)
    }

    /// Consume control messages until `shutdown` fires or the subscription
    /// ends, then stop polling without touching the state file.
    pub async fn serve(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut inflight = JoinSet::new();
        m2c_info!(context = self.ctx(), "listening on {}", subscription.filter());
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                message = subscription.recv() => match message {
                    Some(message) => {
                        let connector = Arc::clone(&self);
                        inflight.spawn(async move { connector.handle(&message.payload).await });
                    }
                    None => {
                        m2c_warn!(context = self.ctx(), "control subscription closed");
                        break;
                    }
                },
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }
        inflight.abort_all();
        while inflight.join_next().await.is_some() {}
        self.shutdown().await;
        Ok(())
    }

    /// Decode and dispatch one job payload.
    pub async fn handle(&self, payload: &[u8]) {
        let message = match ControlMessage::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                m2c_warn!(context = self.ctx(), "invalid control message: {}", err);
                self.replier()
                    .error(json!(format!("Invalid control message: {err}")))
                    .await;
                return;
            }
        };
        if message.connection_name != self.name {
            let err = ConnectorError::WrongConnection {
                expected: self.name.clone(),
                got: message.connection_name,
            };
            m2c_warn!(context = self.ctx(), "{}", err);
            self.replier().error(json!(err.to_string())).await;
            return;
        }
        let verb = message.verb;
        let Some(_guard) = self.latch.try_acquire() else {
            m2c_info!(context = self.ctx(), "{} dropped while another request is in progress", verb);
            self.replier()
                .info(json!(format!(
                    "Still processing the previous request, `{verb}` was not applied."
                )))
                .await;
            return;
        };
        if let Err(err) = self.dispatch(message).await {
            m2c_error!(context = self.ctx(), "{} failed: {}", verb, err);
            self.replier()
                .error(json!(format!("Failed to {verb} the connection: {err}")))
                .await;
        }
    }

    async fn dispatch(&self, message: ControlMessage) -> Result<()> {
        let definition = message.definition;
        let required = || definition.clone().ok_or(ModelError::MissingField("protocol"));
        match message.verb {
            ControlVerb::Start => self.start(required()?).await,
            ControlVerb::Stop => self.stop().await,
            ControlVerb::Update => self.update(required()?).await,
            ControlVerb::Push => self.push(required()?).await,
            ControlVerb::Pull => self.pull().await,
        }
    }

    /// Persist `definition`, open the device session and start polling.
    pub async fn start(&self, definition: ConnectionDefinition) -> Result<()> {
        if self.state.get().is_active() {
            self.replier().info(json!("Connection already started.")).await;
            return Ok(());
        }
        *self.location.lock() = definition.location.clone();
        let previous = self.store.read_raw()?;
        let definition = definition.with_control(ControlVerb::Start);
        self.store.write(&definition)?;
        if let Err(err) = self.launch(&definition).await {
            if let Err(restore) = self.store.restore(previous.as_ref()) {
                m2c_warn!(context = self.ctx(), "could not roll back the state file: {}", restore);
            }
            return Err(err);
        }
        self.replier().info(json!("Connection started.")).await;
        Ok(())
    }

    /// Drain and close the session, then record `control=stop`.
    pub async fn stop(&self) -> Result<()> {
        if !self.halt(ControlWord::Stop).await {
            self.replier().info(json!("Connection already stopped.")).await;
            return Ok(());
        }
        if let Some(stored) = self.store.read()? {
            self.store
                .write(&stored.definition.with_control(ControlVerb::Stop))?;
        }
        self.replier().info(json!("Connection stopped.")).await;
        Ok(())
    }

    /// `stop; start` with a new definition, rolling back on failure.
    pub async fn update(&self, definition: ConnectionDefinition) -> Result<()> {
        let state = self.state.get();
        if !matches!(state, ConnectionState::Running | ConnectionState::Reconnecting) {
            return Err(ConnectorError::NotRunning(state));
        }
        let previous_raw = self.store.read_raw()?;
        let previous = self.store.read()?.map(|stored| stored.definition);
        let previous_location = self.location.lock().clone();

        self.halt(ControlWord::Stop).await;
        *self.location.lock() = definition.location.clone();
        let definition = definition.with_control(ControlVerb::Start);
        let outcome = match self.store.write(&definition) {
            Ok(()) => self.launch(&definition).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = outcome {
            m2c_warn!(context = self.ctx(), "update failed, restoring previous definition: {}", err);
            if let Err(restore) = self.store.restore(previous_raw.as_ref()) {
                m2c_warn!(context = self.ctx(), "could not roll back the state file: {}", restore);
            }
            *self.location.lock() = previous_location;
            if let Some(previous) = previous.filter(|previous| previous.control == ControlVerb::Start) {
                if let Err(relaunch) = self.launch(&previous).await {
                    m2c_warn!(context = self.ctx(), "previous definition did not restart: {}", relaunch);
                }
            }
            return Err(err);
        }
        self.replier().info(json!("Connection updated.")).await;
        Ok(())
    }

    /// One diagnostic round trip on a separate session.
    pub async fn push(&self, definition: ConnectionDefinition) -> Result<()> {
        let mut driver = self.factory.create(&definition)?;
        let report = async {
            driver.open().await?;
            driver.diagnose().await
        }
        .await;
        driver.close().await;
        let report = report?;
        self.replier()
            .info(json!({
                "protocol": definition.protocol_kind().to_string(),
                "diagnostics": report,
            }))
            .await;
        Ok(())
    }

    /// Reply with the stored state file.
    pub async fn pull(&self) -> Result<()> {
        match self.store.read_raw()? {
            Some(value) => self.replier().info(value).await,
            None => {
                self.replier()
                    .error(json!(format!("No local state file for connection {}.", self.name)))
                    .await
            }
        }
        Ok(())
    }

    /// Restart a connection whose state file says `control=start`.
    pub async fn resume(&self) -> Result<bool> {
        let Some(stored) = self.store.read()? else {
            return Ok(false);
        };
        if stored.definition.control != ControlVerb::Start {
            return Ok(false);
        }
        if stored.definition.connection_name != self.name {
            m2c_warn!(
                context = self.ctx(),
                "state file belongs to {}, not resuming",
                stored.definition.connection_name
            );
            return Ok(false);
        }
        let Some(_guard) = self.latch.try_acquire() else {
            return Ok(false);
        };
        m2c_info!(context = self.ctx(), "resuming connection from {}", self.store.path().display());
        self.start(stored.definition).await?;
        Ok(true)
    }

    /// Stop polling for process shutdown; the state file is left untouched so
    /// the connection resumes on the next start.
    pub async fn shutdown(&self) {
        self.halt(ControlWord::Shutdown).await;
        if let Err(err) = self.stream.flush() {
            m2c_warn!(context = self.ctx(), "stream flush failed: {}", err);
        }
    }

    async fn open_with_retry(&self, definition: &ConnectionDefinition) -> Result<Box<dyn DeviceDriver>> {
        let mut driver = self.factory.create(definition)?;
        let mut backoff = LinearBackoff::new(
            self.settings.retry_unit,
            self.settings.connection_retry.saturating_sub(1),
        );
        loop {
            match driver.open().await {
                Ok(()) => return Ok(driver),
                Err(err) => {
                    let attempts = backoff.attempts() + 1;
                    match backoff.next_delay() {
                        Some(delay) => {
                            m2c_warn!(
                                context = self.ctx(),
                                "connect attempt {} failed, retrying in {:?}: {}",
                                attempts,
                                delay,
                                err
                            );
                            driver.close().await;
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            driver.close().await;
                            return Err(ConnectorError::ConnectFailed {
                                attempts,
                                source: Box::new(err),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn launch(&self, definition: &ConnectionDefinition) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        let driver = match self.open_with_retry(definition).await {
            Ok(driver) => driver,
            Err(err) => {
                self.state.set(ConnectionState::Idle);
                return Err(err);
            }
        };
        let (control, rx) = watch::channel(ControlWord::Run);
        let timer = Arc::new(IterationTimer::new());
        let emitter = RecordEmitter::new(
            &self.name,
            definition.location.clone(),
            Arc::clone(&self.stream),
            self.metrics.clone(),
        );
        let poll_loop = PollLoop::new(
            &self.name,
            driver,
            emitter,
            self.replier(),
            rx,
            self.state.clone(),
            Arc::clone(&timer),
            self.settings.error_retry,
            self.metrics.clone(),
        );
        self.state.set(ConnectionState::Running);

        let store = self.store.clone();
        let state = self.state.clone();
        let stopped = definition.with_control(ControlVerb::Stop);
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let exit = poll_loop.run().await;
            if exit == LoopExit::Faulted {
                if let Err(err) = store.write(&stopped) {
                    m2c_error!(
                        context = LogContext::connection(&name),
                        "failed to record the stop in the state file: {}",
                        err
                    );
                }
            }
            state.set(ConnectionState::Idle);
            exit
        });
        *self.active.lock().await = Some(ActiveLoop {
            control,
            task,
            timer,
        });
        let protocol = definition.protocol_kind().to_string();
        m2c_info!(context = self.ctx().with_protocol(&protocol), "connection running");
        Ok(())
    }

    /// Signal the polling task and wait `min(5 * ttl, cap)` for it to finish,
    /// aborting it after that. Returns `false` when nothing was running.
    async fn halt(&self, word: ControlWord) -> bool {
        let Some(mut active) = self.active.lock().await.take() else {
            return false;
        };
        if active.task.is_finished() || self.state.get() == ConnectionState::Idle {
            let _ = active.task.await;
            self.state.set(ConnectionState::Idle);
            return false;
        }
        self.state.set(ConnectionState::Stopping);
        active.control.send_replace(word);
        let wait = active
            .timer
            .stop_wait(STOP_WAIT_FACTOR, self.settings.stop_wait_cap)
            .max(MIN_STOP_WAIT);
        match tokio::time::timeout(wait, &mut active.task).await {
            Ok(Ok(exit)) => {
                m2c_info!(context = self.ctx(), "polling task finished: {:?}", exit);
            }
            Ok(Err(err)) => {
                m2c_error!(context = self.ctx(), "polling task failed: {}", err);
            }
            Err(_) => {
                m2c_warn!(context = self.ctx(), "polling task still busy after {:?}, aborting", wait);
                active.task.abort();
                let _ = active.task.await;
            }
        }
        self.state.set(ConnectionState::Idle);
        true
    }
}
