use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::command::{CommandExecutor, CommandOutcome};
use crate::config::{ControllerSettings, RawConfig};
use crate::engine::{EngineContext, FaultSink, RefreshEngine};
use crate::error::AppError;
use crate::gpio::GpioBackend;
use crate::notify::NotifyHook;
use crate::offset::BaseOffsetProbe;
use crate::registry::{HandleRegistry, PinFailure};
use crate::roster::PinRoster;
use crate::state::{Level, PinState, StateStore};

/// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Stopped,
    Ok,
    Degraded,
    ConnectionFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub state: ConnectionState,
    pub message: Option<String>,
    pub failed_pins: Vec<PinFailure>,
}

impl ControllerStatus {
    fn stopped() -> Self {
        Self {
            state: ConnectionState::Stopped,
            message: None,
            failed_pins: Vec::new(),
        }
    }

    fn failure(message: String) -> Self {
        Self {
            state: ConnectionState::ConnectionFailure,
            message: Some(message),
            failed_pins: Vec::new(),
        }
    }

    fn running(failed_pins: Vec<PinFailure>) -> Self {
        if failed_pins.is_empty() {
            return Self {
                state: ConnectionState::Ok,
                message: None,
                failed_pins,
            };
        }

        let message = match failed_pins.as_slice() {
            [only] => format!("Pin {} is inaccessible", only.pin),
            many => {
                let pins: Vec<String> = many.iter().map(|f| f.pin.to_string()).collect();
                format!("Pins {} are inaccessible", pins.join(", "))
            }
        };
        Self {
            state: ConnectionState::Degraded,
            message: Some(message),
            failed_pins,
        }
    }
}

struct ControllerView {
    roster: Arc<PinRoster>,
    base_offset: u32,
    status: ControllerStatus,
    raw: RawConfig,
    executor: Option<CommandExecutor>,
}

impl Default for ControllerView {
    fn default() -> Self {
        Self {
            roster: Arc::new(PinRoster::default()),
            base_offset: 0,
            status: ControllerStatus::stopped(),
            raw: RawConfig::default(),
            executor: None,
        }
    }
}

/// Owns the live roster, its handles and the refresh engine, and rebuilds
/// all of them on every configuration change.
pub struct GpioController<B: GpioBackend> {
    backend: Arc<B>,
    probe: Arc<dyn BaseOffsetProbe>,
    notifier: Arc<dyn NotifyHook>,
    faults: FaultSink,
    store: Arc<StateStore>,
    engine: Mutex<Option<RefreshEngine>>,
    view: RwLock<ControllerView>,
}

impl<B: GpioBackend> GpioController<B> {
    pub fn new(
        backend: Arc<B>,
        probe: Arc<dyn BaseOffsetProbe>,
        notifier: Arc<dyn NotifyHook>,
        faults: FaultSink,
    ) -> Self {
        Self {
            backend,
            probe,
            notifier,
            faults,
            store: Arc::new(StateStore::new()),
            engine: Mutex::new(None),
            view: RwLock::new(ControllerView::default()),
        }
    }

    /// Builds the roster, acquires handles and starts the engine. A running
    /// configuration is torn down first, but only once the new one parses.
    pub async fn init(&self, raw: &RawConfig) -> Result<ControllerStatus, AppError> {
        info!("Processing config");
        let settings = match ControllerSettings::parse(raw) {
            Ok(settings) => settings,
            Err(e) => return Err(self.reject(e)),
        };

        let mut engine = self.engine.lock().await;
        if let Some(previous) = engine.take() {
            self.teardown(previous).await;
        }

        let base_offset = match settings.base_offset {
            Some(base) => base,
            None => self.detect_base_offset(),
        };

        if let Err(e) = self.backend.check_access() {
            error!("GPIO is inaccessible: {e}");
            let mut view = self.view.write();
            view.status = ControllerStatus::failure(format!("GPIO is inaccessible: {e}"));
            view.raw = raw.clone();
            view.base_offset = base_offset;
            return Err(match e {
                AppError::Inaccessible(reason) => AppError::Inaccessible(reason),
                other => AppError::Inaccessible(other.to_string()),
            });
        }
        debug!("GPIO is accessible (base at {base_offset})");

        info!("Setting up GPIO");
        let roster = Arc::new(settings.roster);
        let (registry, mut failures) =
            HandleRegistry::acquire(self.backend.as_ref(), &roster, base_offset);

        let ctx = EngineContext {
            roster: roster.clone(),
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            faults: self.faults.clone(),
            refresh_interval: settings.refresh_interval,
        };
        let (started, watch_failures) = RefreshEngine::start(ctx, registry);
        failures.extend(watch_failures);

        let status = ControllerStatus::running(failures);
        if let Some(message) = &status.message {
            warn!("{message}");
        }
        info!("GPIO setup complete");

        {
            let mut view = self.view.write();
            view.roster = roster;
            view.base_offset = base_offset;
            view.status = status.clone();
            view.raw = raw.clone();
            view.executor = Some(started.executor());
        }
        *engine = Some(started);

        Ok(status)
    }

    /// Full stop, release, rebuild, reacquire and start. An invalid
    /// configuration is rejected and the running one stays in place.
    pub async fn reconfigure(&self, raw: &RawConfig) -> Result<ControllerStatus, AppError> {
        info!("Configuration changed, rebuilding pins");
        self.init(raw).await
    }

    fn reject(&self, e: AppError) -> AppError {
        let mut view = self.view.write();
        if view.executor.is_some() {
            warn!("Rejected configuration, keeping the running one: {e}");
        } else {
            error!("{e}");
            view.status = ControllerStatus::failure(e.to_string());
        }
        e
    }

    /// Stops the engine and unexports every handle. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut engine = self.engine.lock().await;
        if let Some(running) = engine.take() {
            self.teardown(running).await;
        }
    }

    async fn teardown(&self, engine: RefreshEngine) {
        {
            let mut view = self.view.write();
            view.executor = None;
        }
        let mut registry = engine.stop().await;
        registry.release();

        let mut view = self.view.write();
        view.roster = Arc::new(PinRoster::default());
        view.status = ControllerStatus::stopped();
        self.store.reset(&[]);
    }

    fn detect_base_offset(&self) -> u32 {
        match self.probe.detect() {
            Ok(Some(base)) => {
                info!("Detected base offset {base}");
                base
            }
            Ok(None) => {
                debug!("No pin controller found, using base offset 0");
                0
            }
            Err(e) => {
                warn!("Base offset detection failed, using 0: {e}");
                0
            }
        }
    }

    pub async fn set_pin(&self, pin: u8, level: Level) -> Result<CommandOutcome, AppError> {
        let executor = self
            .view
            .read()
            .executor
            .clone()
            .ok_or(AppError::EngineStopped)?;
        executor.set_pin(pin, level).await
    }

    pub fn roster(&self) -> Arc<PinRoster> {
        self.view.read().roster.clone()
    }

    pub fn states(&self) -> BTreeMap<u8, PinState> {
        self.store.all_states()
    }

    pub fn state(&self, pin: u8) -> Result<PinState, AppError> {
        if !self.store.contains(pin) {
            return Err(AppError::NotFoundPin(pin.to_string()));
        }
        Ok(self.store.get(pin))
    }

    pub fn variables(&self) -> BTreeMap<String, String> {
        self.store.variables(self.view.read().base_offset)
    }

    pub fn base_offset(&self) -> u32 {
        self.view.read().base_offset
    }

    pub fn config(&self) -> RawConfig {
        self.view.read().raw.clone()
    }

    pub fn is_running(&self) -> bool {
        self.view
            .read()
            .executor
            .as_ref()
            .is_some_and(|e| !e.is_closed())
    }

    /// Worst condition observed so far; an engine that ended on its own
    /// reports a connection failure.
    pub fn status(&self) -> ControllerStatus {
        let view = self.view.read();
        match &view.executor {
            Some(executor) if executor.is_closed() => ControllerStatus {
                state: ConnectionState::ConnectionFailure,
                message: Some("Refresh engine stopped".into()),
                failed_pins: view.status.failed_pins.clone(),
            },
            _ => view.status.clone(),
        }
    }
}
