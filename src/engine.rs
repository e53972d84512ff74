use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::command::{self, CommandExecutor, CommandOutcome};
use crate::error::AppError;
use crate::gpio::WatchCallback;
use crate::notify::{NotifyHook, StateUpdate, UpdateSource};
use crate::registry::{HandleRegistry, PinFailure};
use crate::roster::PinRoster;
use crate::state::{Level, PinState, StateStore};

/// Receives errors that must end the process.
pub type FaultSink = mpsc::UnboundedSender<AppError>;

pub(crate) enum EngineRequest {
    Sweep(UpdateSource),
    SetPin {
        pin: u8,
        level: Level,
        reply: oneshot::Sender<Result<CommandOutcome, AppError>>,
    },
    WatchFault {
        pin: u8,
        error: AppError,
    },
    Stop,
}

/// Everything the engine reads or updates besides the handles themselves.
pub struct EngineContext {
    pub roster: Arc<PinRoster>,
    pub store: Arc<StateStore>,
    pub notifier: Arc<dyn NotifyHook>,
    pub faults: FaultSink,
    pub refresh_interval: Duration,
}

/// Reads one pin. A missing handle or failed read yields `unknown`.
pub fn refresh_one(registry: &HandleRegistry, pin: u8) -> PinState {
    let Some(handle) = registry.handle(pin) else {
        return PinState::Unknown;
    };
    match handle.read_sync() {
        Ok(raw) => PinState::from_raw(raw),
        Err(e) => {
            debug!("reading pin {pin} failed: {e}");
            PinState::Unknown
        }
    }
}

/// Keeps the state store in sync with the hardware.
///
/// The timer, edge watches and commands all feed one queue consumed by a
/// single task, which owns the handle registry while the engine runs.
pub struct RefreshEngine {
    tx: mpsc::UnboundedSender<EngineRequest>,
    task: Option<JoinHandle<HandleRegistry>>,
}

impl RefreshEngine {
    /// Resets the store for the roster, arms edge watches and spawns the
    /// update loop. Must be called inside a tokio runtime.
    pub fn start(ctx: EngineContext, mut registry: HandleRegistry) -> (Self, Vec<PinFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.store.reset(&ctx.roster.all_active());

        let mut failures = Vec::new();
        for pin in ctx.roster.triggered_inputs() {
            if !registry.is_live(pin) {
                continue;
            }
            if let Err(e) = registry.watch(pin, Self::edge_callback(pin, tx.clone())) {
                error!("failed to watch pin {pin}: {e}");
                failures.push(PinFailure {
                    pin,
                    address: registry.address(pin),
                    reason: e.to_string(),
                });
            }
        }

        info!(
            "Started polling every {} ms",
            ctx.refresh_interval.as_millis()
        );
        let worker = EngineWorker { ctx, registry };
        let task = tokio::spawn(worker.run(rx));

        (
            Self {
                tx,
                task: Some(task),
            },
            failures,
        )
    }

    fn edge_callback(pin: u8, tx: mpsc::UnboundedSender<EngineRequest>) -> WatchCallback {
        Arc::new(move |event: Result<u8, AppError>| {
            let request = match event {
                Ok(_) => EngineRequest::Sweep(UpdateSource::Edge { pin }),
                Err(error) => EngineRequest::WatchFault { pin, error },
            };
            // the loop may already be gone during teardown
            let _ = tx.send(request);
        })
    }

    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(self.tx.clone())
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues an out-of-band full sweep.
    #[cfg(test)]
    pub(crate) fn request_sweep(&self, source: UpdateSource) -> Result<(), AppError> {
        self.tx
            .send(EngineRequest::Sweep(source))
            .map_err(|_| AppError::EngineStopped)
    }

    /// Stops the loop once the request in progress is done and hands the
    /// registry back for release.
    pub async fn stop(mut self) -> HandleRegistry {
        let _ = self.tx.send(EngineRequest::Stop);
        let Some(task) = self.task.take() else {
            return HandleRegistry::empty();
        };
        match task.await {
            Ok(registry) => {
                info!("Stopped polling");
                registry
            }
            Err(e) => {
                // the registry was dropped, and so released, with the task
                error!("refresh engine task failed: {e}");
                HandleRegistry::empty()
            }
        }
    }
}

impl Drop for RefreshEngine {
    fn drop(&mut self) {
        // watch callbacks hold senders, so the queue never closes on its own
        if self.task.is_some() {
            let _ = self.tx.send(EngineRequest::Stop);
        }
    }
}

struct EngineWorker {
    ctx: EngineContext,
    registry: HandleRegistry,
}

impl EngineWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<EngineRequest>) -> HandleRegistry {
        self.sweep(UpdateSource::Initial);

        let period = self.ctx.refresh_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(UpdateSource::Timer),
                request = rx.recv() => match request {
                    None | Some(EngineRequest::Stop) => break,
                    Some(EngineRequest::Sweep(source)) => {
                        if let UpdateSource::Edge { pin } = source {
                            info!("Registering interrupt on pin {pin}, refreshing all GPIO pin states");
                        }
                        self.sweep(source);
                    }
                    Some(EngineRequest::SetPin { pin, level, reply }) => {
                        let result = command::execute(&self.ctx, &self.registry, pin, level);
                        let _ = reply.send(result);
                    }
                    Some(EngineRequest::WatchFault { pin, error }) => {
                        error!("Problem on interrupt handler for pin {pin}: {error}");
                        let _ = self.ctx.faults.send(AppError::Interrupt {
                            pin,
                            reason: error.to_string(),
                        });
                        break;
                    }
                },
            }
        }

        self.registry
    }

    /// Reads every active pin, then notifies once.
    fn sweep(&self, source: UpdateSource) {
        for pin in self.ctx.roster.all_active() {
            let state = refresh_one(&self.registry, pin);
            self.ctx.store.set(pin, state);
        }
        self.ctx
            .notifier
            .notify(&StateUpdate::new(source, self.ctx.store.all_states()));
    }
}
