use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{EngineContext, EngineRequest, refresh_one};
use crate::error::AppError;
use crate::notify::{StateUpdate, UpdateSource};
use crate::registry::HandleRegistry;
use crate::state::{Level, PinState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "state", rename_all = "kebab-case")]
pub enum CommandOutcome {
    /// The write went through; carries the level read back afterwards.
    Written(PinState),
    /// The pin is not a live output, nothing was done.
    Skipped,
}

/// Queues pin writes on the refresh engine.
#[derive(Clone)]
pub struct CommandExecutor {
    tx: mpsc::UnboundedSender<EngineRequest>,
}

impl CommandExecutor {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineRequest>) -> Self {
        Self { tx }
    }

    pub async fn set_pin(&self, pin: u8, level: Level) -> Result<CommandOutcome, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::SetPin { pin, level, reply })
            .map_err(|_| AppError::EngineStopped)?;
        rx.await.map_err(|_| AppError::EngineStopped)?
    }

    /// True once the engine loop has ended.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writes `level` to an output pin, reads it back into the store and
/// notifies once.
pub(crate) fn execute(
    ctx: &EngineContext,
    registry: &HandleRegistry,
    pin: u8,
    level: Level,
) -> Result<CommandOutcome, AppError> {
    if !ctx.roster.is_output(pin) {
        debug!("pin {pin} is not an active output, nothing to do");
        return Ok(CommandOutcome::Skipped);
    }
    let Some(handle) = registry.handle(pin) else {
        debug!("pin {pin} has no live handle, nothing to do");
        return Ok(CommandOutcome::Skipped);
    };

    info!("Setting pin {pin} to {level:?} ({})", level.raw());
    handle.write(level.raw()).map_err(|e| {
        error!("failed to set pin {pin} to {level:?}: {e}");
        e
    })?;

    let state = refresh_one(registry, pin);
    if state != PinState::from(level) {
        warn!("pin {pin} reads {state:?} after writing {level:?}");
    }
    ctx.store.set(pin, state);
    ctx.notifier.notify(&StateUpdate::new(
        UpdateSource::Command { pin },
        ctx.store.all_states(),
    ));

    Ok(CommandOutcome::Written(state))
}
