use std::sync::Arc;

use serde::Serialize;

use crate::error::AppError;
use crate::roster::{Direction, InputSettings, Trigger};

/// Callback receiving the level after an edge, or the error that broke the watch.
pub type WatchCallback = Arc<dyn Fn(Result<u8, AppError>) + Send + Sync>;

/// Everything a backend needs to open one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRequest {
    pub direction: Direction,
    pub trigger: Trigger,
    pub debounce_ms: Option<u32>,
    pub active_low: bool,
}

impl LineRequest {
    pub fn output() -> Self {
        Self {
            direction: Direction::Out,
            trigger: Trigger::None,
            debounce_ms: None,
            active_low: false,
        }
    }

    pub fn input(settings: &InputSettings) -> Self {
        Self {
            direction: Direction::In,
            trigger: settings.trigger,
            debounce_ms: settings.debounce_ms,
            active_low: settings.invert,
        }
    }
}

/// An opened line. Owned by exactly one registry.
pub trait PinHandle: Send + Sync {
    /// Raw level as reported by the driver, normally 0 or 1.
    fn read_sync(&self) -> Result<u8, AppError>;
    fn write(&self, value: u8) -> Result<(), AppError>;
    /// Registers `callback` for the edges configured at open time.
    fn watch(&mut self, callback: WatchCallback) -> Result<(), AppError>;
    /// Releases the line and cancels any watch. Later calls are no-ops.
    fn unexport(&mut self) -> Result<(), AppError>;
}

pub trait GpioBackend: Send + Sync {
    /// Fails when the GPIO subsystem as a whole cannot be used.
    fn check_access(&self) -> Result<(), AppError>;
    fn open(&self, address: u32, request: &LineRequest) -> Result<Box<dyn PinHandle>, AppError>;
}
