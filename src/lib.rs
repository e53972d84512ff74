mod backend;
mod command;
mod config;
mod controller;
mod engine;
mod error;
mod gpio;
mod notify;
mod offset;
mod registry;
mod roster;
mod routes;
mod state;

pub use command::{CommandExecutor, CommandOutcome};
pub use config::{AppConfig, BackendKind, ControllerSettings, GpioConfig, HttpConfig, RawConfig};
pub use controller::{ConnectionState, ControllerStatus, GpioController};
pub use engine::{EngineContext, FaultSink, RefreshEngine, refresh_one};
pub use error::AppError;
pub use gpio::{GpioBackend, LineRequest, PinHandle, WatchCallback};
pub use notify::{BroadcastNotifier, NotifyHook, StateUpdate, UpdateSource};
pub use offset::{BaseOffsetProbe, FixedBaseOffset, SysfsBaseOffset};
pub use registry::{HandleRegistry, PinFailure};
pub use roster::{Direction, InputSettings, PIN_COUNT, PinChoice, PinConfig, PinRoster, Trigger};
pub use routes::AppState;
pub use state::{Level, PinState, StateStore};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
#[cfg(feature = "sysfs-gpio")]
pub use backend::SysfsBackend;
