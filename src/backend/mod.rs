#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;
#[cfg(feature = "sysfs-gpio")]
pub mod sysfs;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;
#[cfg(feature = "sysfs-gpio")]
pub use sysfs::SysfsBackend;
