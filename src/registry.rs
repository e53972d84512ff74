use log::{debug, error, info, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::AppError;
use crate::gpio::{GpioBackend, LineRequest, PinHandle, WatchCallback};
use crate::roster::PinRoster;

/// A pin that stayed in the roster without a live handle.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PinFailure {
    pub pin: u8,
    pub address: u32,
    pub reason: String,
}

/// Sole owner of the hardware handles of one roster.
pub struct HandleRegistry {
    handles: FxHashMap<u8, Box<dyn PinHandle>>,
    base_offset: u32,
}

impl HandleRegistry {
    pub fn empty() -> Self {
        Self {
            handles: FxHashMap::default(),
            base_offset: 0,
        }
    }

    /// Opens one handle per roster pin at `pin + base_offset`. A failing pin is
    /// reported and skipped.
    pub fn acquire<B: GpioBackend + ?Sized>(
        backend: &B,
        roster: &PinRoster,
        base_offset: u32,
    ) -> (Self, Vec<PinFailure>) {
        let mut registry = Self {
            handles: FxHashMap::default(),
            base_offset,
        };
        let mut failures = Vec::new();

        let requests = roster
            .outputs()
            .iter()
            .map(|pin| (*pin, LineRequest::output()))
            .chain(
                roster
                    .inputs()
                    .iter()
                    .map(|(pin, settings)| (*pin, LineRequest::input(settings))),
            );

        for (pin, request) in requests {
            let address = registry.address(pin);
            debug!("opening pin {pin} ({address}) as {:?}", request);

            match backend.open(address, &request) {
                Ok(handle) => {
                    registry.handles.insert(pin, handle);
                }
                Err(e) => {
                    error!("GPIO pin {pin} ({address}) is inaccessible: {e}");
                    failures.push(PinFailure {
                        pin,
                        address,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "acquired {} of {} pins",
            registry.handles.len(),
            registry.handles.len() + failures.len()
        );

        (registry, failures)
    }

    pub fn address(&self, pin: u8) -> u32 {
        u32::from(pin) + self.base_offset
    }

    pub fn handle(&self, pin: u8) -> Option<&dyn PinHandle> {
        self.handles.get(&pin).map(|h| h.as_ref())
    }

    pub fn is_live(&self, pin: u8) -> bool {
        self.handles.contains_key(&pin)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Arms an edge watch on a live pin.
    pub fn watch(&mut self, pin: u8, callback: WatchCallback) -> Result<(), AppError> {
        let handle = self
            .handles
            .get_mut(&pin)
            .ok_or_else(|| AppError::Acquire {
                pin,
                reason: "no live handle".into(),
            })?;
        handle.watch(callback)
    }

    /// Unexports every live handle once. Calling it again is a no-op.
    pub fn release(&mut self) {
        let count = self.handles.len();
        for (pin, mut handle) in self.handles.drain() {
            if let Err(e) = handle.unexport() {
                warn!("failed to unexport pin {pin}: {e}");
            }
        }
        if count > 0 {
            info!("released {count} pins");
        }
    }
}

impl Drop for HandleRegistry {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::roster::{InputSettings, PinConfig, Trigger};

    fn roster() -> PinRoster {
        PinRoster::from_pins([
            (2, PinConfig::output()),
            (3, PinConfig::output()),
            (
                5,
                PinConfig::input(InputSettings {
                    trigger: Trigger::Both,
                    debounce_ms: Some(5),
                    invert: true,
                }),
            ),
        ])
    }

    #[test]
    fn acquires_at_offset_addresses() {
        let backend = MockGpioBackend::default();
        let (registry, failures) = HandleRegistry::acquire(&backend, &roster(), 512);

        assert!(failures.is_empty());
        assert_eq!(registry.len(), 3);
        assert!(backend.is_open(514));
        assert_eq!(
            backend.request(517),
            Some(LineRequest {
                direction: crate::roster::Direction::In,
                trigger: Trigger::Both,
                debounce_ms: Some(5),
                active_low: true,
            })
        );
    }

    #[test]
    fn failure_is_isolated_to_one_pin() {
        let backend = MockGpioBackend::default();
        backend.fail_open(3, "already exported");
        let (registry, failures) = HandleRegistry::acquire(&backend, &roster(), 0);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].pin, 3);
        assert!(failures[0].reason.contains("already exported"));
        assert!(registry.is_live(2));
        assert!(!registry.is_live(3));
        assert!(registry.is_live(5));
    }

    #[test]
    fn release_is_idempotent() {
        let backend = MockGpioBackend::default();
        let (mut registry, _) = HandleRegistry::acquire(&backend, &roster(), 0);

        registry.release();
        registry.release();
        drop(registry);

        for address in [2, 3, 5] {
            assert_eq!(backend.unexport_count(address), 1);
        }
    }

    #[test]
    fn release_on_empty_registry() {
        let mut registry = HandleRegistry::empty();
        registry.release();
        assert!(registry.is_empty());
    }

    #[test]
    fn watch_requires_live_handle() {
        let backend = MockGpioBackend::default();
        backend.fail_open(5, "permission denied");
        let (mut registry, _) = HandleRegistry::acquire(&backend, &roster(), 0);

        let result = registry.watch(5, std::sync::Arc::new(|_: Result<u8, AppError>| {}));
        assert!(matches!(result, Err(AppError::Acquire { pin: 5, .. })));
    }
}
