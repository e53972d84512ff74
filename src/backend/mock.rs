use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::gpio::{GpioBackend, LineRequest, PinHandle, WatchCallback};
use crate::roster::Direction;

/// In-memory GPIO lines keyed by address.
///
/// Levels are stored as the physical value; reads apply the active-low
/// setting the line was opened with, the way the kernel does.
#[derive(Default, Clone)]
pub struct MockGpioBackend {
    shared: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    lines: FxHashMap<u32, MockLine>,
    open_failures: FxHashMap<u32, String>,
    write_failures: FxHashMap<u32, String>,
    inaccessible: Option<String>,
}

#[derive(Default)]
struct MockLine {
    request: Option<LineRequest>,
    level: u8,
    open: bool,
    unexports: u32,
    reads: u32,
    handler: Option<WatchCallback>,
    /// Bumped on every edge; a pending debounce only fires if it is unchanged.
    edge_generation: u64,
}

impl MockLine {
    fn logical(&self) -> u8 {
        let active_low = self.request.map(|r| r.active_low).unwrap_or(false);
        match self.level {
            0 | 1 if active_low => self.level ^ 1,
            level => level,
        }
    }
}

impl MockGpioBackend {
    /// Makes `check_access` fail with `reason`.
    pub fn set_inaccessible(&self, reason: &str) {
        self.shared.lock().inaccessible = Some(reason.to_string());
    }

    pub fn fail_open(&self, address: u32, reason: &str) {
        self.shared
            .lock()
            .open_failures
            .insert(address, reason.to_string());
    }

    pub fn fail_write(&self, address: u32, reason: &str) {
        self.shared
            .lock()
            .write_failures
            .insert(address, reason.to_string());
    }

    /// Sets the physical level, which may be any raw value.
    pub fn set_level(&self, address: u32, level: u8) {
        self.shared.lock().lines.entry(address).or_default().level = level;
    }

    /// Physical level last written or set.
    pub fn level(&self, address: u32) -> Option<u8> {
        self.shared.lock().lines.get(&address).map(|l| l.level)
    }

    pub fn is_open(&self, address: u32) -> bool {
        self.shared
            .lock()
            .lines
            .get(&address)
            .is_some_and(|l| l.open)
    }

    pub fn is_watched(&self, address: u32) -> bool {
        self.shared
            .lock()
            .lines
            .get(&address)
            .is_some_and(|l| l.handler.is_some())
    }

    pub fn request(&self, address: u32) -> Option<LineRequest> {
        self.shared
            .lock()
            .lines
            .get(&address)
            .and_then(|l| l.request)
    }

    pub fn unexport_count(&self, address: u32) -> u32 {
        self.shared
            .lock()
            .lines
            .get(&address)
            .map(|l| l.unexports)
            .unwrap_or(0)
    }

    pub fn read_count(&self, address: u32) -> u32 {
        self.shared
            .lock()
            .lines
            .get(&address)
            .map(|l| l.reads)
            .unwrap_or(0)
    }

    /// Moves the line to `level` and feeds the edge to its watch.
    ///
    /// Without debounce the edge is delivered at once when it matches the
    /// trigger. With debounce, delivery waits until no further edge arrives
    /// for the window and then reports the settled level, if it matches the
    /// trigger. Debounced edges need a tokio runtime. Returns whether the
    /// line is open and watched.
    pub fn trigger_edge(&self, address: u32, level: u8) -> bool {
        let (handler, logical, debounce, generation) = {
            let mut state = self.shared.lock();
            let Some(line) = state.lines.get_mut(&address) else {
                return false;
            };
            line.level = level;
            line.edge_generation += 1;

            let Some(request) = line.request.filter(|_| line.open) else {
                return false;
            };
            let Some(handler) = line.handler.clone() else {
                return false;
            };
            if request.debounce_ms.is_none() && !request.trigger.matches(line.logical()) {
                return true;
            }

            (handler, line.logical(), request.debounce_ms, line.edge_generation)
        };

        match debounce {
            None => handler(Ok(logical)),
            Some(ms) => {
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
                    let settled = {
                        let state = shared.lock();
                        state
                            .lines
                            .get(&address)
                            .filter(|l| l.open && l.edge_generation == generation)
                            .and_then(|l| {
                                let request = l.request?;
                                let handler = l.handler.clone()?;
                                let logical = l.logical();
                                request.trigger.matches(logical).then_some((handler, logical))
                            })
                    };
                    if let Some((handler, logical)) = settled {
                        handler(Ok(logical));
                    }
                });
            }
        }
        true
    }

    /// Breaks the watch on `address`, delivering `reason` as an error.
    pub fn fail_watch(&self, address: u32, reason: &str) -> bool {
        let handler = self
            .shared
            .lock()
            .lines
            .get_mut(&address)
            .and_then(|l| l.handler.take());

        match handler {
            Some(h) => {
                h(Err(AppError::Gpio(reason.to_string())));
                true
            }
            None => false,
        }
    }
}

impl GpioBackend for MockGpioBackend {
    fn check_access(&self) -> Result<(), AppError> {
        match &self.shared.lock().inaccessible {
            Some(reason) => Err(AppError::Inaccessible(reason.clone())),
            None => Ok(()),
        }
    }

    fn open(&self, address: u32, request: &LineRequest) -> Result<Box<dyn PinHandle>, AppError> {
        let mut state = self.shared.lock();

        if let Some(reason) = state.open_failures.get(&address) {
            return Err(AppError::Gpio(reason.clone()));
        }

        let line = state.lines.entry(address).or_default();
        if line.open {
            return Err(AppError::Gpio(format!("line {address} is busy")));
        }
        line.open = true;
        line.request = Some(*request);
        line.handler = None;

        Ok(Box::new(MockPinHandle {
            address,
            shared: self.shared.clone(),
            released: false,
        }))
    }
}

struct MockPinHandle {
    address: u32,
    shared: Arc<Mutex<MockState>>,
    released: bool,
}

impl MockPinHandle {
    fn with_line<T>(&self, f: impl FnOnce(&mut MockLine) -> Result<T, AppError>) -> Result<T, AppError> {
        let mut state = self.shared.lock();
        match state.lines.get_mut(&self.address) {
            Some(line) if line.open && !self.released => f(line),
            _ => Err(AppError::Gpio(format!("line {} is not exported", self.address))),
        }
    }
}

impl PinHandle for MockPinHandle {
    fn read_sync(&self) -> Result<u8, AppError> {
        self.with_line(|line| {
            line.reads += 1;
            Ok(line.logical())
        })
    }

    fn write(&self, value: u8) -> Result<(), AppError> {
        if let Some(reason) = self.shared.lock().write_failures.get(&self.address) {
            return Err(AppError::Gpio(reason.clone()));
        }

        self.with_line(|line| {
            if line.request.map(|r| r.direction) != Some(Direction::Out) {
                return Err(AppError::InvalidValue(
                    "pin must be in output mode to set value".into(),
                ));
            }
            line.level = value;
            Ok(())
        })
    }

    fn watch(&mut self, callback: WatchCallback) -> Result<(), AppError> {
        self.with_line(|line| {
            line.handler = Some(callback);
            Ok(())
        })
    }

    fn unexport(&mut self) -> Result<(), AppError> {
        if self.released {
            return Ok(());
        }
        self.with_line(|line| {
            line.open = false;
            line.handler = None;
            line.unexports += 1;
            Ok(())
        })?;
        self.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{InputSettings, Trigger};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn input(trigger: Trigger, invert: bool) -> LineRequest {
        LineRequest::input(&InputSettings {
            trigger,
            debounce_ms: None,
            invert,
        })
    }

    #[test]
    fn read_applies_active_low() {
        let backend = MockGpioBackend::default();
        backend.set_level(4, 1);
        let handle = backend.open(4, &input(Trigger::None, true)).unwrap();

        assert_eq!(handle.read_sync().unwrap(), 0);
        backend.set_level(4, 7);
        assert_eq!(handle.read_sync().unwrap(), 7);
    }

    #[test]
    fn write_requires_output() {
        let backend = MockGpioBackend::default();
        let input = backend.open(4, &input(Trigger::None, false)).unwrap();
        let output = backend.open(5, &LineRequest::output()).unwrap();

        assert!(input.write(1).is_err());
        output.write(1).unwrap();
        assert_eq!(backend.level(5), Some(1));
    }

    #[test]
    fn open_is_exclusive_until_unexport() {
        let backend = MockGpioBackend::default();
        let mut handle = backend.open(6, &LineRequest::output()).unwrap();
        assert!(backend.open(6, &LineRequest::output()).is_err());

        handle.unexport().unwrap();
        handle.unexport().unwrap();
        assert_eq!(backend.unexport_count(6), 1);
        assert!(handle.read_sync().is_err());
        assert!(backend.open(6, &LineRequest::output()).is_ok());
    }

    #[test]
    fn edges_respect_trigger() {
        let backend = MockGpioBackend::default();
        let mut handle = backend.open(7, &input(Trigger::Rising, false)).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        handle
            .watch(Arc::new(move |_: Result<u8, AppError>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(backend.trigger_edge(7, 0));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(backend.trigger_edge(7, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_edges_report_settled_level_once() {
        let backend = MockGpioBackend::default();
        let request = LineRequest::input(&InputSettings {
            trigger: Trigger::Both,
            debounce_ms: Some(20),
            invert: false,
        });
        let mut handle = backend.open(9, &request).unwrap();
        let levels = Arc::new(Mutex::new(Vec::new()));
        let seen = levels.clone();
        handle
            .watch(Arc::new(move |event: Result<u8, AppError>| {
                seen.lock().push(event.unwrap());
            }))
            .unwrap();

        backend.trigger_edge(9, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.trigger_edge(9, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.trigger_edge(9, 1);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(levels.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*levels.lock(), vec![1]);
    }

    #[test]
    fn unexport_cancels_watch() {
        let backend = MockGpioBackend::default();
        let mut handle = backend.open(8, &input(Trigger::Both, false)).unwrap();
        handle.watch(Arc::new(|_: Result<u8, AppError>| {})).unwrap();
        assert!(backend.is_watched(8));

        handle.unexport().unwrap();
        assert!(!backend.is_watched(8));
        assert!(!backend.trigger_edge(8, 1));
    }
}
