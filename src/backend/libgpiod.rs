use log::{debug, error};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::FairMutex;

use crate::error::AppError;
use crate::gpio::{GpioBackend, LineRequest, PinHandle, WatchCallback};
use crate::roster::{Direction, Trigger};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Character-device backend; addresses are line offsets on one chip.
pub struct LibgpiodBackend {
    chip: PathBuf,
}

struct GpiodHandle {
    request: Option<request::Request>, // none once released
}

impl GpiodHandle {
    fn new(chip: &Path, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self {
            request: Some(request),
        })
    }

    fn open_chip(path: &Path) -> Result<Chip, AppError> {
        Chip::open(&path).map_err(|e| AppError::Gpio(format!("open chip {}: {e}", path.display())))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }

    fn request(&self) -> Result<&request::Request, AppError> {
        self.request
            .as_ref()
            .ok_or_else(|| AppError::Gpio("line already released".into()))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        line: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        callback: WatchCallback,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                match Self::drain(line, &gpiod_handle, &mut buffer) {
                    Ok(Some(levels)) if levels.is_empty() => {
                        std::thread::sleep(LIBGPIOD_BACKEND_EVENT_POLL_INTERVAL);
                    }
                    Ok(Some(levels)) => {
                        for level in levels {
                            callback(Ok(level));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("edge events error for line {line}: {e}");
                        callback(Err(e));
                        break;
                    }
                }
            }
            debug!("edge listener for line {line} stopped");
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl EdgeListener {
    /// Collects pending edges without blocking, so the handle lock is only
    /// held for the duration of the syscalls. `None` once the line is released.
    fn drain(
        line: u32,
        gpiod_handle: &FairMutex<GpiodHandle>,
        buffer: &mut request::Buffer,
    ) -> Result<Option<Vec<u8>>, AppError> {
        let hdl = gpiod_handle.lock();
        let Some(req) = hdl.request.as_ref() else {
            return Ok(None);
        };

        let has_event = req
            .wait_edge_events(Some(Duration::ZERO))
            .map_err(|e| AppError::Gpio(format!("wait edge events on line {line}: {e}")))?;
        if !has_event {
            return Ok(Some(Vec::new()));
        }

        let events = req
            .read_edge_events(buffer)
            .map_err(|e| AppError::Gpio(format!("read edge events on line {line}: {e}")))?;
        let levels = events
            .filter_map(|evt| evt.ok())
            .filter_map(|evt| match evt.event_type() {
                Ok(line::EdgeKind::Rising) => Some(1),
                Ok(line::EdgeKind::Falling) => Some(0),
                Err(_) => None,
            })
            .collect();
        Ok(Some(levels))
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new(chip: impl Into<PathBuf>) -> Result<Self, AppError> {
        Ok(Self { chip: chip.into() })
    }

    fn make_line_settings(request: &LineRequest) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match request.direction {
            Direction::Out => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
            }
            Direction::In => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_active_low(request.active_low);

                let edge = match request.trigger {
                    Trigger::None => None,
                    Trigger::Rising => Some(line::Edge::Rising),
                    Trigger::Falling => Some(line::Edge::Falling),
                    Trigger::Both => Some(line::Edge::Both),
                };
                if edge.is_some() {
                    ls.set_edge_detection(edge)
                        .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
                    ls.set_event_clock(EventClock::Realtime)
                        .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
                }
                if let Some(ms) = request.debounce_ms {
                    ls.set_debounce_period(Duration::from_millis(u64::from(ms)));
                }
            }
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn check_access(&self) -> Result<(), AppError> {
        GpiodHandle::open_chip(&self.chip)
            .map(|_| ())
            .map_err(|e| AppError::Inaccessible(e.to_string()))
    }

    fn open(&self, address: u32, request: &LineRequest) -> Result<Box<dyn PinHandle>, AppError> {
        let line_settings = Self::make_line_settings(request)?;
        let line_cfg = Self::make_line_config(address, line_settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&self.chip, &line_cfg)?));

        Ok(Box::new(LibgpiodPinHandle {
            line: address,
            gpiod_handle,
            listener: None,
        }))
    }
}

struct LibgpiodPinHandle {
    line: u32,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>,
}

impl PinHandle for LibgpiodPinHandle {
    fn read_sync(&self) -> Result<u8, AppError> {
        let value = self
            .gpiod_handle
            .lock()
            .request()?
            .value(self.line)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn write(&self, value: u8) -> Result<(), AppError> {
        let mut hdl = self.gpiod_handle.lock();
        let req = hdl
            .request
            .as_mut()
            .ok_or_else(|| AppError::Gpio("line already released".into()))?;

        req.set_value(
            self.line,
            match value {
                0 => line::Value::InActive,
                _ => line::Value::Active,
            },
        )
        .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn watch(&mut self, callback: WatchCallback) -> Result<(), AppError> {
        // replacing a listener joins the previous thread first
        self.listener = None;
        self.listener = Some(EdgeListener::new(
            self.line,
            self.gpiod_handle.clone(),
            callback,
        )?);
        Ok(())
    }

    fn unexport(&mut self) -> Result<(), AppError> {
        if let Some(listener) = self.listener.take() {
            drop(listener);
        }
        self.gpiod_handle.lock().request.take();
        Ok(())
    }
}

impl Drop for LibgpiodPinHandle {
    fn drop(&mut self) {
        let _ = self.unexport();
    }
}
