use log::{debug, error, warn};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::gpio::{GpioBackend, LineRequest, PinHandle, WatchCallback};
use crate::roster::{Direction, Trigger};

const SYSFS_BACKEND_POLL_TIMEOUT_MS: i32 = 10;
const SYSFS_BACKEND_EXPORT_RETRY: Duration = Duration::from_millis(10);
const SYSFS_BACKEND_EXPORT_ATTEMPTS: u32 = 100;

/// Legacy `/sys/class/gpio` backend; addresses are global GPIO numbers.
pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn gpio_dir(&self, address: u32) -> PathBuf {
        self.root.join(format!("gpio{address}"))
    }

    fn export(&self, address: u32) -> Result<PathBuf, AppError> {
        let dir = self.gpio_dir(address);
        if dir.exists() {
            debug!("gpio{address} already exported, reusing it");
        } else {
            write_attr(&self.root.join("export"), &address.to_string())?;
        }

        let value = dir.join("value");
        for _ in 0..SYSFS_BACKEND_EXPORT_ATTEMPTS {
            if value.exists() {
                return Ok(dir);
            }
            thread::sleep(SYSFS_BACKEND_EXPORT_RETRY);
        }
        Err(AppError::Gpio(format!("gpio{address} did not appear after export")))
    }
}

/// Writes an attribute, retrying while udev has not yet granted access to a
/// freshly exported line.
fn write_attr(path: &Path, value: &str) -> Result<(), AppError> {
    let mut attempts = 0;
    loop {
        match fs::write(path, value) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && attempts < SYSFS_BACKEND_EXPORT_ATTEMPTS => {
                attempts += 1;
                thread::sleep(SYSFS_BACKEND_EXPORT_RETRY);
            }
            Err(e) => {
                return Err(AppError::Gpio(format!("write {} to {}: {e}", value, path.display())));
            }
        }
    }
}

fn parse_level(text: &str) -> Result<u8, AppError> {
    text.trim()
        .parse::<u8>()
        .map_err(|_| AppError::Gpio(format!("unexpected value \"{}\"", text.trim())))
}

fn read_value(file: &mut File) -> io::Result<String> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn deliver(address: u32, text: &str, callback: &WatchCallback) {
    match parse_level(text) {
        Ok(level) => callback(Ok(level)),
        Err(e) => warn!("gpio{address}: {e}"),
    }
}

fn edge_name(trigger: Trigger) -> &'static str {
    match trigger {
        Trigger::None => "none",
        Trigger::Rising => "rising",
        Trigger::Falling => "falling",
        Trigger::Both => "both",
    }
}

impl GpioBackend for SysfsBackend {
    fn check_access(&self) -> Result<(), AppError> {
        for name in ["export", "unexport"] {
            let path = self.root.join(name);
            let metadata = fs::metadata(&path)
                .map_err(|e| AppError::Inaccessible(format!("{}: {e}", path.display())))?;
            if metadata.permissions().readonly() {
                return Err(AppError::Inaccessible(format!(
                    "no write access to {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn open(&self, address: u32, request: &LineRequest) -> Result<Box<dyn PinHandle>, AppError> {
        let dir = self.export(address)?;

        let handle = SysfsPinHandle {
            address,
            root: self.root.clone(),
            dir,
            request: *request,
            listener: None,
            released: false,
        };

        let direction = match request.direction {
            Direction::Out => "out",
            Direction::In => "in",
        };
        write_attr(&handle.dir.join("direction"), direction)?;
        write_attr(
            &handle.dir.join("active_low"),
            if request.active_low { "1" } else { "0" },
        )?;
        if request.direction == Direction::In {
            write_attr(&handle.dir.join("edge"), edge_name(request.trigger))?;
        }

        Ok(Box::new(handle))
    }
}

/// Holds edges back until the line has been quiet for a full window, then
/// lets exactly one through.
struct Debouncer {
    window: Option<Duration>,
    settle_at: Option<Instant>,
}

impl Debouncer {
    fn new(window: Option<Duration>) -> Self {
        Self {
            window,
            settle_at: None,
        }
    }

    /// Returns true when the edge is to be delivered right away.
    fn edge(&mut self, now: Instant) -> bool {
        match self.window {
            Some(window) => {
                self.settle_at = Some(now + window);
                false
            }
            None => true,
        }
    }

    /// Returns true once per burst, when the line has settled.
    fn settled(&mut self, now: Instant) -> bool {
        match self.settle_at {
            Some(deadline) if now >= deadline => {
                self.settle_at = None;
                true
            }
            _ => false,
        }
    }
}

struct SysfsListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SysfsListener {
    fn new(
        address: u32,
        value_path: PathBuf,
        debounce: Option<Duration>,
        callback: WatchCallback,
    ) -> Result<Self, AppError> {
        let mut file = File::open(&value_path)
            .map_err(|e| AppError::Gpio(format!("open {}: {e}", value_path.display())))?;
        // the first read clears the pending interrupt state
        let mut scratch = String::new();
        file.read_to_string(&mut scratch)
            .map_err(|e| AppError::Gpio(format!("read {}: {e}", value_path.display())))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let handle = thread::spawn(move || {
            let mut debouncer = Debouncer::new(debounce);

            while !cancel_flag.load(Ordering::Relaxed) {
                let mut fds = [libc::pollfd {
                    fd: file.as_raw_fd(),
                    events: libc::POLLPRI | libc::POLLERR,
                    revents: 0,
                }];
                // fds lives for the whole call and holds one entry
                let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, SYSFS_BACKEND_POLL_TIMEOUT_MS) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("poll error for gpio{address}: {err}");
                    callback(Err(AppError::Gpio(format!("poll gpio{address}: {err}"))));
                    break;
                }

                if rc > 0 {
                    // reading clears the pending edge even while bouncing
                    let text = match read_value(&mut file) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("read error for gpio{address}: {e}");
                            callback(Err(AppError::Gpio(format!("read gpio{address}: {e}"))));
                            break;
                        }
                    };
                    if debouncer.edge(Instant::now()) {
                        deliver(address, &text, &callback);
                    }
                    continue;
                }

                if debouncer.settled(Instant::now()) {
                    match read_value(&mut file) {
                        Ok(text) => deliver(address, &text, &callback),
                        Err(e) => {
                            error!("read error for gpio{address}: {e}");
                            callback(Err(AppError::Gpio(format!("read gpio{address}: {e}"))));
                            break;
                        }
                    }
                }
            }
            debug!("edge listener for gpio{address} stopped");
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for SysfsListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct SysfsPinHandle {
    address: u32,
    root: PathBuf,
    dir: PathBuf,
    request: LineRequest,
    listener: Option<SysfsListener>,
    released: bool,
}

impl SysfsPinHandle {
    fn ensure_live(&self) -> Result<(), AppError> {
        if self.released {
            return Err(AppError::Gpio(format!("gpio{} is not exported", self.address)));
        }
        Ok(())
    }
}

impl PinHandle for SysfsPinHandle {
    fn read_sync(&self) -> Result<u8, AppError> {
        self.ensure_live()?;
        let path = self.dir.join("value");
        let text = fs::read_to_string(&path)
            .map_err(|e| AppError::Gpio(format!("read {}: {e}", path.display())))?;
        parse_level(&text)
    }

    fn write(&self, value: u8) -> Result<(), AppError> {
        self.ensure_live()?;
        fs::write(self.dir.join("value"), if value == 0 { "0" } else { "1" })
            .map_err(|e| AppError::Gpio(format!("write gpio{}: {e}", self.address)))
    }

    fn watch(&mut self, callback: WatchCallback) -> Result<(), AppError> {
        self.ensure_live()?;
        self.listener = None;
        self.listener = Some(SysfsListener::new(
            self.address,
            self.dir.join("value"),
            self.request.debounce_ms.map(|ms| Duration::from_millis(u64::from(ms))),
            callback,
        )?);
        Ok(())
    }

    fn unexport(&mut self) -> Result<(), AppError> {
        if self.released {
            return Ok(());
        }
        self.listener = None;
        self.released = true;
        if self.dir.exists() {
            write_attr(&self.root.join("unexport"), &self.address.to_string())?;
        }
        Ok(())
    }
}

impl Drop for SysfsPinHandle {
    fn drop(&mut self) {
        let _ = self.unexport();
    }
}
