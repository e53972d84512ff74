use std::{fs, path::Path, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::roster::{Direction, InputSettings, PIN_COUNT, PinConfig, PinRoster, Trigger};

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 5000;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 600_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 10;
pub const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Flat key-value pin configuration, e.g. `use_gpio_17 = true`.
pub type RawConfig = FxHashMap<String, Value>;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Libgpiod,
    Sysfs,
    Mock,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GpioConfig {
    pub backend: BackendKind,
    /// Character device used by the libgpiod backend.
    pub chip: String,
    pub sysfs_root: String,
    /// Label prefix of the pin controller whose base offset is auto-detected.
    pub chip_label_prefix: String,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            chip: "/dev/gpiochip0".to_string(),
            sysfs_root: "/sys/class/gpio".to_string(),
            chip_label_prefix: "pinctrl".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
    #[serde(default)]
    pub pins: RawConfig,
}

fn default_notify_capacity() -> usize {
    64
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))
    }
}

/// Validated controller settings derived from a [`RawConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub refresh_interval: Duration,
    /// `None` when the offset has to be detected from the host.
    pub base_offset: Option<u32>,
    pub roster: PinRoster,
}

impl ControllerSettings {
    /// Parses the flat configuration. Performs no I/O.
    pub fn parse(raw: &RawConfig) -> Result<Self, AppError> {
        let refresh_ms = match lookup(raw, &["refresh_interval_ms", "refresh_interval"]) {
            Some((key, value)) => as_uint(key, value)?,
            None => DEFAULT_REFRESH_INTERVAL_MS,
        };
        if !(1..=MAX_REFRESH_INTERVAL_MS).contains(&refresh_ms) {
            return Err(AppError::Config(format!(
                "refresh_interval_ms must be between 1 and {MAX_REFRESH_INTERVAL_MS}, got {refresh_ms}"
            )));
        }

        let base_offset = match lookup(raw, &["base_offset", "base"]) {
            Some((_, Value::Null)) | None => None,
            Some((key, value)) => {
                let base = as_uint(key, value)?;
                Some(u32::try_from(base).map_err(|_| {
                    AppError::Config(format!("{key} is out of range: {base}"))
                })?)
            }
        };

        let pins = (0..PIN_COUNT)
            .map(|pin| parse_pin(raw, pin))
            .collect::<Result<Vec<_>, _>>()?;
        let roster = PinRoster::from_pins(
            pins.into_iter()
                .enumerate()
                .map(|(i, config)| (i as u8, config)),
        );

        Ok(Self {
            refresh_interval: Duration::from_millis(refresh_ms),
            base_offset,
            roster,
        })
    }
}

fn parse_pin(raw: &RawConfig, pin: u8) -> Result<PinConfig, AppError> {
    if !bool_or(raw, &format!("use_gpio_{pin}"), false)? {
        return Ok(PinConfig::default());
    }

    let direction_key = format!("gpio_in_out_{pin}");
    let direction = match raw.get(&direction_key).map(as_text).transpose()? {
        None => Direction::Out,
        Some("out") => Direction::Out,
        Some("in") => Direction::In,
        Some(other) => {
            return Err(AppError::Config(format!(
                "{direction_key} must be \"in\" or \"out\", got \"{other}\""
            )));
        }
    };

    if direction == Direction::Out {
        return Ok(PinConfig::output());
    }

    let trigger_key = format!("gpio_trigger_type_{pin}");
    let trigger = match raw.get(&trigger_key).map(as_text).transpose()? {
        None | Some("none") => Trigger::None,
        Some("rising") => Trigger::Rising,
        Some("falling") => Trigger::Falling,
        Some("both") => Trigger::Both,
        Some(other) => {
            return Err(AppError::Config(format!(
                "{trigger_key} must be one of none, rising, falling, both, got \"{other}\""
            )));
        }
    };

    let debounce_ms = if bool_or(raw, &format!("gpio_enable_debounce_{pin}"), false)? {
        let key = format!("gpio_debounce_time_{pin}");
        let ms = match raw.get(&key) {
            Some(value) => as_uint(&key, value)?,
            None => DEFAULT_DEBOUNCE_MS,
        };
        if ms > MAX_DEBOUNCE_MS {
            return Err(AppError::Config(format!(
                "{key} must be at most {MAX_DEBOUNCE_MS}, got {ms}"
            )));
        }
        Some(ms as u32)
    } else {
        None
    };

    let invert = bool_or(raw, &format!("gpio_invert_values_{pin}"), false)?;

    Ok(PinConfig::input(InputSettings {
        trigger,
        debounce_ms,
        invert,
    }))
}

fn lookup<'a>(raw: &'a RawConfig, keys: &[&'a str]) -> Option<(&'a str, &'a Value)> {
    keys.iter()
        .find_map(|key| raw.get(*key).map(|value| (*key, value)))
}

fn bool_or(raw: &RawConfig, key: &str, default: bool) -> Result<bool, AppError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s == "true" => Ok(true),
        Some(Value::String(s)) if s == "false" => Ok(false),
        Some(other) => Err(AppError::Config(format!(
            "{key} must be a boolean, got {other}"
        ))),
    }
}

fn as_uint(key: &str, value: &Value) -> Result<u64, AppError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        AppError::Config(format!("{key} must be a non-negative integer, got {value}"))
    })
}

fn as_text(value: &Value) -> Result<&str, AppError> {
    value
        .as_str()
        .ok_or_else(|| AppError::Config(format!("expected a string, got {value}")))
}
