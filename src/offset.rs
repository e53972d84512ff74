use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::AppError;

/// Strategy for discovering the base offset of the host's pin controller.
pub trait BaseOffsetProbe: Send + Sync {
    /// Returns `Ok(None)` when no matching controller is registered.
    fn detect(&self) -> Result<Option<u32>, AppError>;
}

/// Always reports the same offset.
pub struct FixedBaseOffset(pub u32);

impl BaseOffsetProbe for FixedBaseOffset {
    fn detect(&self) -> Result<Option<u32>, AppError> {
        Ok(Some(self.0))
    }
}

/// Scans `<root>/gpiochip*` for a controller whose label starts with
/// `label_prefix` and reads its `base` file.
pub struct SysfsBaseOffset {
    root: PathBuf,
    label_prefix: String,
}

impl SysfsBaseOffset {
    pub fn new(root: impl Into<PathBuf>, label_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            label_prefix: label_prefix.into(),
        }
    }

    fn first_line(path: &Path) -> Result<String, AppError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| AppError::Gpio(format!("read {}: {e}", path.display())))?;
        Ok(contents.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl BaseOffsetProbe for SysfsBaseOffset {
    fn detect(&self) -> Result<Option<u32>, AppError> {
        if !self.root.is_dir() {
            debug!("{} does not exist, no base offset", self.root.display());
            return Ok(None);
        }

        let entries = fs::read_dir(&self.root)
            .map_err(|e| AppError::Gpio(format!("read dir {}: {e}", self.root.display())))?;

        let mut chips: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("gpiochip"))
            .map(|entry| entry.path())
            .collect();
        // last match wins, in name order
        chips.sort();

        let mut matched = None;
        for chip in chips {
            match Self::first_line(&chip.join("label")) {
                Ok(label) if label.starts_with(&self.label_prefix) => matched = Some(chip),
                Ok(_) => {}
                Err(e) => debug!("skipping {}: {e}", chip.display()),
            }
        }

        let Some(chip) = matched else {
            return Ok(None);
        };

        let base = Self::first_line(&chip.join("base"))?;
        let base = base
            .parse::<u32>()
            .map_err(|_| AppError::Gpio(format!("invalid base \"{base}\" in {}", chip.display())))?;
        debug!("{} has base offset {base}", chip.display());

        Ok(Some(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_chip(root: &Path, name: &str, label: &str, base: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("label"), format!("{label}\n")).unwrap();
        fs::write(dir.join("base"), format!("{base}\n")).unwrap();
    }

    #[test]
    fn detects_matching_controller() {
        let root = tempfile::tempdir().unwrap();
        add_chip(root.path(), "gpiochip0", "raspberrypi-exp-gpio", "504");
        add_chip(root.path(), "gpiochip512", "pinctrl-bcm2711", "512");
        fs::create_dir_all(root.path().join("gpio17")).unwrap();

        let probe = SysfsBaseOffset::new(root.path(), "pinctrl");
        assert_eq!(probe.detect().unwrap(), Some(512));
    }

    #[test]
    fn no_matching_controller() {
        let root = tempfile::tempdir().unwrap();
        add_chip(root.path(), "gpiochip0", "raspberrypi-exp-gpio", "504");

        let probe = SysfsBaseOffset::new(root.path(), "pinctrl");
        assert_eq!(probe.detect().unwrap(), None);
    }

    #[test]
    fn missing_root_yields_none() {
        let probe = SysfsBaseOffset::new("/nonexistent/sys/class/gpio", "pinctrl");
        assert_eq!(probe.detect().unwrap(), None);
    }

    #[test]
    fn garbage_base_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        add_chip(root.path(), "gpiochip0", "pinctrl-rp1", "n/a");

        let probe = SysfsBaseOffset::new(root.path(), "pinctrl");
        assert!(probe.detect().is_err());
    }

    #[test]
    fn fixed_offset() {
        assert_eq!(FixedBaseOffset(7).detect().unwrap(), Some(7));
    }
}
