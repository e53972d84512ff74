use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of configurable pins; indices run `0..PIN_COUNT`.
pub const PIN_COUNT: u8 = 28;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    #[default]
    Out,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Trigger {
    pub fn is_armed(&self) -> bool {
        *self != Trigger::None
    }

    /// Whether an edge moving the line to `level` matches this trigger.
    pub fn matches(&self, level: u8) -> bool {
        match self {
            Trigger::None => false,
            Trigger::Rising => level == 1,
            Trigger::Falling => level == 0,
            Trigger::Both => true,
        }
    }
}

/// Settings that only apply to input pins.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputSettings {
    pub trigger: Trigger,
    /// Debounce window in milliseconds, present only when debouncing is enabled.
    pub debounce_ms: Option<u32>,
    pub invert: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinConfig {
    pub enabled: bool,
    pub direction: Direction,
    pub input: InputSettings,
}

impl PinConfig {
    pub fn output() -> Self {
        Self {
            enabled: true,
            direction: Direction::Out,
            input: InputSettings::default(),
        }
    }

    pub fn input(settings: InputSettings) -> Self {
        Self {
            enabled: true,
            direction: Direction::In,
            input: settings,
        }
    }
}

/// Entry of a user-facing pin picker.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PinChoice {
    pub id: u8,
    pub label: String,
}

impl PinChoice {
    fn for_pin(pin: u8) -> Self {
        Self {
            id: pin,
            label: pin.to_string(),
        }
    }
}

/// The enabled pins of one configuration, partitioned by direction.
///
/// A roster is built once from a full set of pin configs and never edited
/// afterwards; a configuration change produces a new roster.
#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
pub struct PinRoster {
    outputs: Vec<u8>,
    inputs: BTreeMap<u8, InputSettings>,
}

impl PinRoster {
    /// Builds the roster from `(pin, config)` pairs. Disabled pins and pins
    /// outside `0..PIN_COUNT` are skipped; a pin listed twice keeps its last
    /// config.
    pub fn from_pins<I>(pins: I) -> Self
    where
        I: IntoIterator<Item = (u8, PinConfig)>,
    {
        let mut by_pin: BTreeMap<u8, PinConfig> = BTreeMap::new();
        for (pin, cfg) in pins {
            if pin < PIN_COUNT {
                by_pin.insert(pin, cfg);
            }
        }

        let mut roster = PinRoster::default();
        for (pin, cfg) in by_pin.into_iter().filter(|(_, cfg)| cfg.enabled) {
            match cfg.direction {
                Direction::Out => roster.outputs.push(pin),
                Direction::In => {
                    roster.inputs.insert(pin, cfg.input);
                }
            }
        }
        roster
    }

    pub fn outputs(&self) -> &[u8] {
        &self.outputs
    }

    pub fn inputs(&self) -> &BTreeMap<u8, InputSettings> {
        &self.inputs
    }

    pub fn input(&self, pin: u8) -> Option<&InputSettings> {
        self.inputs.get(&pin)
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.outputs.contains(&pin)
    }

    pub fn contains(&self, pin: u8) -> bool {
        self.is_output(pin) || self.inputs.contains_key(&pin)
    }

    /// Every active pin in ascending order.
    pub fn all_active(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self
            .outputs
            .iter()
            .copied()
            .chain(self.inputs.keys().copied())
            .collect();
        pins.sort_unstable();
        pins
    }

    /// Input pins with an edge trigger configured.
    pub fn triggered_inputs(&self) -> Vec<u8> {
        self.inputs
            .iter()
            .filter(|(_, s)| s.trigger.is_armed())
            .map(|(pin, _)| *pin)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.inputs.is_empty()
    }

    pub fn output_choices(&self) -> Vec<PinChoice> {
        self.outputs.iter().copied().map(PinChoice::for_pin).collect()
    }

    pub fn active_choices(&self) -> Vec<PinChoice> {
        self.all_active().into_iter().map(PinChoice::for_pin).collect()
    }
}
