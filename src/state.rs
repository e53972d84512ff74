use std::collections::BTreeMap;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub const FEEDBACK_HIGH_COLOR: u32 = 0x00FF00;
pub const FEEDBACK_LOW_COLOR: u32 = 0xFF0000;

/// Commanded output level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    High,
    Low,
}

impl Level {
    pub fn raw(&self) -> u8 {
        match self {
            Level::High => 1,
            Level::Low => 0,
        }
    }
}

/// Last observed logical level of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinState {
    High,
    Low,
    #[default]
    Unknown,
}

impl PinState {
    /// Maps a raw driver level; anything but 0 or 1 is unknown.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PinState::Low,
            1 => PinState::High,
            _ => PinState::Unknown,
        }
    }

    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            PinState::High => Some("HIGH"),
            PinState::Low => Some("LOW"),
            PinState::Unknown => None,
        }
    }

    /// Background colour for a HIGH/LOW indicator; unknown pins get none.
    pub fn feedback(&self, bg_high: u32, bg_low: u32) -> Option<u32> {
        match self {
            PinState::High => Some(bg_high),
            PinState::Low => Some(bg_low),
            PinState::Unknown => None,
        }
    }
}

impl From<Level> for PinState {
    fn from(level: Level) -> Self {
        match level {
            Level::High => PinState::High,
            Level::Low => PinState::Low,
        }
    }
}

impl Serialize for PinState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_str() {
            Some(s) => serializer.serialize_str(s),
            None => serializer.serialize_none(),
        }
    }
}

/// Per-pin state shared between the refresh engine and observers.
///
/// Each pin entry is updated atomically; a reader running during a sweep may
/// see some pins from before and some from after it.
#[derive(Default)]
pub struct StateStore {
    states: RwLock<FxHashMap<u8, PinState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all entries with `unknown` for each of `pins`.
    pub fn reset(&self, pins: &[u8]) {
        let mut states = self.states.write();
        states.clear();
        states.extend(pins.iter().map(|pin| (*pin, PinState::Unknown)));
    }

    /// Returns `unknown` for pins the store does not track.
    pub fn get(&self, pin: u8) -> PinState {
        self.states.read().get(&pin).copied().unwrap_or_default()
    }

    pub fn contains(&self, pin: u8) -> bool {
        self.states.read().contains_key(&pin)
    }

    /// Updates a tracked pin. Untracked pins are ignored.
    pub fn set(&self, pin: u8, state: PinState) {
        if let Some(entry) = self.states.write().get_mut(&pin) {
            *entry = state;
        }
    }

    pub fn all_states(&self) -> BTreeMap<u8, PinState> {
        self.states
            .read()
            .iter()
            .map(|(pin, state)| (*pin, *state))
            .collect()
    }

    /// Variable view: `base` plus `gpio_state_<n>` for every tracked pin.
    pub fn variables(&self, base_offset: u32) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("base".to_string(), base_offset.to_string());
        for (pin, state) in self.all_states() {
            vars.insert(
                format!("gpio_state_{pin}"),
                state.as_str().unwrap_or_default().to_string(),
            );
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_levels_map_to_states() {
        assert_eq!(PinState::from_raw(0), PinState::Low);
        assert_eq!(PinState::from_raw(1), PinState::High);
        assert_eq!(PinState::from_raw(2), PinState::Unknown);
        assert_eq!(PinState::from_raw(255), PinState::Unknown);
    }

    #[test]
    fn reset_tracks_only_given_pins() {
        let store = StateStore::new();
        store.reset(&[2, 3]);
        store.set(2, PinState::High);
        store.set(9, PinState::High);

        assert_eq!(store.get(2), PinState::High);
        assert_eq!(store.get(3), PinState::Unknown);
        assert!(!store.contains(9));

        store.reset(&[5]);
        assert_eq!(store.all_states().into_iter().collect::<Vec<_>>(), vec![(5, PinState::Unknown)]);
    }

    #[test]
    fn serializes_as_level_or_null() {
        let store = StateStore::new();
        store.reset(&[1, 2]);
        store.set(1, PinState::Low);

        let json = serde_json::to_value(store.all_states()).unwrap();
        assert_eq!(json, serde_json::json!({ "1": "LOW", "2": null }));
    }

    #[test]
    fn variables_render_empty_for_unknown() {
        let store = StateStore::new();
        store.reset(&[4, 17]);
        store.set(17, PinState::High);

        let vars = store.variables(512);
        assert_eq!(vars["base"], "512");
        assert_eq!(vars["gpio_state_17"], "HIGH");
        assert_eq!(vars["gpio_state_4"], "");
    }

    #[test]
    fn feedback_colors() {
        assert_eq!(
            PinState::High.feedback(FEEDBACK_HIGH_COLOR, FEEDBACK_LOW_COLOR),
            Some(FEEDBACK_HIGH_COLOR)
        );
        assert_eq!(PinState::Low.feedback(1, 2), Some(2));
        assert_eq!(PinState::Unknown.feedback(1, 2), None);
    }

    #[test]
    fn level_parses_uppercase() {
        let level: Level = serde_json::from_str("\"HIGH\"").unwrap();
        assert_eq!(level, Level::High);
        assert_eq!(Level::Low.raw(), 0);
    }
}
