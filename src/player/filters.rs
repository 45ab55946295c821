//! Accumulating audio filter state.
//!
//! Filter blocks are opaque JSON as far as the core is concerned — the
//! worker interprets them, we just hold and merge them. `apply` replaces a
//! named block wholesale (never merges sub-fields within it); that keeps the
//! merge logic here trivial and pushes any field-level semantics to the
//! worker, where they belong.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// A named, accumulating set of filter blocks.
#[derive(Clone, Debug, Default)]
pub struct FilterController {
    blocks: HashMap<String, Value>,
}

impl FilterController {
    pub fn new() -> FilterController {
        FilterController::default()
    }

    /// Replaces the named block wholesale and returns the full filter
    /// payload to send via `updatePlayer`.
    pub fn apply(&mut self, name: impl Into<String>, block: Value) -> Value {
        self.blocks.insert(name.into(), block);
        self.payload()
    }

    /// Removes a named block and returns the resulting payload.
    pub fn remove(&mut self, name: &str) -> Value {
        self.blocks.remove(name);
        self.payload()
    }

    /// Clears every block.
    pub fn clear(&mut self) -> Value {
        self.blocks.clear();
        self.payload()
    }

    /// The current accumulated filter payload, suitable for
    /// `UpdatePlayerPatch::filters`.
    pub fn payload(&self) -> Value {
        let mut map = Map::new();
        for (name, block) in &self.blocks {
            map.insert(name.clone(), block.clone());
        }
        Value::Object(map)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Looks up a built-in filter preset by name. Names are normalized
/// (lowercased, dashes and spaces stripped) before lookup, so `"bass-boost
/// high"`, `"BassBoostHigh"`, and `"bass_boost_high"` all resolve to the same
/// preset. Underscores are left alone, only dashes and spaces are stripped.
pub fn preset(name: &str) -> Option<Value> {
    let key = normalize(name);
    PRESETS.iter().find(|(k, _)| *k == key).map(|(_, v)| v())
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != ' ')
        .collect()
}

type PresetFn = fn() -> Value;

static PRESETS: &[(&str, PresetFn)] = &[
    ("bassboostlow", || equalizer(&[(0, 0.1), (1, 0.1), (2, 0.05)])),
    (
        "bassboostmed",
        || equalizer(&[(0, 0.2), (1, 0.15), (2, 0.1)]),
    ),
    (
        "bassboosthigh",
        || equalizer(&[(0, 0.3), (1, 0.25), (2, 0.15)]),
    ),
    ("nightcore", || {
        serde_json::json!({"timescale": {"speed": 1.2, "pitch": 1.2, "rate": 1.0}})
    }),
    ("vaporwave", || {
        serde_json::json!({"timescale": {"speed": 0.8, "pitch": 0.8, "rate": 1.0}})
    }),
    ("8d", || {
        serde_json::json!({"rotation": {"rotationHz": 0.2}})
    }),
    ("karaoke", || {
        serde_json::json!({"karaoke": {"level": 1.0, "monoLevel": 1.0, "filterBand": 220.0, "filterWidth": 100.0}})
    }),
    ("tremolo", || {
        serde_json::json!({"tremolo": {"frequency": 2.0, "depth": 0.5}})
    }),
    ("vibrato", || {
        serde_json::json!({"vibrato": {"frequency": 2.0, "depth": 0.5}})
    }),
    ("soft", || equalizer(&[(12, -0.25), (13, -0.25), (14, -0.25)])),
    ("pop", || equalizer(&[(5, 0.1), (6, 0.15), (7, 0.1)])),
    ("rock", || equalizer(&[(0, 0.15), (1, 0.1), (7, 0.1), (8, 0.1)])),
    (
        "electronic",
        || equalizer(&[(0, 0.2), (1, 0.15), (10, 0.1), (11, 0.1)]),
    ),
    (
        "classical",
        || equalizer(&[(6, 0.1), (7, 0.1), (8, 0.05)]),
    ),
];

fn equalizer(bands: &[(u8, f64)]) -> Value {
    let bands: Vec<Value> = bands
        .iter()
        .map(|(band, gain)| serde_json::json!({"band": band, "gain": gain}))
        .collect();
    serde_json::json!({"equalizer": bands})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_lookup_is_normalized() {
        assert!(preset("bass-boost high").is_some());
        assert!(preset("BassBoostHigh").is_some());
        assert!(preset("unknown preset name").is_none());
    }

    #[test]
    fn apply_replaces_block_wholesale() {
        let mut filters = FilterController::new();
        filters.apply("timescale", serde_json::json!({"speed": 1.0}));
        filters.apply("timescale", serde_json::json!({"pitch": 2.0}));

        let payload = filters.payload();
        let block = &payload["timescale"];
        assert!(block.get("speed").is_none());
        assert_eq!(block["pitch"], 2.0);
    }

    #[test]
    fn remove_drops_only_named_block() {
        let mut filters = FilterController::new();
        filters.apply("a", serde_json::json!({}));
        filters.apply("b", serde_json::json!({}));
        filters.remove("a");
        assert!(filters.payload().get("a").is_none());
        assert!(filters.payload().get("b").is_some());
    }
}
