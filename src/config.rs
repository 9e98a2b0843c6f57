//! Runtime configuration for the core library (spec §6 "Configuration" table).
//!
//! Loaded via `figment` layering: compiled-in defaults, an optional TOML
//! file, then environment variables prefixed `RUST_BENCH_` — the same V5
//! figment-based layering style used elsewhere in this crate family.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// All tunables named in spec §6, with the defaults from that table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// `DeviceSession` poll cadence, milliseconds.
    pub poll_interval_ms: u64,
    /// History trim horizon, milliseconds.
    pub history_window_ms: i64,
    /// Consecutive poll failures before a non-fatal error escalates to
    /// `disconnected`.
    pub max_consecutive_errors: u32,
    /// `setValue` debounce window, milliseconds.
    pub debounce_ms: u64,
    /// `SessionManager::sync_devices` cadence, milliseconds (`0` disables).
    pub scan_interval_ms: u64,
    /// Lower bound on inter-step spacing for sequence playback, independent
    /// of a step's own `dwellMs`.
    pub sequence_min_interval_ms: u64,
    /// `TriggerEngine` evaluator cadence, milliseconds.
    pub trigger_eval_interval_ms: u64,
    /// `TriggerEngine` progress-broadcast cadence, milliseconds.
    pub trigger_progress_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            history_window_ms: 30 * 60 * 1000,
            max_consecutive_errors: 10,
            debounce_ms: 250,
            scan_interval_ms: 10_000,
            sequence_min_interval_ms: 50,
            trigger_eval_interval_ms: 100,
            trigger_progress_interval_ms: 500,
        }
    }
}

impl CoreConfig {
    /// Load defaults, then overlay an optional TOML file, then environment
    /// variables (`RUST_BENCH_POLL_INTERVAL_MS`, etc).
    pub fn load(toml_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(CoreConfig::default()));
        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("RUST_BENCH_"));
        figment.extract()
    }
}
