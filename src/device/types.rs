//! Data model for one device: identity, capabilities, live status, and the
//! session's authoritative state snapshot (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Discriminator for the class of instrument behind a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    PowerSupply,
    ElectronicLoad,
    Oscilloscope,
}

/// Identity assigned once by driver probe. Immutable after probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub manufacturer: String,
    pub model: String,
    pub serial: Option<String>,
}

/// One named output channel a device exposes (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputChannel {
    pub name: String,
    pub unit: String,
    pub decimals: u8,
    pub min: f64,
    pub max: f64,
    pub modes: Vec<String>,
}

/// One named measurement a device exposes (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementChannel {
    pub name: String,
    pub unit: String,
    pub decimals: u8,
}

/// Optional list/arbitrary-waveform upload support a device may expose at
/// the driver level (spec §6 "optional list-mode triad").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListModeDescriptor {
    pub max_steps: u32,
    pub supported_modes: Vec<String>,
}

/// Immutable, probe-time capability description of a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceCapabilities {
    pub modes: Vec<String>,
    pub mode_settable: bool,
    pub outputs: Vec<OutputChannel>,
    pub measurements: Vec<MeasurementChannel>,
    pub list_mode: Option<ListModeDescriptor>,
}

impl DeviceCapabilities {
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }

    pub fn has_measurement(&self, name: &str) -> bool {
        self.measurements.iter().any(|m| m.name == name)
    }

    pub fn output_unit(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.unit.as_str())
    }
}

/// Snapshot produced by each poll (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub mode: String,
    pub output_enabled: bool,
    pub setpoints: HashMap<String, f64>,
    pub measurements: HashMap<String, f64>,
    pub list_running: Option<bool>,
}

/// Connection state machine (spec §4.1 "State machine").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connected,
    Error,
    Disconnected,
}

/// Bounded time-series of recent samples, parallel arrays by construction
/// (spec §3 invariant: all arrays the same length, timestamps
/// non-decreasing, oldest timestamp within `historyWindowMs` of now).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct History {
    pub timestamps: Vec<DateTime<Utc>>,
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    pub power: Vec<f64>,
    /// Lazily initialized on first sample that carries a resistance reading
    /// (spec §4.1 "Tie-breaks": once present it must be present in all
    /// subsequent samples).
    pub resistance: Option<Vec<f64>>,
}

impl History {
    /// Appends one sample, lazily backfilling `resistance` with `NaN` for
    /// every prior sample the first time it is observed, then trims
    /// anything older than `now - history_window_ms`.
    pub fn push(
        &mut self,
        timestamp: DateTime<Utc>,
        voltage: f64,
        current: f64,
        power: f64,
        resistance: Option<f64>,
        history_window_ms: i64,
    ) {
        if let Some(r) = resistance {
            if self.resistance.is_none() {
                self.resistance = Some(vec![f64::NAN; self.timestamps.len()]);
            }
            if let Some(res) = self.resistance.as_mut() {
                res.push(r);
            }
        } else if let Some(res) = self.resistance.as_mut() {
            res.push(f64::NAN);
        }

        self.timestamps.push(timestamp);
        self.voltage.push(voltage);
        self.current.push(current);
        self.power.push(power);

        self.trim_before(timestamp - chrono::Duration::milliseconds(history_window_ms));
    }

    fn trim_before(&mut self, cutoff: DateTime<Utc>) {
        let drop_count = self.timestamps.iter().take_while(|t| **t < cutoff).count();
        if drop_count == 0 {
            return;
        }
        self.timestamps.drain(0..drop_count);
        self.voltage.drain(0..drop_count);
        self.current.drain(0..drop_count);
        self.power.drain(0..drop_count);
        if let Some(res) = self.resistance.as_mut() {
            res.drain(0..drop_count);
        }
    }

    /// Spec §8 invariant check, exposed for tests and debug assertions.
    pub fn lengths_match(&self) -> bool {
        let n = self.timestamps.len();
        self.voltage.len() == n
            && self.current.len() == n
            && self.power.len() == n
            && self.resistance.as_ref().map_or(true, |r| r.len() == n)
    }

    pub fn is_nondecreasing(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] <= w[1])
    }
}

/// The session's full, authoritative, read-only-for-callers model
/// (spec §3 `DeviceSessionState`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSessionState {
    pub info: DeviceInfo,
    pub capabilities: DeviceCapabilities,
    pub connection_status: ConnectionStatus,
    pub consecutive_errors: u32,
    pub status: Option<DeviceStatus>,
    pub history: History,
    pub last_updated: Option<DateTime<Utc>>,
}

impl DeviceSessionState {
    pub fn new(info: DeviceInfo, capabilities: DeviceCapabilities) -> Self {
        Self {
            info,
            capabilities,
            connection_status: ConnectionStatus::Connected,
            consecutive_errors: 0,
            status: None,
            history: History::default(),
            last_updated: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn history_trims_to_window() {
        let mut h = History::default();
        for i in 0..5 {
            h.push(ts(i * 1000), 1.0, 1.0, 1.0, None, 2500);
        }
        assert!(h.lengths_match());
        assert!(h.is_nondecreasing());
        // window is 2500ms, latest ts=4000, so anything < 1500 is trimmed -> keeps 2000,3000,4000
        assert_eq!(h.timestamps, vec![ts(2000), ts(3000), ts(4000)]);
    }

    #[test]
    fn resistance_backfills_on_first_observation() {
        let mut h = History::default();
        h.push(ts(0), 1.0, 1.0, 1.0, None, 60_000);
        h.push(ts(1000), 1.0, 1.0, 1.0, None, 60_000);
        h.push(ts(2000), 1.0, 1.0, 1.0, Some(5.0), 60_000);
        let res = h.resistance.expect("resistance series created");
        assert_eq!(res.len(), 3);
        assert!(res[0].is_nan());
        assert!(res[1].is_nan());
        assert_eq!(res[2], 5.0);
    }
}
