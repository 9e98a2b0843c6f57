//! The `DeviceDriver` and `Transport` contracts (spec §6) — external
//! collaborators, specified here only as trait interfaces the core
//! consumes, plus a `MockDriver`/`MockTransport` pair that satisfies them
//! well enough to exercise and test `DeviceSession` end to end.

use super::types::{DeviceCapabilities, DeviceInfo, DeviceStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Why a driver's probe attempt failed (spec §6).
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("unexpected device identity")]
    WrongDevice,
    #[error("failed to parse probe response")]
    ParseError,
    #[error("failed to open connection")]
    ConnectionFailed,
}

/// Per-model adapter translating semantic operations to wire strings
/// (spec §6 "Driver contract"). Every fallible operation returns an
/// explicit `Result`, never a panic or a bare `bool` (spec §9 "Open
/// questions (b)": this crate standardizes on the Result form).
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn probe(&mut self) -> Result<DeviceInfo, ProbeError>;
    async fn capabilities(&self) -> DeviceCapabilities;
    async fn connect(&mut self) -> anyhow::Result<()>;
    async fn disconnect(&mut self) -> anyhow::Result<()>;
    async fn get_status(&mut self) -> anyhow::Result<DeviceStatus>;
    async fn set_mode(&mut self, mode: &str) -> anyhow::Result<()>;
    async fn set_output(&mut self, enabled: bool) -> anyhow::Result<()>;
    async fn set_value(&mut self, name: &str, value: f64) -> anyhow::Result<()>;

    /// Optional readback used by the debounced `setValue` failure path
    /// (spec §4.1) to recover the true setpoint after a failed write.
    /// Drivers that cannot read a setpoint back simply return `Ok(None)`.
    async fn get_value(&mut self, _name: &str) -> anyhow::Result<Option<f64>> {
        Ok(None)
    }
}

/// Framed byte-level channel to one physical instrument (spec §6
/// "Transport contract"). The core never calls this directly; only
/// concrete `DeviceDriver` implementations do.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&mut self) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
    async fn write(&mut self, cmd: &str) -> anyhow::Result<()>;
    async fn query(&mut self, cmd: &str) -> anyhow::Result<String>;
    /// IEEE-488.2 `#NXXXX…` definite-length binary blocks.
    async fn query_binary(&mut self, _cmd: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("binary queries not supported by this transport")
    }
    fn is_open(&self) -> bool;
}

/// Response-string decoding helpers shared by SCPI-speaking drivers
/// (spec §7: "overflow sentinel `9.9E37`, invalid `****`").
pub mod scpi {
    /// SCPI's conventional overflow sentinel for an out-of-range reading.
    pub const OVERFLOW_SENTINEL: f64 = 9.9e37;

    /// Parses a single numeric SCPI response, reducing the overflow
    /// sentinel and the `****` invalid-marker convention to `None` so
    /// callers can decide whether that's an error or a default.
    pub fn parse_reading(raw: &str) -> Option<f64> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '*') {
            return None;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if (value - OVERFLOW_SENTINEL).abs() < 1e30 => None,
            Ok(value) if value.is_finite() => Some(value),
            _ => None,
        }
    }

}

/// A scripted failure a `MockDriver` call can be configured to raise.
#[derive(Debug, Clone)]
pub enum Fault {
    /// An ordinary (non-fatal) failure, e.g. a timeout.
    Transient(String),
    /// A failure string containing one of the fatal markers from spec
    /// §4.1, which should immediately disconnect the session.
    Fatal(String),
}

impl Fault {
    fn message(&self) -> &str {
        match self {
            Fault::Transient(m) | Fault::Fatal(m) => m,
        }
    }
}

/// A deterministic, in-memory `DeviceDriver` for tests and the
/// demonstration binary. Holds a shared `DeviceStatus` that test code can
/// mutate to simulate instrument behavior between polls, plus a queue of
/// scripted faults consumed one at a time by `get_status`.
pub struct MockDriver {
    info: DeviceInfo,
    capabilities: DeviceCapabilities,
    status: Mutex<DeviceStatus>,
    poll_faults: Mutex<Vec<Fault>>,
    /// Shared so test code can flip it on *after* the driver has already
    /// been moved into a `DeviceSession`.
    set_value_should_fail: Arc<AtomicBool>,
    readback_value: Mutex<HashMap<String, f64>>,
    calls: AtomicU64,
}

impl MockDriver {
    pub fn new(info: DeviceInfo, capabilities: DeviceCapabilities, initial: DeviceStatus) -> Self {
        Self {
            info,
            capabilities,
            status: Mutex::new(initial),
            poll_faults: Mutex::new(Vec::new()),
            set_value_should_fail: Arc::new(AtomicBool::new(false)),
            readback_value: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Returns a handle to the one-shot write-failure flag, so a test can
    /// arm it after the driver has already been handed to a session.
    pub fn fail_flag_handle(&self) -> Arc<AtomicBool> {
        self.set_value_should_fail.clone()
    }

    /// Replaces the status the next successful `get_status` will return.
    pub async fn set_status(&self, status: DeviceStatus) {
        *self.status.lock().await = status;
    }

    /// Queues one poll failure; consumed front-to-back, one per
    /// `get_status` call.
    pub async fn queue_fault(&self, fault: Fault) {
        self.poll_faults.lock().await.push(fault);
    }

    pub fn fail_next_set_value(&self) {
        self.set_value_should_fail.store(true, Ordering::SeqCst);
    }

    pub async fn set_readback(&self, name: &str, value: f64) {
        self.readback_value
            .lock()
            .await
            .insert(name.to_string(), value);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    async fn probe(&mut self) -> Result<DeviceInfo, ProbeError> {
        Ok(self.info.clone())
    }

    async fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_status(&mut self) -> anyhow::Result<DeviceStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.poll_faults.lock().await;
        if !faults.is_empty() {
            let fault = faults.remove(0);
            anyhow::bail!("{}", fault.message());
        }
        drop(faults);
        Ok(self.status.lock().await.clone())
    }

    async fn set_mode(&mut self, mode: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.set_value_should_fail.swap(false, Ordering::SeqCst) {
            anyhow::bail!("set_mode failed");
        }
        self.status.lock().await.mode = mode.to_string();
        Ok(())
    }

    async fn set_output(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.set_value_should_fail.swap(false, Ordering::SeqCst) {
            anyhow::bail!("set_output failed");
        }
        self.status.lock().await.output_enabled = enabled;
        Ok(())
    }

    async fn set_value(&mut self, name: &str, value: f64) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.set_value_should_fail.swap(false, Ordering::SeqCst) {
            anyhow::bail!("set_value failed for {}", name);
        }
        self.status
            .lock()
            .await
            .setpoints
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn get_value(&mut self, name: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.readback_value.lock().await.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::DeviceKind;

    fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            modes: vec!["CC".into(), "CV".into()],
            mode_settable: true,
            outputs: vec![super::super::types::OutputChannel {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: 0.0,
                max: 5.0,
                modes: vec!["CC".into()],
            }],
            measurements: vec![super::super::types::MeasurementChannel {
                name: "voltage".into(),
                unit: "V".into(),
                decimals: 3,
            }],
            list_mode: None,
        }
    }

    fn driver() -> MockDriver {
        MockDriver::new(
            DeviceInfo {
                id: "psu-1".into(),
                kind: DeviceKind::PowerSupply,
                manufacturer: "Acme".into(),
                model: "PS-100".into(),
                serial: None,
            },
            capabilities(),
            DeviceStatus {
                mode: "CC".into(),
                output_enabled: false,
                setpoints: HashMap::from([("current".to_string(), 1.0)]),
                measurements: HashMap::from([("voltage".to_string(), 12.5)]),
                list_running: None,
            },
        )
    }

    #[tokio::test]
    async fn queued_fault_is_consumed_once() {
        let mut d = driver();
        d.queue_fault(Fault::Transient("timeout".into())).await;
        assert!(d.get_status().await.is_err());
        assert!(d.get_status().await.is_ok());
    }

    #[tokio::test]
    async fn fail_next_set_value_applies_once() {
        let mut d = driver();
        d.fail_next_set_value();
        assert!(d.set_value("current", 2.0).await.is_err());
        assert!(d.set_value("current", 2.0).await.is_ok());
    }
}
