//! `DeviceSession`: the live model + polling loop for one device (spec §4.1).
//!
//! Holds the authoritative `DeviceSessionState`, polls the driver forever at
//! a fixed cadence, fans out precise deltas over its own `Bus`, and
//! serializes writes back to hardware with optimistic rollback. At most one
//! driver call is ever outstanding at a time (spec §5): every driver call,
//! poll or write, goes through the same `tokio::sync::Mutex`, which is also
//! what makes `reconnect` safe — swapping the driver requires that lock, so
//! it can never race an in-flight `get_status`.

use super::driver::DeviceDriver;
use super::types::{ConnectionStatus, DeviceSessionState, DeviceStatus};
use crate::broadcast::{Bus, ClientId, FieldName, Message};
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The subset of `CoreConfig` a session needs, so tests can construct one
/// without pulling in the whole figment-loaded config.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub history_window_ms: i64,
    pub max_consecutive_errors: u32,
    pub debounce_ms: u64,
}

impl From<&crate::config::CoreConfig> for SessionConfig {
    fn from(c: &crate::config::CoreConfig) -> Self {
        Self {
            poll_interval_ms: c.poll_interval_ms,
            history_window_ms: c.history_window_ms,
            max_consecutive_errors: c.max_consecutive_errors,
            debounce_ms: c.debounce_ms,
        }
    }
}

struct DebounceEntry {
    /// The setpoint value as it stood before this burst of calls began —
    /// what a failed write with no driver readback falls back to.
    base_value: Option<f64>,
    handle: JoinHandle<()>,
}

struct Inner {
    device_id: String,
    state: parking_lot::RwLock<DeviceSessionState>,
    driver: AsyncMutex<Box<dyn DeviceDriver>>,
    bus: Bus,
    debounce: parking_lot::Mutex<HashMap<String, DebounceEntry>>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    polling_enabled: AtomicBool,
    stopped: AtomicBool,
    poll_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Counts consecutive getStatus failures for the state-machine
    /// transition logic; mirrors `state.consecutive_errors` but lets the
    /// poll loop read/update it without taking the state write lock twice.
    consecutive_errors: AtomicU32,
}

/// A live, polled session for one device. Cheaply `Clone`-able (it's an
/// `Arc` handle); never destroyed while the process lives (spec §3
/// "Lifecycles").
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl DeviceSession {
    /// Creates a session for an already-probed device and starts polling
    /// immediately, per spec §4.1 ("Start immediately on construction").
    pub fn new(
        state: DeviceSessionState,
        driver: Box<dyn DeviceDriver>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let device_id = state.info.id.clone();
        let inner = Arc::new(Inner {
            device_id,
            state: parking_lot::RwLock::new(state),
            driver: AsyncMutex::new(driver),
            bus: Bus::new(),
            debounce: parking_lot::Mutex::new(HashMap::new()),
            config,
            clock,
            polling_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            poll_task: parking_lot::Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
        });
        let handle = tokio::spawn(Self::poll_loop(inner.clone()));
        *inner.poll_task.lock() = Some(handle);
        Self { inner }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Read-only snapshot; callers must not mutate it. Non-blocking (spec
    /// §5: "All pure state reads... must be non-blocking").
    pub fn get_state(&self) -> DeviceSessionState {
        self.inner.state.read().clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.read().connection_status
    }

    pub fn subscribe(&self, client_id: ClientId) -> mpsc::Receiver<Arc<Message>> {
        self.inner.bus.subscribe(client_id)
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.inner.bus.unsubscribe(client_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.bus.subscriber_count()
    }

    /// Immediate mode write (spec §4.1 `setMode`): optimistic update +
    /// broadcast, then the driver call, with rollback on failure.
    pub async fn set_mode(&self, mode: &str) -> CoreResult<()> {
        let previous = {
            let state = self.inner.state.read();
            state
                .status
                .as_ref()
                .map(|s| s.mode.clone())
                .unwrap_or_default()
        };

        self.apply_mode(mode);
        self.publish_field(FieldName::Mode, json!(mode));

        let result = {
            let mut driver = self.inner.driver.lock().await;
            driver.set_mode(mode).await
        };

        if let Err(e) = result {
            self.apply_mode(&previous);
            self.publish_field(FieldName::Mode, json!(previous));
            return Err(CoreError::Driver(e.to_string()));
        }
        Ok(())
    }

    pub async fn set_output(&self, enabled: bool) -> CoreResult<()> {
        let previous = {
            let state = self.inner.state.read();
            state.status.as_ref().map(|s| s.output_enabled).unwrap_or(false)
        };

        self.apply_output(enabled);
        self.publish_field(FieldName::OutputEnabled, json!(enabled));

        let result = {
            let mut driver = self.inner.driver.lock().await;
            driver.set_output(enabled).await
        };

        if let Err(e) = result {
            self.apply_output(previous);
            self.publish_field(FieldName::OutputEnabled, json!(previous));
            return Err(CoreError::Driver(e.to_string()));
        }
        Ok(())
    }

    /// `setValue` (spec §4.1): optimistic update always happens
    /// synchronously; the driver write is either immediate (this call
    /// awaits it) or debounced (a per-name timer collapses a burst into one
    /// write).
    pub async fn set_value(&self, name: &str, value: f64, immediate: bool) -> CoreResult<()> {
        if !self.inner.state.read().capabilities.has_output(name) {
            return Err(CoreError::ParameterNotFound(name.to_string()));
        }

        let previous = self.current_setpoint(name);
        self.apply_setpoint(name, value);
        self.publish_setpoints();

        if immediate {
            // An immediate write supersedes any pending debounced write for
            // the same name (spec leaves this interaction undocumented;
            // resolved in DESIGN.md).
            self.cancel_debounce(name);

            let result = {
                let mut driver = self.inner.driver.lock().await;
                driver.set_value(name, value).await
            };
            if let Err(e) = result {
                self.restore_setpoint(name, previous);
                self.publish_setpoints();
                return Err(CoreError::Driver(e.to_string()));
            }
            return Ok(());
        }

        self.arm_debounce(name, value, previous);
        Ok(())
    }

    fn arm_debounce(&self, name: &str, value: f64, observed_previous: Option<f64>) {
        let mut debounce = self.inner.debounce.lock();
        let base_value = match debounce.remove(name) {
            Some(entry) => {
                entry.handle.abort();
                entry.base_value
            }
            None => observed_previous,
        };

        let inner = self.inner.clone();
        let name_owned = name.to_string();
        let debounce_ms = self.inner.config.debounce_ms;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            Inner::fire_debounced_write(inner, name_owned, value, base_value).await;
        });

        debounce.insert(
            name.to_string(),
            DebounceEntry {
                base_value,
                handle,
            },
        );
    }

    fn cancel_debounce(&self, name: &str) {
        if let Some(entry) = self.inner.debounce.lock().remove(name) {
            entry.handle.abort();
        }
    }

    /// Swaps the driver after a rediscovery. Blocks (via the driver mutex)
    /// until any in-flight `get_status` observes the old driver's
    /// completion, per spec §5.
    pub async fn reconnect(&self, new_driver: Box<dyn DeviceDriver>) {
        {
            let mut driver = self.inner.driver.lock().await;
            *driver = new_driver;
        }
        {
            let mut state = self.inner.state.write();
            state.connection_status = ConnectionStatus::Connected;
            state.consecutive_errors = 0;
        }
        self.inner.consecutive_errors.store(0, Ordering::SeqCst);
        self.inner.polling_enabled.store(true, Ordering::SeqCst);
        info!(device_id = %self.inner.device_id, "session reconnected");
        self.publish_field(FieldName::ConnectionStatus, json!("connected"));
    }

    /// Terminal: cancels the poll timer, all pending debounce timers, and
    /// clears subscribers. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.poll_task.lock().take() {
            handle.abort();
        }
        let mut debounce = self.inner.debounce.lock();
        for (_, entry) in debounce.drain() {
            entry.handle.abort();
        }
        self.inner.bus.clear();
    }

    // -- internal state-mutation helpers, each keeping the lock scope tiny --

    fn apply_mode(&self, mode: &str) {
        let mut state = self.inner.state.write();
        let status = state
            .status
            .get_or_insert_with(DeviceSession::default_status);
        status.mode = mode.to_string();
    }

    fn apply_output(&self, enabled: bool) {
        let mut state = self.inner.state.write();
        let status = state
            .status
            .get_or_insert_with(DeviceSession::default_status);
        status.output_enabled = enabled;
    }

    fn current_setpoint(&self, name: &str) -> Option<f64> {
        self.inner
            .state
            .read()
            .status
            .as_ref()
            .and_then(|s| s.setpoints.get(name).copied())
    }

    fn apply_setpoint(&self, name: &str, value: f64) {
        let mut state = self.inner.state.write();
        let status = state
            .status
            .get_or_insert_with(DeviceSession::default_status);
        status.setpoints.insert(name.to_string(), value);
    }

    fn restore_setpoint(&self, name: &str, previous: Option<f64>) {
        let mut state = self.inner.state.write();
        let status = state
            .status
            .get_or_insert_with(DeviceSession::default_status);
        match previous {
            Some(v) => {
                status.setpoints.insert(name.to_string(), v);
            }
            None => {
                status.setpoints.remove(name);
            }
        }
    }

    fn default_status() -> DeviceStatus {
        DeviceStatus {
            mode: String::new(),
            output_enabled: false,
            setpoints: HashMap::new(),
            measurements: HashMap::new(),
            list_running: None,
        }
    }

    fn publish_field(&self, field: FieldName, value: serde_json::Value) {
        self.inner.bus.publish(Message::Field {
            device_id: self.inner.device_id.clone(),
            field,
            value,
        });
    }

    fn publish_setpoints(&self) {
        let setpoints = self
            .inner
            .state
            .read()
            .status
            .as_ref()
            .map(|s| s.setpoints.clone())
            .unwrap_or_default();
        self.publish_field(FieldName::Setpoints, json!(setpoints));
    }

    async fn poll_loop(inner: Arc<Inner>) {
        let mut interval = tokio::time::interval(Duration::from_millis(inner.config.poll_interval_ms));
        loop {
            interval.tick().await;
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            if !inner.polling_enabled.load(Ordering::SeqCst) {
                continue;
            }
            let result = {
                let mut driver = inner.driver.lock().await;
                driver.get_status().await
            };
            match result {
                Ok(status) => Inner::handle_poll_success(&inner, status),
                Err(e) => Inner::handle_poll_failure(&inner, e.to_string()),
            }
        }
    }
}

impl Inner {
    fn handle_poll_success(inner: &Arc<Inner>, status: DeviceStatus) {
        let was_error;
        {
            let mut state = inner.state.write();
            was_error = state.connection_status == ConnectionStatus::Error;

            // The very first poll establishes the baseline silently; field
            // broadcasts are deltas, and there's nothing to have changed
            // from yet.
            if let Some(previous) = state.status.as_ref() {
                if previous.mode != status.mode {
                    Self::publish_field_locked(inner, FieldName::Mode, json!(status.mode));
                }
                if previous.output_enabled != status.output_enabled {
                    Self::publish_field_locked(
                        inner,
                        FieldName::OutputEnabled,
                        json!(status.output_enabled),
                    );
                }
            }

            let now = inner.clock.now();
            let voltage = status.measurements.get("voltage").copied().unwrap_or(0.0);
            let current = status.measurements.get("current").copied().unwrap_or(0.0);
            let power = status.measurements.get("power").copied().unwrap_or(0.0);
            let resistance = status.measurements.get("resistance").copied();

            state.history.push(
                now,
                voltage,
                current,
                power,
                resistance,
                inner.config.history_window_ms,
            );
            state.last_updated = Some(now);
            state.status = Some(status.clone());

            if was_error {
                state.connection_status = ConnectionStatus::Connected;
            }
            state.consecutive_errors = 0;
        }
        inner.consecutive_errors.store(0, Ordering::SeqCst);

        if was_error {
            Self::publish_field_locked(inner, FieldName::ConnectionStatus, json!("connected"));
        }

        inner.bus.publish(Message::Measurement {
            device_id: inner.device_id.clone(),
            timestamp: inner.clock.now(),
            measurements: status.measurements,
        });
    }

    fn handle_poll_failure(inner: &Arc<Inner>, message: String) {
        let errors = inner.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let fatal = CoreError::is_fatal_transport_marker(&message);

        let mut state = inner.state.write();
        state.consecutive_errors = errors;
        let was = state.connection_status;

        let next = if fatal || errors >= inner.config.max_consecutive_errors {
            ConnectionStatus::Disconnected
        } else if was == ConnectionStatus::Connected {
            ConnectionStatus::Error
        } else {
            was
        };

        if next != was {
            state.connection_status = next;
            drop(state);
            if next == ConnectionStatus::Disconnected {
                // Halt scheduling only after the transition is queued for
                // broadcast, per spec §5 ordering guarantee.
                Self::publish_field_locked(
                    inner,
                    FieldName::ConnectionStatus,
                    json!(match next {
                        ConnectionStatus::Disconnected => "disconnected",
                        ConnectionStatus::Error => "error",
                        ConnectionStatus::Connected => "connected",
                    }),
                );
                inner.polling_enabled.store(false, Ordering::SeqCst);
                warn!(device_id = %inner.device_id, %message, "session disconnected");
            } else {
                Self::publish_field_locked(
                    inner,
                    FieldName::ConnectionStatus,
                    json!("error"),
                );
                debug!(device_id = %inner.device_id, %message, "poll error");
            }
        }
    }

    fn publish_field_locked(inner: &Arc<Inner>, field: FieldName, value: serde_json::Value) {
        inner.bus.publish(Message::Field {
            device_id: inner.device_id.clone(),
            field,
            value,
        });
    }

    async fn fire_debounced_write(
        inner_via_session: Arc<Inner>,
        name: String,
        value: f64,
        base_value: Option<f64>,
    ) {
        let inner = inner_via_session;
        let result = {
            let mut driver = inner.driver.lock().await;
            driver.set_value(&name, value).await
        };

        if result.is_ok() {
            inner.debounce.lock().remove(&name);
            return;
        }

        let readback = {
            let mut driver = inner.driver.lock().await;
            driver.get_value(&name).await.unwrap_or(None)
        };
        let corrected = readback.or(base_value);

        {
            let mut state = inner.state.write();
            let status = state.status.get_or_insert_with(DeviceSession::default_status);
            match corrected {
                Some(v) => {
                    status.setpoints.insert(name.clone(), v);
                }
                None => {
                    status.setpoints.remove(&name);
                }
            }
        }
        let setpoints = inner
            .state
            .read()
            .status
            .as_ref()
            .map(|s| s.setpoints.clone())
            .unwrap_or_default();
        inner.bus.publish(Message::Field {
            device_id: inner.device_id.clone(),
            field: FieldName::Setpoints,
            value: json!(setpoints),
        });
        inner.bus.publish(Message::Error {
            device_id: inner.device_id.clone(),
            code: "SET_VALUE_FAILED".to_string(),
            message: format!("failed to set '{name}'"),
        });
        inner.debounce.lock().remove(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::device::driver::{Fault, MockDriver};
    use crate::device::types::{
        DeviceCapabilities, DeviceInfo, DeviceKind, DeviceSessionState, MeasurementChannel,
        OutputChannel,
    };

    fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            modes: vec!["CC".into(), "CV".into()],
            mode_settable: true,
            outputs: vec![OutputChannel {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: 0.0,
                max: 5.0,
                modes: vec!["CC".into()],
            }],
            measurements: vec![
                MeasurementChannel {
                    name: "voltage".into(),
                    unit: "V".into(),
                    decimals: 3,
                },
                MeasurementChannel {
                    name: "current".into(),
                    unit: "A".into(),
                    decimals: 3,
                },
                MeasurementChannel {
                    name: "power".into(),
                    unit: "W".into(),
                    decimals: 3,
                },
            ],
            list_mode: None,
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            id: "psu-1".into(),
            kind: DeviceKind::PowerSupply,
            manufacturer: "Acme".into(),
            model: "PS-100".into(),
            serial: None,
        }
    }

    fn status(voltage: f64, current: f64) -> DeviceStatus {
        DeviceStatus {
            mode: "CC".into(),
            output_enabled: false,
            setpoints: HashMap::from([("current".to_string(), current)]),
            measurements: HashMap::from([
                ("voltage".to_string(), voltage),
                ("current".to_string(), current),
                ("power".to_string(), voltage * current),
            ]),
            list_running: None,
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 10,
            history_window_ms: 60_000,
            max_consecutive_errors: 10,
            debounce_ms: 30,
        }
    }

    fn new_session(driver: MockDriver) -> DeviceSession {
        let state = DeviceSessionState::new(info(), capabilities());
        DeviceSession::new(
            state,
            Box::new(driver),
            Arc::new(SystemClock::new()),
            config(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn happy_poll_produces_measurement_messages_and_no_field_messages() {
        let driver = MockDriver::new(info(), capabilities(), status(12.5, 0.98));
        let session = new_session(driver);
        let mut rx = session.subscribe("client-1".into());

        tokio::time::advance(Duration::from_millis(35)).await;

        let mut measurement_count = 0;
        let mut field_count = 0;
        while let Ok(msg) = rx.try_recv() {
            match &*msg {
                Message::Measurement { .. } => measurement_count += 1,
                Message::Field { .. } => field_count += 1,
                _ => {}
            }
        }
        assert!(measurement_count >= 3, "got {measurement_count}");
        assert_eq!(field_count, 0);

        let state = session.get_state();
        assert!(state.history.lengths_match());
        assert!(state.history.voltage.iter().all(|v| *v == 12.5));
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_set_value_collapses_to_one_driver_call() {
        let driver = MockDriver::new(info(), capabilities(), status(12.5, 1.0));
        let session = new_session(driver);

        session.set_value("current", 1.0, false).await.unwrap();
        session.set_value("current", 1.5, false).await.unwrap();
        session.set_value("current", 2.0, false).await.unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        // Polls may have happened in between; we only assert on the setpoint write path.
        tokio::time::advance(Duration::from_millis(40)).await;

        let state = session.get_state();
        assert_eq!(state.status.unwrap().setpoints["current"], 2.0);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_failure_falls_back_to_driver_readback() {
        let driver = MockDriver::new(info(), capabilities(), status(12.5, 0.8));
        driver.set_readback("current", 0.8).await;
        let fail_flag = driver.fail_flag_handle();
        let session = new_session(driver);

        let mut rx = session.subscribe("c".into());
        fail_flag.store(true, Ordering::SeqCst);
        session.set_value("current", 5.0, false).await.unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;

        let mut saw_set_value_failed = false;
        while let Ok(msg) = rx.try_recv() {
            if let Message::Error { code, .. } = &*msg {
                if code == "SET_VALUE_FAILED" {
                    saw_set_value_failed = true;
                }
            }
        }
        assert!(saw_set_value_failed);
        let state = session.get_state();
        assert_eq!(state.status.unwrap().setpoints["current"], 0.8);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_marker_disconnects_on_single_poll() {
        let driver = MockDriver::new(info(), capabilities(), status(12.5, 1.0));
        driver
            .queue_fault(Fault::Fatal("LIBUSB_ERROR_NO_DEVICE".into()))
            .await;
        let session = new_session(driver);

        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);
        session.stop();
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn fatal_marker_disconnect_is_logged() {
        use tracing_test::logs_contain;
        let driver = MockDriver::new(info(), capabilities(), status(12.5, 1.0));
        driver
            .queue_fault(Fault::Fatal("LIBUSB_ERROR_NO_DEVICE".into()))
            .await;
        let session = new_session(driver);

        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);
        assert!(logs_contain("session disconnected"));
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_polling_against_new_driver() {
        let driver = MockDriver::new(info(), capabilities(), status(1.0, 1.0));
        driver
            .queue_fault(Fault::Fatal("SERIAL_PORT_DISCONNECTED".into()))
            .await;
        let session = new_session(driver);
        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);

        let new_driver = MockDriver::new(info(), capabilities(), status(9.0, 1.0));
        session.reconnect(Box::new(new_driver)).await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connected);

        tokio::time::advance(Duration::from_millis(15)).await;
        let state = session.get_state();
        assert_eq!(state.status.unwrap().measurements["voltage"], 9.0);
        session.stop();
    }
}
