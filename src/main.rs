//! Demonstration binary: wires a mock power supply into a `SessionManager`,
//! runs a short sine sequence against it, and lets a trigger script watch
//! the live measurement stream.
//!
//! The real REST/WebSocket surface, persistent library, and hardware
//! drivers are out of scope for this crate (spec §1); this binary exists
//! only so the core subsystems can be exercised end to end without one.

use async_trait::async_trait;
use rust_bench::device::{DeviceCapabilities, DeviceStatus, MeasurementChannel, MockDriver, OutputChannel};
use rust_bench::device::{DeviceInfo, DeviceKind};
use rust_bench::discovery::DiscoveredDevice;
use rust_bench::sequence::{
    ParametricKind, RepeatMode, SequenceController, SequenceDefinition, SequenceRunConfig, Unit,
    Waveform,
};
use rust_bench::trigger::{
    Action, Condition, Operator, SequenceDispatch, Trigger, TriggerEngine, TriggerRepeat,
    TriggerScript,
};
use rust_bench::{CoreConfig, CoreResult, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Dispatches `startSequence`/`stopSequence` trigger actions into a
/// single demo-scoped sequence controller slot (spec §9 "avoid circular
/// construction by injecting the already-built managers").
struct DemoSequenceDispatch {
    slot: parking_lot::Mutex<Option<SequenceController>>,
    manager: Arc<rust_bench::SessionManager>,
    definition: SequenceDefinition,
    clock: Arc<SystemClock>,
    min_interval_ms: u64,
}

#[async_trait]
impl SequenceDispatch for DemoSequenceDispatch {
    async fn run(
        &self,
        _sequence_id: &str,
        device_id: &str,
        parameter: &str,
        repeat_mode: RepeatMode,
    ) -> CoreResult<()> {
        let session = self
            .manager
            .get_session(device_id)
            .ok_or_else(|| rust_bench::CoreError::DeviceNotFound(device_id.to_string()))?;
        let run_config = SequenceRunConfig {
            sequence_id: self.definition.id.clone(),
            target_device_id: device_id.to_string(),
            parameter: parameter.to_string(),
            repeat_mode,
        };
        let controller = SequenceController::start(
            self.definition.clone(),
            run_config,
            session,
            self.clock.clone(),
            self.min_interval_ms,
        )?;
        *self.slot.lock() = Some(controller);
        Ok(())
    }

    async fn abort(&self, _sequence_id: &str) -> CoreResult<()> {
        if let Some(controller) = self.slot.lock().take() {
            controller.abort();
        }
        Ok(())
    }
}

fn mock_power_supply() -> (DeviceInfo, DeviceCapabilities, MockDriver) {
    let info = DeviceInfo {
        id: "psu-1".to_string(),
        kind: DeviceKind::PowerSupply,
        manufacturer: "Acme".to_string(),
        model: "PS-100".to_string(),
        serial: Some("SN0001".to_string()),
    };
    let capabilities = DeviceCapabilities {
        modes: vec!["CC".to_string(), "CV".to_string()],
        mode_settable: true,
        outputs: vec![OutputChannel {
            name: "current".to_string(),
            unit: "A".to_string(),
            decimals: 3,
            min: 0.0,
            max: 5.0,
            modes: vec!["CC".to_string()],
        }],
        measurements: vec![
            MeasurementChannel {
                name: "voltage".to_string(),
                unit: "V".to_string(),
                decimals: 3,
            },
            MeasurementChannel {
                name: "current".to_string(),
                unit: "A".to_string(),
                decimals: 3,
            },
        ],
        list_mode: None,
    };
    let driver = MockDriver::new(
        info.clone(),
        capabilities.clone(),
        DeviceStatus {
            mode: "CC".to_string(),
            output_enabled: true,
            setpoints: HashMap::from([("current".to_string(), 0.0)]),
            measurements: HashMap::from([("voltage".to_string(), 0.0), ("current".to_string(), 0.0)]),
            list_running: None,
        },
    );
    (info, capabilities, driver)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = CoreConfig::load(None).expect("compiled-in defaults always parse");
    let clock = Arc::new(SystemClock::new());
    let manager = Arc::new(rust_bench::SessionManager::new(
        clock.clone(),
        rust_bench::device::SessionConfig {
            poll_interval_ms: config.poll_interval_ms,
            history_window_ms: config.history_window_ms,
            max_consecutive_errors: config.max_consecutive_errors,
            debounce_ms: config.debounce_ms,
        },
    ));

    let (info, capabilities, driver) = mock_power_supply();
    manager
        .sync_devices(vec![DiscoveredDevice {
            info,
            capabilities,
            driver: Box::new(driver),
        }])
        .await;

    let sequence = SequenceDefinition {
        id: "seq-demo".to_string(),
        name: "gentle sine sweep".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        unit: Unit::Amp,
        waveform: Waveform::Parametric {
            r#type: ParametricKind::Sine,
            min: 0.5,
            max: 2.0,
            points_per_cycle: 8,
            interval_ms: 200,
        },
        modifiers: Default::default(),
    };

    let dispatch = Arc::new(DemoSequenceDispatch {
        slot: parking_lot::Mutex::new(None),
        manager: manager.clone(),
        definition: sequence.clone(),
        clock: clock.clone(),
        min_interval_ms: config.sequence_min_interval_ms,
    });

    let script = TriggerScript {
        id: "script-demo".to_string(),
        triggers: vec![
            Trigger {
                id: "trg-start".to_string(),
                condition: Condition::Time {
                    seconds_from_start: 0.1,
                },
                action: Action::StartSequence {
                    sequence_id: sequence.id.clone(),
                    device_id: "psu-1".to_string(),
                    parameter: "current".to_string(),
                    repeat_mode: RepeatMode::Count { n: 2 },
                },
                repeat_mode: TriggerRepeat::Once,
                debounce_ms: 0,
            },
            Trigger {
                id: "trg-highvoltage".to_string(),
                condition: Condition::Value {
                    device_id: "psu-1".to_string(),
                    parameter: "voltage".to_string(),
                    operator: Operator::Gt,
                    threshold: 10.0,
                },
                action: Action::SetOutput {
                    device_id: "psu-1".to_string(),
                    enabled: false,
                },
                repeat_mode: TriggerRepeat::Once,
                debounce_ms: 0,
            },
        ],
    };

    let engine = TriggerEngine::start(
        script,
        manager.clone(),
        dispatch,
        clock,
        config.trigger_eval_interval_ms,
        config.trigger_progress_interval_ms,
    );

    let client_id: String = Uuid::new_v4().to_string();
    let mut device_rx = manager
        .subscribe("psu-1", client_id.clone())
        .expect("device just registered");
    let mut trigger_rx = engine.subscribe(client_id.clone());

    let deadline = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(msg) = device_rx.recv() => {
                tracing::info!(?msg, "device event");
            }
            Some(msg) = trigger_rx.recv() => {
                tracing::info!(?msg, "trigger event");
            }
        }
    }

    engine.stop();
    manager.unsubscribe_all(&client_id);
}
