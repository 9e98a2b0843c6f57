//! End-to-end integration test: a trigger script starts a sequence
//! controller against a live session, and the sequence's own writes are
//! observable as ordinary optimistic setpoint updates on that session.
//!
//! Exercises the seam spec §9 flags as needing injected capability
//! parameters: `TriggerEngine` never constructs a `SequenceController`
//! itself, it calls out through a `SequenceDispatch` the caller supplies.

use async_trait::async_trait;
use rust_bench::device::{
    DeviceCapabilities, DeviceInfo, DeviceKind, DeviceStatus, MeasurementChannel, MockDriver,
    OutputChannel, SessionConfig,
};
use rust_bench::discovery::DiscoveredDevice;
use rust_bench::sequence::{
    ParametricKind, RepeatMode, SequenceController, SequenceDefinition, SequenceRunConfig, Unit,
    Waveform,
};
use rust_bench::trigger::{
    Action, Condition, SequenceDispatch, Trigger, TriggerEngine, TriggerRepeat, TriggerScript,
};
use rust_bench::{CoreError, CoreResult, SessionManager, SystemClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct OneShotDispatch {
    manager: Arc<SessionManager>,
    definition: SequenceDefinition,
    clock: Arc<SystemClock>,
    slot: parking_lot::Mutex<Option<SequenceController>>,
}

#[async_trait]
impl SequenceDispatch for OneShotDispatch {
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
            .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_string()))?;
        let controller = SequenceController::start(
            self.definition.clone(),
            SequenceRunConfig {
                sequence_id: self.definition.id.clone(),
                target_device_id: device_id.to_string(),
                parameter: parameter.to_string(),
                repeat_mode,
            },
            session,
            self.clock.clone(),
            10,
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

fn capabilities() -> DeviceCapabilities {
    DeviceCapabilities {
        modes: vec!["CC".to_string()],
        mode_settable: true,
        outputs: vec![OutputChannel {
            name: "current".to_string(),
            unit: "A".to_string(),
            decimals: 3,
            min: 0.0,
            max: 10.0,
            modes: vec!["CC".to_string()],
        }],
        measurements: vec![MeasurementChannel {
            name: "voltage".to_string(),
            unit: "V".to_string(),
            decimals: 3,
        }],
        list_mode: None,
    }
}

fn info() -> DeviceInfo {
    DeviceInfo {
        id: "psu-1".to_string(),
        kind: DeviceKind::PowerSupply,
        manufacturer: "Acme".to_string(),
        model: "PS-100".to_string(),
        serial: None,
    }
}

#[tokio::test(start_paused = true)]
async fn time_trigger_starts_sequence_which_drives_real_setpoints() {
    let clock = Arc::new(SystemClock::new());
    let manager = Arc::new(SessionManager::new(
        clock.clone(),
        SessionConfig {
            poll_interval_ms: 1_000_000,
            history_window_ms: 60_000,
            max_consecutive_errors: 10,
            debounce_ms: 10,
        },
    ));

    let driver = MockDriver::new(
        info(),
        capabilities(),
        DeviceStatus {
            mode: "CC".to_string(),
            output_enabled: true,
            setpoints: HashMap::new(),
            measurements: HashMap::new(),
            list_running: None,
        },
    );
    manager
        .sync_devices(vec![DiscoveredDevice {
            info: info(),
            capabilities: capabilities(),
            driver: Box::new(driver),
        }])
        .await;

    let definition = SequenceDefinition {
        id: "seq-1".to_string(),
        name: "ramp".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        unit: Unit::Amp,
        waveform: Waveform::Parametric {
            r#type: ParametricKind::Ramp,
            min: 0.0,
            max: 1.0,
            points_per_cycle: 2,
            interval_ms: 10,
        },
        modifiers: Default::default(),
    };

    let dispatch = Arc::new(OneShotDispatch {
        manager: manager.clone(),
        definition,
        clock: clock.clone(),
        slot: parking_lot::Mutex::new(None),
    });

    let script = TriggerScript {
        id: "script-1".to_string(),
        triggers: vec![Trigger {
            id: "trg-1".to_string(),
            condition: Condition::Time {
                seconds_from_start: 0.01,
            },
            action: Action::StartSequence {
                sequence_id: "seq-1".to_string(),
                device_id: "psu-1".to_string(),
                parameter: "current".to_string(),
                repeat_mode: RepeatMode::Once,
            },
            repeat_mode: TriggerRepeat::Once,
            debounce_ms: 0,
        }],
    };

    let engine = TriggerEngine::start(script, manager.clone(), dispatch, clock, 10, 500);

    tokio::time::advance(Duration::from_millis(100)).await;

    assert_eq!(engine.get_state().triggers[0].fired_count, 1);
    let state = manager.get_session("psu-1").unwrap().get_state();
    let setpoint = state
        .status
        .expect("at least one setValue landed")
        .setpoints
        .get("current")
        .copied();
    assert_eq!(setpoint, Some(1.0));

    engine.stop();
}
