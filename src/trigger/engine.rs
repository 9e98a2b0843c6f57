//! `TriggerEngine` (spec §4.4): the reactive counterpart to
//! `SequenceController` — a periodic evaluator watches measurement
//! thresholds and elapsed time, firing actions on the rising edge of each
//! trigger's condition.
//!
//! Modeled the same way as `SequenceController`: one task owns all runtime
//! state, exposing a `parking_lot::RwLock` snapshot for reads and a command
//! channel for pause/resume/stop (spec §9 "closure of state").

use super::types::{
    Action, Condition, EngineExecutionState, EngineState, Trigger, TriggerRuntimeState, TriggerScript,
};
use crate::broadcast::{Bus, ClientId, Message};
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::sequence::RepeatMode;
use crate::session_manager::SessionManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

/// The `startSequence`/`stopSequence`/`pauseSequence` dispatch target a
/// `TriggerEngine` is injected with, rather than depending on a sequence
/// registry type the core doesn't otherwise define (spec §9 "avoid circular
/// construction by injecting capability parameters").
///
/// `pause` is declared optional (spec §9 open question (a)): the default
/// implementation always fails, so an engine wired without sequence-pause
/// support still reports `triggerActionFailed` rather than panicking or
/// silently dropping the action.
#[async_trait]
pub trait SequenceDispatch: Send + Sync {
    async fn run(
        &self,
        sequence_id: &str,
        device_id: &str,
        parameter: &str,
        repeat_mode: RepeatMode,
    ) -> CoreResult<()>;

    async fn abort(&self, sequence_id: &str) -> CoreResult<()>;

    fn pause(&self, sequence_id: &str) -> CoreResult<()> {
        Err(CoreError::NotImplemented(format!(
            "pauseSequence for '{sequence_id}'"
        )))
    }
}

enum Command {
    Pause,
    Resume,
    Stop,
}

struct Inner {
    state: parking_lot::RwLock<EngineState>,
    bus: Bus,
    commands: mpsc::UnboundedSender<Command>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one running trigger script (spec §4.4).
#[derive(Clone)]
pub struct TriggerEngine {
    inner: Arc<Inner>,
}

impl TriggerEngine {
    #[instrument(skip(script, session_manager, sequence_dispatch, clock))]
    pub fn start(
        script: TriggerScript,
        session_manager: Arc<SessionManager>,
        sequence_dispatch: Arc<dyn SequenceDispatch>,
        clock: Arc<dyn Clock>,
        eval_interval_ms: u64,
        progress_interval_ms: u64,
    ) -> Self {
        let triggers = vec![TriggerRuntimeState::default(); script.triggers.len()];
        let state = parking_lot::RwLock::new(EngineState {
            script_id: script.id.clone(),
            execution_state: EngineExecutionState::Idle,
            triggers,
            elapsed_ms: 0,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state,
            bus: Bus::new(),
            commands: tx,
            task: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(run_actor(
            inner.clone(),
            script,
            session_manager,
            sequence_dispatch,
            clock,
            eval_interval_ms,
            progress_interval_ms,
            rx,
        ));
        *inner.task.lock() = Some(handle);

        Self { inner }
    }

    pub fn get_state(&self) -> EngineState {
        self.inner.state.read().clone()
    }

    pub fn subscribe(&self, client_id: ClientId) -> mpsc::Receiver<Arc<Message>> {
        self.inner.bus.subscribe(client_id)
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.inner.bus.unsubscribe(client_id);
    }

    pub fn pause(&self) {
        let _ = self.inner.commands.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.inner.commands.send(Command::Resume);
    }

    /// Idempotent after a terminal stop: the task has exited and the
    /// command channel is closed.
    pub fn stop(&self) {
        let _ = self.inner.commands.send(Command::Stop);
    }
}

fn snapshot(inner: &Inner) -> serde_json::Value {
    serde_json::to_value(inner.state.read().clone()).unwrap_or(json!(null))
}

#[allow(clippy::too_many_arguments)]
async fn run_actor(
    inner: Arc<Inner>,
    script: TriggerScript,
    session_manager: Arc<SessionManager>,
    sequence_dispatch: Arc<dyn SequenceDispatch>,
    clock: Arc<dyn Clock>,
    eval_interval_ms: u64,
    progress_interval_ms: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let script_id = script.id.clone();
    let started_at_mono = clock.monotonic_ms();

    inner.state.write().execution_state = EngineExecutionState::Running;
    inner.bus.publish(Message::TriggerScriptStarted {
        script_id: script_id.clone(),
    });

    let mut next_eval = started_at_mono + eval_interval_ms as i64;
    let mut next_progress = started_at_mono + progress_interval_ms as i64;
    let mut pause_elapsed_ms: i64 = 0;

    // One-shot absolute deadlines for time-kind conditions; `None` once
    // fired, or always for value-kind triggers (spec §4.4 "time-condition
    // timers scheduled from startedAt").
    let mut time_deadlines: Vec<Option<i64>> = script
        .triggers
        .iter()
        .map(|t| match &t.condition {
            Condition::Time { seconds_from_start } => {
                Some(started_at_mono + (seconds_from_start * 1000.0) as i64)
            }
            Condition::Value { .. } => None,
        })
        .collect();

    'run: loop {
        let now = clock.monotonic_ms();
        let mut next_wake = next_eval.min(next_progress);
        for deadline in time_deadlines.iter().flatten() {
            next_wake = next_wake.min(*deadline);
        }
        let delay_ms = (next_wake - now).max(0) as u64;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            cmd = commands.recv() => {
                match cmd {
                    None | Some(Command::Stop) => {
                        do_stop(&inner, &script_id);
                        return;
                    }
                    Some(Command::Pause) => {
                        let paused_at = clock.monotonic_ms();
                        inner.state.write().execution_state = EngineExecutionState::Paused;
                        inner.bus.publish(Message::TriggerScriptPaused {
                            script_id: script_id.clone(),
                        });
                        loop {
                            match commands.recv().await {
                                Some(Command::Resume) => {
                                    let paused_duration = clock.monotonic_ms() - paused_at;
                                    pause_elapsed_ms += paused_duration;
                                    next_eval += paused_duration;
                                    next_progress += paused_duration;
                                    for deadline in time_deadlines.iter_mut() {
                                        if let Some(t) = deadline {
                                            *t += paused_duration;
                                        }
                                    }
                                    inner.state.write().execution_state = EngineExecutionState::Running;
                                    inner.bus.publish(Message::TriggerScriptResumed {
                                        script_id: script_id.clone(),
                                    });
                                    break;
                                }
                                None | Some(Command::Stop) => {
                                    do_stop(&inner, &script_id);
                                    return;
                                }
                                Some(Command::Pause) => continue,
                            }
                        }
                        continue 'run;
                    }
                    Some(Command::Resume) => {}
                }
            }
        }

        let now = clock.monotonic_ms();

        if now >= next_progress {
            inner.state.write().elapsed_ms = now - started_at_mono - pause_elapsed_ms;
            inner.bus.publish(Message::TriggerScriptProgress {
                script_id: script_id.clone(),
                state: snapshot(&inner),
            });
            next_progress = now + progress_interval_ms as i64;
        }

        if now >= next_eval {
            evaluate_value_triggers(&inner, &script, &session_manager, &sequence_dispatch, clock.now()).await;
            next_eval = now + eval_interval_ms as i64;
        }

        for (index, trigger) in script.triggers.iter().enumerate() {
            let due = time_deadlines[index].is_some_and(|deadline| now >= deadline);
            if due {
                time_deadlines[index] = None;
                maybe_fire(&inner, trigger, index, &session_manager, &sequence_dispatch, clock.now()).await;
            }
        }
    }
}

async fn evaluate_value_triggers(
    inner: &Arc<Inner>,
    script: &TriggerScript,
    session_manager: &Arc<SessionManager>,
    sequence_dispatch: &Arc<dyn SequenceDispatch>,
    now: DateTime<Utc>,
) {
    for (index, trigger) in script.triggers.iter().enumerate() {
        let Condition::Value {
            device_id,
            parameter,
            operator,
            threshold,
        } = &trigger.condition
        else {
            continue;
        };

        let measured = session_manager
            .get_session(device_id)
            .and_then(|session| session.get_state().status)
            .and_then(|status| status.measurements.get(parameter).copied());
        let condition_met = measured.is_some_and(|m| operator.evaluate(m, *threshold));

        let rising_edge = {
            let mut state = inner.state.write();
            let runtime = &mut state.triggers[index];
            let edge = condition_met && !runtime.condition_met;
            runtime.previous_condition_met = runtime.condition_met;
            runtime.condition_met = condition_met;
            edge
        };

        if rising_edge {
            maybe_fire(inner, trigger, index, session_manager, sequence_dispatch, now).await;
        }
    }
}

/// Atomically fires one trigger, provided `shouldFire` (debounce + once/every
/// repeat mode) allows it (spec §4.4). A failed action dispatch reports
/// `triggerActionFailed` and leaves the engine running.
async fn maybe_fire(
    inner: &Arc<Inner>,
    trigger: &Trigger,
    index: usize,
    session_manager: &Arc<SessionManager>,
    sequence_dispatch: &Arc<dyn SequenceDispatch>,
    now: DateTime<Utc>,
) {
    let should = inner.state.read().triggers[index].should_fire(trigger.repeat_mode, trigger.debounce_ms, now);
    if !should {
        return;
    }

    let (script_id, trigger_state) = {
        let mut state = inner.state.write();
        let runtime = &mut state.triggers[index];
        runtime.fired_count += 1;
        runtime.last_fired_at = Some(now);
        (state.script_id.clone(), runtime.clone())
    };
    inner.bus.publish(Message::TriggerFired {
        script_id: script_id.clone(),
        trigger_id: trigger.id.clone(),
        trigger_state: serde_json::to_value(&trigger_state).unwrap_or(json!(null)),
    });

    if let Err(e) = dispatch_action(&trigger.action, session_manager, sequence_dispatch).await {
        inner.bus.publish(Message::TriggerActionFailed {
            script_id,
            trigger_id: trigger.id.clone(),
            action_type: trigger.action.type_name().to_string(),
            error: e.to_string(),
        });
    }
}

async fn dispatch_action(
    action: &Action,
    session_manager: &Arc<SessionManager>,
    sequence_dispatch: &Arc<dyn SequenceDispatch>,
) -> CoreResult<()> {
    match action {
        Action::SetValue {
            device_id,
            parameter,
            value,
        } => session_manager.set_value(device_id, parameter, *value, true).await,
        Action::SetOutput { device_id, enabled } => session_manager.set_output(device_id, *enabled).await,
        Action::SetMode { device_id, mode } => session_manager.set_mode(device_id, mode).await,
        Action::StartSequence {
            sequence_id,
            device_id,
            parameter,
            repeat_mode,
        } => {
            sequence_dispatch
                .run(sequence_id, device_id, parameter, *repeat_mode)
                .await
        }
        Action::StopSequence { sequence_id } => sequence_dispatch.abort(sequence_id).await,
        Action::PauseSequence { sequence_id } => sequence_dispatch.pause(sequence_id),
    }
}

fn do_stop(inner: &Arc<Inner>, script_id: &str) {
    inner.state.write().execution_state = EngineExecutionState::Idle;
    inner.bus.publish(Message::TriggerScriptStopped {
        script_id: script_id.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::device::types::{
        DeviceCapabilities, DeviceInfo, DeviceKind, DeviceStatus, MeasurementChannel, OutputChannel,
    };
    use crate::device::{MockDriver, SessionConfig};
    use crate::session_manager::SessionManager;
    use crate::trigger::types::{Operator, TriggerRepeat};
    use std::collections::HashMap;

    struct NoopDispatch;

    #[async_trait]
    impl SequenceDispatch for NoopDispatch {
        async fn run(
            &self,
            _sequence_id: &str,
            _device_id: &str,
            _parameter: &str,
            _repeat_mode: RepeatMode,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn abort(&self, _sequence_id: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            modes: vec!["CC".into()],
            mode_settable: true,
            outputs: vec![OutputChannel {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: 0.0,
                max: 10.0,
                modes: vec!["CC".into()],
            }],
            measurements: vec![MeasurementChannel {
                name: "voltage".into(),
                unit: "V".into(),
                decimals: 3,
            }],
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

    async fn manager_with_device(measured_voltage: f64) -> Arc<SessionManager> {
        let manager = Arc::new(SessionManager::new(
            Arc::new(SystemClock::new()),
            SessionConfig {
                poll_interval_ms: 10,
                history_window_ms: 60_000,
                max_consecutive_errors: 10,
                debounce_ms: 30,
            },
        ));
        let mut measurements = HashMap::new();
        measurements.insert("voltage".to_string(), measured_voltage);
        let driver = MockDriver::new(
            info(),
            capabilities(),
            DeviceStatus {
                mode: "CC".into(),
                output_enabled: false,
                setpoints: HashMap::new(),
                measurements,
                list_running: None,
            },
        );
        manager
            .sync_devices(vec![crate::discovery::DiscoveredDevice {
                info: info(),
                capabilities: capabilities(),
                driver: Box::new(driver),
            }])
            .await;
        // Let the freshly-spawned session complete at least one poll so
        // `status.measurements` is populated before the engine evaluates it.
        tokio::time::advance(Duration::from_millis(20)).await;
        manager
    }

    fn value_trigger() -> Trigger {
        Trigger {
            id: "trg-1".into(),
            condition: Condition::Value {
                device_id: "psu-1".into(),
                parameter: "voltage".into(),
                operator: Operator::Gt,
                threshold: 5.0,
            },
            action: Action::SetOutput {
                device_id: "psu-1".into(),
                enabled: false,
            },
            repeat_mode: TriggerRepeat::Every,
            debounce_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rising_edge_fires_exactly_once_per_crossing() {
        let manager = manager_with_device(10.0).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        let script = TriggerScript {
            id: "script-1".into(),
            triggers: vec![value_trigger()],
        };
        let engine = TriggerEngine::start(
            script,
            manager,
            Arc::new(NoopDispatch),
            Arc::new(SystemClock::new()),
            50,
            500,
        );

        let mut rx = engine.subscribe("client".into());
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let mut fired = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(&*msg, Message::TriggerFired { .. }) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(engine.get_state().triggers[0].fired_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unmet_condition_never_fires() {
        let manager = manager_with_device(1.0).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        let script = TriggerScript {
            id: "script-2".into(),
            triggers: vec![value_trigger()],
        };
        let engine = TriggerEngine::start(
            script,
            manager,
            Arc::new(NoopDispatch),
            Arc::new(SystemClock::new()),
            50,
            500,
        );
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(engine.get_state().triggers[0].fired_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_fires_once_at_its_deadline() {
        let manager = manager_with_device(1.0).await;
        let trigger = Trigger {
            id: "trg-time".into(),
            condition: Condition::Time {
                seconds_from_start: 0.1,
            },
            action: Action::SetOutput {
                device_id: "psu-1".into(),
                enabled: true,
            },
            repeat_mode: TriggerRepeat::Once,
            debounce_ms: 0,
        };
        let script = TriggerScript {
            id: "script-3".into(),
            triggers: vec![trigger],
        };
        let engine = TriggerEngine::start(
            script,
            manager,
            Arc::new(NoopDispatch),
            Arc::new(SystemClock::new()),
            50,
            500,
        );
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(engine.get_state().triggers[0].fired_count, 1);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(engine.get_state().triggers[0].fired_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let manager = manager_with_device(1.0).await;
        let script = TriggerScript {
            id: "script-4".into(),
            triggers: vec![value_trigger()],
        };
        let engine = TriggerEngine::start(
            script,
            manager,
            Arc::new(NoopDispatch),
            Arc::new(SystemClock::new()),
            50,
            500,
        );
        tokio::time::advance(Duration::from_millis(10)).await;
        engine.stop();
        tokio::time::advance(Duration::from_millis(10)).await;
        engine.stop();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(engine.get_state().execution_state, EngineExecutionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_sequence_action_reports_not_implemented_by_default() {
        assert!(NoopDispatch.pause("seq-1").is_err());
    }
}
