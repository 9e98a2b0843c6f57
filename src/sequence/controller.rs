//! `SequenceController` (spec §4.3): drift-free arbitrary-waveform playback
//! against one session's output parameter.
//!
//! Modeled as a single task owning all scheduling state locally — the
//! "closure of state" design note in spec §9 — communicating with the
//! public handle only through a command channel (pause/resume/abort) and a
//! `parking_lot::RwLock` snapshot for non-blocking reads.

use super::types::{
    ExecutionState, Modifiers, SequenceDefinition, SequenceRunConfig, SequenceState, SequenceStep,
    Waveform,
};
use super::waveform::{self, unit_matches, validate_waveform};
use crate::broadcast::{Bus, ClientId, Message};
use crate::clock::Clock;
use crate::device::DeviceSession;
use crate::error::{CoreError, CoreResult};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

enum Command {
    Pause,
    Resume,
    Abort,
}

struct Inner {
    state: parking_lot::RwLock<SequenceState>,
    bus: Bus,
    commands: mpsc::UnboundedSender<Command>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one sequence run. Created per run, reaches a terminal state,
/// then discarded (spec §3 "Lifecycles") — the caller drops it once
/// `get_state().execution_state` is `Completed`/`Error`, or after `abort`.
#[derive(Clone)]
pub struct SequenceController {
    inner: Arc<Inner>,
}

impl SequenceController {
    /// Validates the definition against the target session, resolves the
    /// initial cycle, and spawns the run. Returns immediately; the run
    /// itself proceeds on its own task.
    #[instrument(skip(definition, session, clock))]
    pub fn start(
        definition: SequenceDefinition,
        run_config: SequenceRunConfig,
        session: DeviceSession,
        clock: Arc<dyn Clock>,
        min_interval_ms: u64,
    ) -> CoreResult<Self> {
        validate_waveform(&definition.waveform)?;

        let output_unit = session
            .get_state()
            .capabilities
            .output_unit(&run_config.parameter)
            .ok_or_else(|| CoreError::ParameterNotFound(run_config.parameter.clone()))?
            .to_string();
        if !unit_matches(definition.unit, &output_unit) {
            return Err(CoreError::UnitMismatch {
                expected: output_unit,
                actual: format!("{:?}", definition.unit),
            });
        }

        let total_cycles = run_config.repeat_mode.total_cycles();
        let state = parking_lot::RwLock::new(SequenceState::new(
            run_config.sequence_id.clone(),
            0,
            total_cycles,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state,
            bus: Bus::new(),
            commands: tx,
            task: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(run_actor(
            inner.clone(),
            session,
            run_config.parameter.clone(),
            clock,
            min_interval_ms,
            definition.waveform,
            definition.modifiers,
            total_cycles,
            rx,
        ));
        *inner.task.lock() = Some(handle);

        Ok(Self { inner })
    }

    pub fn get_state(&self) -> SequenceState {
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

    /// Idempotent after a terminal state: once the run task has exited, the
    /// command channel is closed and this becomes a no-op.
    pub fn abort(&self) {
        let _ = self.inner.commands.send(Command::Abort);
    }
}

fn apply_modifiers_to_steps(steps: &[SequenceStep], modifiers: &Modifiers) -> Vec<SequenceStep> {
    steps
        .iter()
        .map(|s| SequenceStep {
            value: modifiers.apply(s.value),
            dwell_ms: s.dwell_ms,
        })
        .collect()
}

fn step_spacing(step: &SequenceStep, min_interval_ms: u64) -> i64 {
    step.dwell_ms.max(min_interval_ms) as i64
}

/// `schedule[0] = t_first`, `schedule[k] = schedule[k-1] + max(dwell, min)`.
fn build_schedule(t_first: i64, steps: &[SequenceStep], min_interval_ms: u64) -> Vec<i64> {
    let mut schedule = Vec::with_capacity(steps.len());
    let mut t = t_first;
    for (i, step) in steps.iter().enumerate() {
        schedule.push(t);
        if i + 1 < steps.len() {
            t += step_spacing(step, min_interval_ms);
        }
    }
    schedule
}

fn cycle_end(schedule: &[i64], steps: &[SequenceStep], min_interval_ms: u64) -> i64 {
    let last_index = steps.len() - 1;
    schedule[last_index] + step_spacing(&steps[last_index], min_interval_ms)
}

fn snapshot(inner: &Inner) -> serde_json::Value {
    serde_json::to_value(inner.state.read().clone()).unwrap_or(json!(null))
}

#[allow(clippy::too_many_arguments)]
async fn run_actor(
    inner: Arc<Inner>,
    session: DeviceSession,
    parameter: String,
    clock: Arc<dyn Clock>,
    min_interval_ms: u64,
    waveform_def: Waveform,
    modifiers: Modifiers,
    total_cycles: Option<u32>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let sequence_id = inner.state.read().sequence_id.clone();
    let mut rng = rand::thread_rng();

    let mut last_random_walk_value: Option<f64>;
    let mut steps = match waveform::resolve_steps(&waveform_def, None, &mut rng) {
        Ok(s) => {
            last_random_walk_value = s.last().map(|s| s.value);
            apply_modifiers_to_steps(&s, &modifiers)
        }
        Err(e) => {
            fail(&inner, &sequence_id, e.to_string());
            return;
        }
    };

    if let Some(pre) = modifiers.pre_value {
        let _ = session
            .set_value(&parameter, modifiers.apply_endpoint(pre), true)
            .await;
    }

    let started_at_mono = clock.monotonic_ms();
    {
        let mut s = inner.state.write();
        s.execution_state = ExecutionState::Running;
        s.started_at = Some(clock.now());
        s.total_steps = steps.len();
    }
    inner.bus.publish(Message::SequenceStarted {
        sequence_id: sequence_id.clone(),
        state: snapshot(&inner),
    });

    let mut schedule = build_schedule(started_at_mono, &steps, min_interval_ms);
    let mut cycle_end_time = cycle_end(&schedule, &steps, min_interval_ms);
    let mut pause_elapsed_ms: i64 = 0;
    let mut current_cycle: u32 = 0;
    let mut current_index: usize = 0;

    'run: loop {
        let now = clock.monotonic_ms();
        let delay_ms = (schedule[current_index] - now).max(0) as u64;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            cmd = commands.recv() => {
                match cmd {
                    None | Some(Command::Abort) => {
                        do_abort(&inner, &session, &parameter, &modifiers, &sequence_id).await;
                        return;
                    }
                    Some(Command::Pause) => {
                        let paused_at = clock.monotonic_ms();
                        {
                            let mut s = inner.state.write();
                            s.execution_state = ExecutionState::Paused;
                        }
                        loop {
                            match commands.recv().await {
                                Some(Command::Resume) => {
                                    let paused_duration = clock.monotonic_ms() - paused_at;
                                    pause_elapsed_ms += paused_duration;
                                    for t in schedule.iter_mut() {
                                        *t += paused_duration;
                                    }
                                    cycle_end_time += paused_duration;
                                    // Spec §4.3: resume arms a timer with a
                                    // minimum delay of minIntervalMs, never
                                    // fires the pending step immediately.
                                    let floor = clock.monotonic_ms() + min_interval_ms as i64;
                                    if schedule[current_index] < floor {
                                        schedule[current_index] = floor;
                                    }
                                    inner.state.write().execution_state = ExecutionState::Running;
                                    break;
                                }
                                None | Some(Command::Abort) => {
                                    do_abort(&inner, &session, &parameter, &modifiers, &sequence_id).await;
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

        let commanded = steps[current_index].value;
        if let Err(e) = session.set_value(&parameter, commanded, true).await {
            let mut s = inner.state.write();
            s.execution_state = ExecutionState::Error;
            s.error = Some(e.to_string());
            drop(s);
            inner.bus.publish(Message::SequenceError {
                sequence_id: sequence_id.clone(),
                error: e.to_string(),
            });
            return;
        }

        {
            let mut s = inner.state.write();
            s.current_step_index = current_index;
            s.commanded_value = Some(commanded);
            s.elapsed_ms = clock.monotonic_ms() - started_at_mono - pause_elapsed_ms;
        }
        inner.bus.publish(Message::SequenceProgress {
            sequence_id: sequence_id.clone(),
            state: snapshot(&inner),
        });

        current_index += 1;
        if current_index >= steps.len() {
            current_index = 0;
            current_cycle += 1;
            inner.state.write().current_cycle = current_cycle;

            if let Some(total) = total_cycles {
                if current_cycle >= total {
                    if let Some(post) = modifiers.post_value {
                        let _ = session
                            .set_value(&parameter, modifiers.apply_endpoint(post), true)
                            .await;
                    }
                    inner.state.write().execution_state = ExecutionState::Completed;
                    inner.bus.publish(Message::SequenceCompleted {
                        sequence_id: sequence_id.clone(),
                    });
                    return;
                }
            }

            steps = match waveform::resolve_steps(&waveform_def, last_random_walk_value, &mut rng) {
                Ok(s) => {
                    last_random_walk_value = s.last().map(|s| s.value);
                    apply_modifiers_to_steps(&s, &modifiers)
                }
                Err(e) => {
                    fail(&inner, &sequence_id, e.to_string());
                    return;
                }
            };
            schedule = build_schedule(cycle_end_time, &steps, min_interval_ms);
            cycle_end_time = cycle_end(&schedule, &steps, min_interval_ms);
        }

        // Choose the next delay; drop intermediate frames under overload,
        // but never the last step of the (possibly just-rebuilt) cycle.
        let now = clock.monotonic_ms();
        let mut skipped = 0u64;
        while current_index + 1 < schedule.len() && schedule[current_index + 1] <= now {
            current_index += 1;
            skipped += 1;
        }
        if skipped > 0 {
            debug!(sequence_id = %sequence_id, skipped, "dropped sequence steps under scheduler overload");
            inner.state.write().skipped_steps += skipped;
        }
    }
}

fn fail(inner: &Arc<Inner>, sequence_id: &str, error: String) {
    let mut s = inner.state.write();
    s.execution_state = ExecutionState::Error;
    s.error = Some(error.clone());
    drop(s);
    inner.bus.publish(Message::SequenceError {
        sequence_id: sequence_id.to_string(),
        error,
    });
}

async fn do_abort(
    inner: &Arc<Inner>,
    session: &DeviceSession,
    parameter: &str,
    modifiers: &Modifiers,
    sequence_id: &str,
) {
    let was_active = matches!(
        inner.state.read().execution_state,
        ExecutionState::Running | ExecutionState::Paused
    );
    if was_active {
        if let Some(post) = modifiers.post_value {
            let _ = session
                .set_value(parameter, modifiers.apply_endpoint(post), true)
                .await;
        }
    }
    inner.state.write().execution_state = ExecutionState::Idle;
    inner.bus.publish(Message::SequenceAborted {
        sequence_id: sequence_id.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::device::types::{
        DeviceCapabilities, DeviceInfo, DeviceKind, DeviceSessionState, DeviceStatus, OutputChannel,
    };
    use crate::device::{MockDriver, SessionConfig};
    use crate::sequence::types::{ParametricKind, RepeatMode, Unit};
    use chrono::Utc;
    use std::collections::HashMap;

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
            measurements: vec![],
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

    fn session() -> DeviceSession {
        let state = DeviceSessionState::new(info(), capabilities());
        let driver = MockDriver::new(
            info(),
            capabilities(),
            DeviceStatus {
                mode: "CC".into(),
                output_enabled: false,
                setpoints: HashMap::new(),
                measurements: HashMap::new(),
                list_running: None,
            },
        );
        DeviceSession::new(
            state,
            Box::new(driver),
            Arc::new(SystemClock::new()),
            SessionConfig {
                poll_interval_ms: 1_000_000,
                history_window_ms: 60_000,
                max_consecutive_errors: 10,
                debounce_ms: 30,
            },
        )
    }

    fn definition(waveform: Waveform) -> SequenceDefinition {
        SequenceDefinition {
            id: "seq-1".into(),
            name: "test".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            unit: Unit::Amp,
            waveform,
            modifiers: Modifiers::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sine_sequence_runs_fixed_number_of_cycles_without_drift() {
        let waveform = Waveform::Parametric {
            r#type: ParametricKind::Sine,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 4,
            interval_ms: 100,
        };
        let run_config = SequenceRunConfig {
            sequence_id: "seq-1".into(),
            target_device_id: "psu-1".into(),
            parameter: "current".into(),
            repeat_mode: RepeatMode::Count { n: 3 },
        };
        let controller = SequenceController::start(
            definition(waveform),
            run_config,
            session(),
            Arc::new(SystemClock::new()),
            50,
        )
        .unwrap();

        let mut rx = controller.subscribe("client".into());
        tokio::time::advance(Duration::from_millis(1_300)).await;

        let state = controller.get_state();
        assert_eq!(state.execution_state, ExecutionState::Completed);
        assert_eq!(state.current_cycle, 3);

        let mut completed = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(&*msg, Message::SequenceCompleted { .. }) {
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_before_any_progress_is_idempotent() {
        let waveform = Waveform::Parametric {
            r#type: ParametricKind::Ramp,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 5,
            interval_ms: 100,
        };
        let run_config = SequenceRunConfig {
            sequence_id: "seq-2".into(),
            target_device_id: "psu-1".into(),
            parameter: "current".into(),
            repeat_mode: RepeatMode::Continuous,
        };
        let controller = SequenceController::start(
            definition(waveform),
            run_config,
            session(),
            Arc::new(SystemClock::new()),
            50,
        )
        .unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        controller.abort();
        tokio::time::advance(Duration::from_millis(10)).await;
        controller.abort();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(controller.get_state().execution_state, ExecutionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_mismatch_is_rejected_before_any_run() {
        let waveform = Waveform::Parametric {
            r#type: ParametricKind::Ramp,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 5,
            interval_ms: 100,
        };
        let mut def = definition(waveform);
        def.unit = Unit::Volt;
        let run_config = SequenceRunConfig {
            sequence_id: "seq-3".into(),
            target_device_id: "psu-1".into(),
            parameter: "current".into(),
            repeat_mode: RepeatMode::Once,
        };
        let err = SequenceController::start(
            def,
            run_config,
            session(),
            Arc::new(SystemClock::new()),
            50,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnitMismatch { .. }));
    }
}
