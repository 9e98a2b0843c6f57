//! Data model for trigger scripts (spec §3 `TriggerScript`/`Trigger`).

use crate::sequence::RepeatMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn evaluate(self, measured: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => measured > threshold,
            Operator::Lt => measured < threshold,
            Operator::Ge => measured >= threshold,
            Operator::Le => measured <= threshold,
            Operator::Eq => measured == threshold,
            Operator::Ne => measured != threshold,
        }
    }
}

/// The closed sum of condition kinds (spec §3, §9 "discriminated unions").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Condition {
    #[serde(rename = "value")]
    Value {
        device_id: String,
        parameter: String,
        operator: Operator,
        threshold: f64,
    },
    #[serde(rename = "time")]
    Time { seconds_from_start: f64 },
}

/// The closed sum of trigger action kinds (spec §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "setValue")]
    SetValue {
        device_id: String,
        parameter: String,
        value: f64,
    },
    #[serde(rename = "setOutput")]
    SetOutput { device_id: String, enabled: bool },
    #[serde(rename = "setMode")]
    SetMode { device_id: String, mode: String },
    #[serde(rename = "startSequence")]
    StartSequence {
        sequence_id: String,
        device_id: String,
        parameter: String,
        repeat_mode: RepeatMode,
    },
    #[serde(rename = "stopSequence")]
    StopSequence { sequence_id: String },
    /// Declared but optional (spec §9 open question (a)): dispatch always
    /// reports `triggerActionFailed` unless the `SequenceDispatch`
    /// implementation opts in.
    #[serde(rename = "pauseSequence")]
    PauseSequence { sequence_id: String },
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SetValue { .. } => "setValue",
            Action::SetOutput { .. } => "setOutput",
            Action::SetMode { .. } => "setMode",
            Action::StartSequence { .. } => "startSequence",
            Action::StopSequence { .. } => "stopSequence",
            Action::PauseSequence { .. } => "pauseSequence",
        }
    }
}

/// How often a trigger may fire once its condition is met (spec §3 "a
/// repeatMode ∈ {once, every}" — distinct from a sequence's repeat mode).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerRepeat {
    Once,
    Every,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: String,
    pub condition: Condition,
    pub action: Action,
    pub repeat_mode: TriggerRepeat,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerScript {
    pub id: String,
    pub triggers: Vec<Trigger>,
}

/// Per-trigger runtime bookkeeping (spec §4.4 "TriggerRuntimeState").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriggerRuntimeState {
    pub fired_count: u32,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub condition_met: bool,
    pub previous_condition_met: bool,
}

impl TriggerRuntimeState {
    /// False if `debounceMs > 0 && now − lastFiredAt < debounceMs`, or
    /// `repeatMode == once && firedCount > 0` (spec §4.4 `shouldFire`).
    pub fn should_fire(&self, repeat_mode: TriggerRepeat, debounce_ms: u64, now: DateTime<Utc>) -> bool {
        if debounce_ms > 0 {
            if let Some(last) = self.last_fired_at {
                if (now - last).num_milliseconds() < debounce_ms as i64 {
                    return false;
                }
            }
        }
        if repeat_mode == TriggerRepeat::Once && self.fired_count > 0 {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineExecutionState {
    Idle,
    Running,
    Paused,
}

/// Snapshot broadcast as `triggerScriptProgress` and returned by
/// `get_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineState {
    pub script_id: String,
    pub execution_state: EngineExecutionState,
    pub triggers: Vec<TriggerRuntimeState>,
    pub elapsed_ms: i64,
}
