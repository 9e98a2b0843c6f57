//! Data model for waveform sequences (spec §3 `SequenceDefinition` /
//! `SequenceRunConfig` / `SequenceState`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The engineering unit a sequence's values are expressed in. Must match the
/// target output's unit at run time (spec §6 "unit ∈ {V, A, W, Ω}").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Unit {
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "A")]
    Amp,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "Ω")]
    Ohm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParametricKind {
    Sine,
    Triangle,
    Ramp,
    Square,
}

/// One concrete emitted sample: a value and how long to hold it before the
/// next emission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SequenceStep {
    pub value: f64,
    pub dwell_ms: u64,
}

/// The closed sum of ways a sequence's points can be generated (spec §9
/// "discriminated unions").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Waveform {
    #[serde(rename = "parametric")]
    Parametric {
        r#type: ParametricKind,
        min: f64,
        max: f64,
        points_per_cycle: u32,
        interval_ms: u64,
    },
    #[serde(rename = "randomWalk")]
    RandomWalk {
        start_value: f64,
        min: f64,
        max: f64,
        max_step_size: f64,
        points_per_cycle: u32,
        interval_ms: u64,
    },
    #[serde(rename = "arbitrary")]
    Arbitrary { steps: Vec<SequenceStep> },
}

/// Per-run value transforms applied to every resolved step (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Modifiers {
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub min_clamp: Option<f64>,
    pub max_clamp: Option<f64>,
    pub pre_value: Option<f64>,
    pub post_value: Option<f64>,
    /// Recorded but not operationally enforced: the distilled scheduling
    /// algorithm (spec §4.3) never defines a slew-limiting step, only scale
    /// / offset / clamp.
    pub max_slew_rate: Option<f64>,
}

impl Modifiers {
    /// Multiply by `scale`, add `offset`, clamp to `[min_clamp, max_clamp]`
    /// independently on either side (spec §4.3 step 2).
    pub fn apply(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(scale) = self.scale {
            v *= scale;
        }
        if let Some(offset) = self.offset {
            v += offset;
        }
        if let Some(min_clamp) = self.min_clamp {
            v = v.max(min_clamp);
        }
        if let Some(max_clamp) = self.max_clamp {
            v = v.min(max_clamp);
        }
        v
    }

    /// Pre/post values (spec §4.3 "Pre/post values") only go through
    /// `scale`, `offset`, and `max_clamp` — `min_clamp` is deliberately
    /// excluded, unlike the per-step `apply`.
    pub fn apply_endpoint(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(scale) = self.scale {
            v *= scale;
        }
        if let Some(offset) = self.offset {
            v += offset;
        }
        if let Some(max_clamp) = self.max_clamp {
            v = v.min(max_clamp);
        }
        v
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceDefinition {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub unit: Unit,
    pub waveform: Waveform,
    #[serde(flatten)]
    pub modifiers: Modifiers,
}

/// How many times a run repeats (spec §3 "repeat mode ∈ {once, count N,
/// continuous}").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RepeatMode {
    Once,
    Count { n: u32 },
    Continuous,
}

impl RepeatMode {
    /// `None` for continuous (spec: "totalCycles (null for continuous)").
    pub fn total_cycles(&self) -> Option<u32> {
        match self {
            RepeatMode::Once => Some(1),
            RepeatMode::Count { n } => Some(*n),
            RepeatMode::Continuous => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceRunConfig {
    pub sequence_id: String,
    pub target_device_id: String,
    pub parameter: String,
    pub repeat_mode: RepeatMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

/// Live progress snapshot broadcast as `sequenceProgress`/`sequenceStarted`
/// and returned by `get_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceState {
    pub sequence_id: String,
    pub execution_state: ExecutionState,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub current_cycle: u32,
    pub total_cycles: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
    pub commanded_value: Option<f64>,
    pub error: Option<String>,
    /// Cumulative count of steps silently dropped under scheduler overload
    /// (spec §8 "skippedSteps grows"; logged, never broadcast per-drop —
    /// surfaced here instead so a client can observe it on the next
    /// progress message).
    pub skipped_steps: u64,
}

impl SequenceState {
    pub fn new(sequence_id: String, total_steps: usize, total_cycles: Option<u32>) -> Self {
        Self {
            sequence_id,
            execution_state: ExecutionState::Idle,
            current_step_index: 0,
            total_steps,
            current_cycle: 0,
            total_cycles,
            started_at: None,
            elapsed_ms: 0,
            commanded_value: None,
            error: None,
            skipped_steps: 0,
        }
    }
}
