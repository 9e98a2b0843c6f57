//! Pure waveform resolution and validation (spec §4.3 "pre-run resolution",
//! §6 "waveform limits"). Deliberately free of async/IO so it can be
//! unit-tested without a runtime.

use super::types::{ParametricKind, SequenceStep, Unit, Waveform};
use crate::error::{CoreError, CoreResult};
use rand::Rng;
use std::f64::consts::PI;

pub const MIN_INTERVAL_MS: u64 = 10;
pub const MAX_INTERVAL_MS: u64 = 3_600_000;
pub const MIN_POINTS_PER_CYCLE: u32 = 2;
pub const MAX_POINTS_PER_CYCLE: u32 = 10_000;
pub const MAX_ARBITRARY_STEPS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 100;

/// Resolves a `Waveform` to concrete steps (spec §4.3 step 1). For a
/// `RandomWalk`, `continuation` supplies the last emitted value when a new
/// cycle continues an existing walk; `None` falls back to `start_value`.
pub fn resolve_steps(
    waveform: &Waveform,
    continuation: Option<f64>,
    rng: &mut impl Rng,
) -> CoreResult<Vec<SequenceStep>> {
    match waveform {
        Waveform::Arbitrary { steps } => Ok(steps.clone()),
        Waveform::Parametric {
            r#type,
            min,
            max,
            points_per_cycle,
            interval_ms,
        } => Ok(resolve_parametric(*r#type, *min, *max, *points_per_cycle, *interval_ms)),
        Waveform::RandomWalk {
            start_value,
            min,
            max,
            max_step_size,
            points_per_cycle,
            interval_ms,
        } => Ok(resolve_random_walk(
            continuation.unwrap_or(*start_value),
            *min,
            *max,
            *max_step_size,
            *points_per_cycle,
            *interval_ms,
            rng,
        )),
    }
}

fn resolve_parametric(
    kind: ParametricKind,
    min: f64,
    max: f64,
    n: u32,
    interval_ms: u64,
) -> Vec<SequenceStep> {
    let n = n as usize;
    match kind {
        ParametricKind::Sine => {
            let center = (min + max) / 2.0;
            let amplitude = (max - min) / 2.0;
            (1..=n)
                .map(|i| SequenceStep {
                    value: center + amplitude * (2.0 * PI * i as f64 / n as f64).sin(),
                    dwell_ms: interval_ms,
                })
                .collect()
        }
        ParametricKind::Triangle => {
            let half = n / 2;
            (1..=n)
                .map(|i| {
                    let value = if i <= half {
                        min + (max - min) * (i as f64 / half.max(1) as f64)
                    } else {
                        let j = i - half;
                        let remaining = n - half;
                        max - (max - min) * (j as f64 / remaining.max(1) as f64)
                    };
                    SequenceStep {
                        value,
                        dwell_ms: interval_ms,
                    }
                })
                .collect()
        }
        ParametricKind::Ramp => (0..n)
            .map(|i| SequenceStep {
                value: min + (max - min) * (i as f64 / (n - 1).max(1) as f64),
                dwell_ms: interval_ms,
            })
            .collect(),
        ParametricKind::Square => {
            let high_count = n / 2;
            (0..n)
                .map(|i| SequenceStep {
                    value: if i < high_count { max } else { min },
                    dwell_ms: interval_ms,
                })
                .collect()
        }
    }
}

fn resolve_random_walk(
    start: f64,
    min: f64,
    max: f64,
    max_step_size: f64,
    n: u32,
    interval_ms: u64,
    rng: &mut impl Rng,
) -> Vec<SequenceStep> {
    let mut current = start.clamp(min, max);
    (0..n)
        .map(|_| {
            let noise = rng.gen_range(-max_step_size..=max_step_size);
            current = (current + noise).clamp(min, max);
            SequenceStep {
                value: current,
                dwell_ms: interval_ms,
            }
        })
        .collect()
}

/// Validates a waveform definition's limits (spec §6 "Waveform limits",
/// §8 "pointsPerCycle = 2 / intervalMs = 10 must succeed; = 1 / = 9 must
/// fail").
pub fn validate_waveform(waveform: &Waveform) -> CoreResult<()> {
    match waveform {
        Waveform::Arbitrary { steps } => {
            if steps.is_empty() || steps.len() > MAX_ARBITRARY_STEPS {
                return Err(CoreError::BadWaveform(format!(
                    "arbitrary waveform must have 1..={MAX_ARBITRARY_STEPS} steps, got {}",
                    steps.len()
                )));
            }
            for step in steps {
                if !step.value.is_finite() {
                    return Err(CoreError::BadWaveform("step value must be finite".into()));
                }
            }
            Ok(())
        }
        Waveform::Parametric {
            min,
            max,
            points_per_cycle,
            interval_ms,
            ..
        } => validate_common(*min, *max, *points_per_cycle, *interval_ms),
        Waveform::RandomWalk {
            start_value,
            min,
            max,
            max_step_size,
            points_per_cycle,
            interval_ms,
        } => {
            validate_common(*min, *max, *points_per_cycle, *interval_ms)?;
            if !start_value.is_finite() || !max_step_size.is_finite() || *max_step_size < 0.0 {
                return Err(CoreError::BadWaveform(
                    "randomWalk startValue/maxStepSize must be finite, maxStepSize >= 0".into(),
                ));
            }
            Ok(())
        }
    }
}

fn validate_common(min: f64, max: f64, points_per_cycle: u32, interval_ms: u64) -> CoreResult<()> {
    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        return Err(CoreError::BadWaveform(format!(
            "intervalMs must be in [{MIN_INTERVAL_MS}, {MAX_INTERVAL_MS}], got {interval_ms}"
        )));
    }
    if !(MIN_POINTS_PER_CYCLE..=MAX_POINTS_PER_CYCLE).contains(&points_per_cycle) {
        return Err(CoreError::BadWaveform(format!(
            "pointsPerCycle must be in [{MIN_POINTS_PER_CYCLE}, {MAX_POINTS_PER_CYCLE}], got {points_per_cycle}"
        )));
    }
    if !min.is_finite() || !max.is_finite() {
        return Err(CoreError::BadWaveform("min/max must be finite".into()));
    }
    if min >= max {
        return Err(CoreError::BadWaveform(format!(
            "min ({min}) must be < max ({max})"
        )));
    }
    Ok(())
}

/// Unit-tag equality check for the sequence/output unit-match rule (spec
/// §4.3 step 3).
pub fn unit_matches(unit: Unit, output_unit: &str) -> bool {
    let expected = match unit {
        Unit::Volt => "V",
        Unit::Amp => "A",
        Unit::Watt => "W",
        Unit::Ohm => "Ω",
    };
    expected == output_unit
}

pub fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::BadWaveform(format!(
            "name must be 1..={MAX_NAME_LEN} chars"
        )));
    }
    Ok(())
}
