//! Drift-free arbitrary-waveform sequence playback (spec §4.3).

pub mod controller;
pub mod types;
pub mod waveform;

pub use controller::SequenceController;
pub use types::{
    ExecutionState, Modifiers, ParametricKind, RepeatMode, SequenceDefinition, SequenceRunConfig,
    SequenceState, SequenceStep, Unit, Waveform,
};
