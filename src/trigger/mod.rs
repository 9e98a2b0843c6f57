//! Reactive condition evaluator and action dispatcher (spec §4.4).

pub mod engine;
pub mod types;

pub use engine::{SequenceDispatch, TriggerEngine};
pub use types::{
    Action, Condition, EngineExecutionState, EngineState, Operator, Trigger, TriggerRepeat,
    TriggerRuntimeState, TriggerScript,
};
