//! Core library for the `rust_bench` laboratory instrument controller.
//!
//! This crate holds the four tightly coupled subsystems described in the
//! project's design document: a per-device polling session
//! ([`device::DeviceSession`]), the session set's lifecycle owner
//! ([`session_manager::SessionManager`]), a drift-free waveform player
//! ([`sequence::SequenceController`]), and a reactive condition/action
//! engine ([`trigger::TriggerEngine`]). A typed pub/sub bus
//! ([`broadcast::Bus`]) fans state deltas and engine progress out to any
//! number of subscribers.
//!
//! The instrument transport and per-model SCPI driver are out of scope:
//! this crate defines their contracts as the [`device::Transport`] and
//! [`device::DeviceDriver`] traits and ships a [`device::MockDriver`] that
//! satisfies them for tests and the demonstration binary. Likewise the
//! REST/WebSocket surface, persistent library storage, and UI are external;
//! this crate defines only the wire-level [`broadcast::Message`] types such
//! a layer would serialize.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod sequence;
pub mod session_manager;
pub mod trigger;

pub use broadcast::{Bus, ClientId, FieldName, Message};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use session_manager::{DeviceSummary, SessionManager};
