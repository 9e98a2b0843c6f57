//! Custom error types for the core library.
//!
//! This module defines the primary error type, `CoreError`, using `thiserror`
//! for a centralized, consistent way to represent everything that can go
//! wrong inside a `DeviceSession`, `SessionManager`, `SequenceController`, or
//! `TriggerEngine`.
//!
//! ## Error Hierarchy
//!
//! - **`SessionNotFound`/`DeviceNotFound`**: an action was routed to a device
//!   id the `SessionManager` does not know about.
//! - **`UnitMismatch`**: a `SequenceDefinition`'s unit does not match the
//!   target output's unit at run time.
//! - **`ParameterNotFound`**: an action or condition named a measurement or
//!   output that is not in the device's capabilities.
//! - **`SequenceNotFound`**: a run/abort referenced an unknown sequence id.
//! - **`LibraryFull`**: a persistence layer (external) rejected a new entry;
//!   kept here because sequence/trigger validation can surface it early.
//! - **`BadWaveform`**: a waveform failed validation (limits in spec §6).
//! - **`Driver`**: a passthrough for errors raised by the `DeviceDriver`
//!   trait (poll failures, write failures, probe failures).
//! - **`Transport`**: a passthrough for errors raised by the `Transport`
//!   trait underneath a driver.
//!
//! By using `#[from]`, `CoreError` can be created from underlying error types
//! with `?`, matching the rest of this crate's error-propagation style.

use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("session not found for device '{0}'")]
    SessionNotFound(String),

    #[error("device not found: '{0}'")]
    DeviceNotFound(String),

    #[error("unit mismatch: sequence expects '{expected}', target output is '{actual}'")]
    UnitMismatch { expected: String, actual: String },

    #[error("parameter '{0}' not found in device capabilities")]
    ParameterNotFound(String),

    #[error("sequence not found: '{0}'")]
    SequenceNotFound(String),

    #[error("library is full")]
    LibraryFull,

    #[error("invalid waveform: {0}")]
    BadWaveform(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("action not implemented: {0}")]
    NotImplemented(String),
}

impl CoreError {
    /// True if the underlying driver/transport string carries one of the
    /// fatal markers from spec §4.1 that should short-circuit a session
    /// straight to `Disconnected` regardless of the consecutive-error count.
    pub fn is_fatal_transport_marker(message: &str) -> bool {
        const FATAL_MARKERS: [&str; 5] = [
            "LIBUSB_ERROR_NO_DEVICE",
            "LIBUSB_ERROR_IO",
            "LIBUSB_ERROR_PIPE",
            "SERIAL_PORT_DISCONNECTED",
            "SERIAL_PORT_ERROR",
        ];
        FATAL_MARKERS.iter().any(|marker| message.contains(marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::DeviceNotFound("psu-1".into());
        assert_eq!(err.to_string(), "device not found: 'psu-1'");
    }

    #[test]
    fn test_fatal_marker_detection() {
        assert!(CoreError::is_fatal_transport_marker(
            "read failed: LIBUSB_ERROR_NO_DEVICE"
        ));
        assert!(CoreError::is_fatal_transport_marker(
            "SERIAL_PORT_DISCONNECTED while reading"
        ));
        assert!(!CoreError::is_fatal_transport_marker("timeout waiting for reply"));
    }
}
