//! Per-device data model, driver contract, and the live polled session
//! built from them (spec §3, §4.1, §6).

pub mod driver;
pub mod scpi_driver;
pub mod session;
pub mod types;

pub use driver::{DeviceDriver, Fault, MockDriver, ProbeError, Transport};
pub use scpi_driver::{mock_scpi_power_supply, MockTransport, ScpiPowerSupplyDriver};
pub use session::{DeviceSession, SessionConfig};
pub use types::{
    ConnectionStatus, DeviceCapabilities, DeviceInfo, DeviceKind, DeviceSessionState,
    DeviceStatus, History, ListModeDescriptor, MeasurementChannel, OutputChannel,
};
