//! The discovery contract (spec §6): an external scanner enumerates USB and
//! serial devices, matches each against a registry of driver factories, and
//! hands the already-probed driver to `SessionManager::sync_devices`.
//!
//! Everything here is interface-only — the concrete scanner, the USB/serial
//! enumeration, and the vendor-id registry are out of scope for the core
//! (spec §1 "Out of scope").

use crate::device::{DeviceCapabilities, DeviceDriver, DeviceInfo};
use async_trait::async_trait;

/// One already-probed device handed to the session layer by a scanner.
pub struct DiscoveredDevice {
    pub info: DeviceInfo,
    pub capabilities: DeviceCapabilities,
    pub driver: Box<dyn DeviceDriver>,
}

/// A source of currently-discovered devices. `SessionManager::sync_devices`
/// reconciles its session map against one snapshot from this contract.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<DiscoveredDevice>>;
}
