//! `SessionManager` (spec §4.2): lifecycle owner of the session set,
//! re-attach on rediscovery, and the action/subscription facade every
//! external caller (scanner, WebSocket handler, TriggerEngine) goes through.

use crate::broadcast::Message;
use crate::clock::Clock;
use crate::device::{ConnectionStatus, DeviceInfo, DeviceKind, DeviceSession, DeviceSessionState, SessionConfig};
use crate::discovery::{DiscoveredDevice, Discovery};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

/// A listing row for a device, cheap to produce and to serialize wholesale
/// to a newly-connected UI client.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct DeviceSummary {
    pub id: String,
    pub kind: DeviceKind,
    pub info: DeviceInfo,
    pub connection_status: ConnectionStatus,
}

/// Owner of the set of `DeviceSession`s. Sessions are never removed: a
/// subsequently-missing device simply stays `disconnected` (spec §4.2).
pub struct SessionManager {
    sessions: parking_lot::Mutex<HashMap<String, DeviceSession>>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    scan_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            clock,
            config,
            scan_task: parking_lot::Mutex::new(None),
        }
    }

    /// Reconciles against one snapshot from a `Discovery` source: attaches a
    /// fresh driver to an existing session via `reconnect`, or creates and
    /// registers a new session for a device id seen for the first time.
    #[instrument(skip(self, discovered))]
    pub async fn sync_devices(&self, discovered: Vec<DiscoveredDevice>) {
        for device in discovered {
            let existing = self.sessions.lock().get(&device.info.id).cloned();
            match existing {
                Some(session) => {
                    session.reconnect(device.driver).await;
                }
                None => {
                    let id = device.info.id.clone();
                    let state = DeviceSessionState::new(device.info, device.capabilities);
                    let session = DeviceSession::new(
                        state,
                        device.driver,
                        self.clock.clone(),
                        self.config,
                    );
                    info!(device_id = %id, "new device session created");
                    self.sessions.lock().insert(id, session);
                }
            }
        }
    }

    /// Spawns a background task that calls `sync_devices` on a fixed
    /// cadence (spec §4.2 "optionally... runs on a fixed interval"). A
    /// `scan_interval_ms` of zero disables this (spec §6 config table).
    pub fn start_scanning(self: &Arc<Self>, discovery: Arc<dyn Discovery>, scan_interval_ms: u64) {
        if scan_interval_ms == 0 {
            return;
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(scan_interval_ms));
            loop {
                interval.tick().await;
                match discovery.discover().await {
                    Ok(devices) => manager.sync_devices(devices).await,
                    Err(e) => tracing::warn!(error = %e, "device discovery scan failed"),
                }
            }
        });
        *self.scan_task.lock() = Some(handle);
    }

    pub fn stop_scanning(&self) {
        if let Some(handle) = self.scan_task.lock().take() {
            handle.abort();
        }
    }

    pub fn get_session(&self, id: &str) -> Option<DeviceSession> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn is_session_disconnected(&self, id: &str) -> CoreResult<bool> {
        self.get_session(id)
            .map(|s| s.connection_status() == ConnectionStatus::Disconnected)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub fn get_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn get_device_summaries(&self) -> Vec<DeviceSummary> {
        self.sessions
            .lock()
            .values()
            .map(|session| {
                let state = session.get_state();
                DeviceSummary {
                    id: state.info.id.clone(),
                    kind: state.info.kind,
                    info: state.info,
                    connection_status: state.connection_status,
                }
            })
            .collect()
    }

    fn session_or_not_found(&self, device_id: &str) -> CoreResult<DeviceSession> {
        self.get_session(device_id)
            .ok_or_else(|| CoreError::SessionNotFound(device_id.to_string()))
    }

    pub async fn set_mode(&self, device_id: &str, mode: &str) -> CoreResult<()> {
        self.session_or_not_found(device_id)?.set_mode(mode).await
    }

    pub async fn set_output(&self, device_id: &str, enabled: bool) -> CoreResult<()> {
        self.session_or_not_found(device_id)?
            .set_output(enabled)
            .await
    }

    pub async fn set_value(
        &self,
        device_id: &str,
        name: &str,
        value: f64,
        immediate: bool,
    ) -> CoreResult<()> {
        self.session_or_not_found(device_id)?
            .set_value(name, value, immediate)
            .await
    }

    pub fn subscribe(
        &self,
        device_id: &str,
        client_id: String,
    ) -> CoreResult<mpsc::Receiver<Arc<Message>>> {
        Ok(self.session_or_not_found(device_id)?.subscribe(client_id))
    }

    pub fn unsubscribe(&self, device_id: &str, client_id: &str) -> CoreResult<()> {
        self.session_or_not_found(device_id)?.unsubscribe(client_id);
        Ok(())
    }

    /// Walks every session, critical for client-disconnect cleanup (spec
    /// §4.2).
    pub fn unsubscribe_all(&self, client_id: &str) {
        for session in self.sessions.lock().values() {
            session.unsubscribe(client_id);
        }
    }
}
