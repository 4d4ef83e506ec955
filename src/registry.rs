//! Connection registry - what the transport provider currently reports
//!
//! In-memory map from device id to connection state and real identity.
//! Only the session manager mutates it; everything else reads snapshots.

use crate::identity::{DeviceId, Identity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Per-device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    AwaitingScan,
    Authenticated,
    Ready,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Initializing => "initializing",
            ConnectionState::AwaitingScan => "awaiting_scan",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Registry entry for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub device_id: DeviceId,
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    pub updated_at: DateTime<Utc>,
}

/// Device id -> connection state and identity
#[derive(Default)]
pub struct ConnectionRegistry {
    data: RwLock<HashMap<DeviceId, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the state of a device, keeping a known identity
    pub(crate) fn set_state(&self, device_id: &DeviceId, state: ConnectionState) {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        let identity = data.get(device_id).and_then(|e| e.identity.clone());
        data.insert(
            device_id.clone(),
            RegistryEntry {
                device_id: device_id.clone(),
                state,
                identity,
                updated_at: Utc::now(),
            },
        );
    }

    /// Mark a device ready under its real identity
    pub(crate) fn mark_ready(&self, device_id: &DeviceId, identity: Identity) {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        data.insert(
            device_id.clone(),
            RegistryEntry {
                device_id: device_id.clone(),
                state: ConnectionState::Ready,
                identity: Some(identity),
                updated_at: Utc::now(),
            },
        );
    }

    /// Remove a device
    pub(crate) fn remove(&self, device_id: &DeviceId) -> Option<RegistryEntry> {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        data.remove(device_id)
    }

    /// Get entry by device id
    pub fn get(&self, device_id: &DeviceId) -> Option<RegistryEntry> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.get(device_id).cloned()
    }

    /// Real identity of a ready device
    pub fn identity_of(&self, device_id: &DeviceId) -> Option<Identity> {
        self.get(device_id)
            .filter(|e| e.state == ConnectionState::Ready)
            .and_then(|e| e.identity)
    }

    /// Device currently ready under `identity` (reverse lookup)
    pub fn device_for(&self, identity: &Identity) -> Option<DeviceId> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.values()
            .find(|e| e.state == ConnectionState::Ready && e.identity.as_ref() == Some(identity))
            .map(|e| e.device_id.clone())
    }

    /// Whether `identity` is ready on any device
    pub fn is_ready(&self, identity: &Identity) -> bool {
        self.device_for(identity).is_some()
    }

    /// Identities of all ready devices
    pub fn ready_identities(&self) -> Vec<Identity> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.values()
            .filter(|e| e.state == ConnectionState::Ready)
            .filter_map(|e| e.identity.clone())
            .collect()
    }

    /// Ready devices and their identities
    pub fn ready_devices(&self) -> Vec<(DeviceId, Identity)> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.values()
            .filter(|e| e.state == ConnectionState::Ready)
            .filter_map(|e| e.identity.clone().map(|id| (e.device_id.clone(), id)))
            .collect()
    }

    /// Snapshot of every entry, ordered by device id
    pub fn all(&self) -> Vec<RegistryEntry> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<_> = data.values().cloned().collect();
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        entries
    }

    /// Get number of registered devices
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
