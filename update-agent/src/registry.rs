use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::debug;
use wallet_update_agent_core::DeviceId;

/// Tracks which devices have an update session in progress.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<DeviceId>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashSet<DeviceId>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `device`. Returns `None` if another session already holds it.
    pub fn try_acquire(&self, device: &DeviceId) -> Option<DeviceLease> {
        if !self.active().insert(device.clone()) {
            return None;
        }
        debug!("device `{device}` acquired");
        Some(DeviceLease {
            device: device.clone(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self, device: &DeviceId) -> bool {
        self.active().contains(device)
    }
}

/// Releases the device when dropped.
#[derive(Debug)]
pub struct DeviceLease {
    device: DeviceId,
    active: Arc<Mutex<HashSet<DeviceId>>>,
}

impl DeviceLease {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.device);
        debug!("device `{}` released", self.device);
    }
}
