//! Device registry: the active set (confirmed devices) and the pending set
//! (announced but not yet confirmed).
//!
//! A device id lives in at most one of the two sets. Pending entries age out
//! through [`DeviceRegistry::sweep_stale`]; active entries stay for the life of
//! the process. The registry itself is a plain owned structure. The gateway
//! wraps it in a mutex and fires listeners from the returned
//! [`RegistryChange`] after the lock is released.

use log::{debug, info};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// One remote end-device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    /// Key used for commands addressed to this device, if it negotiated one.
    pub secret_key: Option<String>,
    /// Free-form, device-specific status token (e.g. LED state).
    pub status: String,
    /// Most recent `DATA:` payload.
    pub last_data: Option<String>,
    pub last_seen: Instant,
}

impl Device {
    fn new(id: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            secret_key: None,
            status: String::new(),
            last_data: None,
            last_seen: now,
        }
    }
}

/// Which listener groups a mutation should notify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub registry: bool,
    pub pending: bool,
}

impl RegistryChange {
    pub const NONE: RegistryChange = RegistryChange {
        registry: false,
        pending: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.registry && !self.pending
    }

    pub fn merge(self, other: RegistryChange) -> RegistryChange {
        RegistryChange {
            registry: self.registry || other.registry,
            pending: self.pending || other.pending,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    active: BTreeMap<String, Device>,
    pending: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.active.get(id).or_else(|| self.pending.get(id))
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn active_devices(&self) -> Vec<Device> {
        self.active.values().cloned().collect()
    }

    pub fn pending_devices(&self) -> Vec<Device> {
        self.pending.values().cloned().collect()
    }

    /// Key to use for an outbound command to `id`, if the device stored one.
    pub fn secret_key_for(&self, id: &str) -> Option<String> {
        self.get(id).and_then(|d| d.secret_key.clone())
    }

    /// Insert into the active set, pulling the entry out of pending if present.
    /// Idempotent.
    pub fn register_active(&mut self, id: &str, now: Instant) -> RegistryChange {
        if self.active.contains_key(id) {
            return RegistryChange::NONE;
        }
        let was_pending = self.pending.remove(id);
        let pending = was_pending.is_some();
        let mut device = was_pending.unwrap_or_else(|| Device::new(id, now));
        device.last_seen = now;
        self.active.insert(id.to_string(), device);
        info!(
            "Device {} is now active{}",
            id,
            if pending { " (promoted from pending)" } else { "" }
        );
        RegistryChange {
            registry: true,
            pending,
        }
    }

    /// First sighting of an unknown id puts it in pending. Repeated
    /// announcements from a pending device do not refresh its staleness clock.
    pub fn record_discovery(&mut self, id: &str, now: Instant) -> RegistryChange {
        if self.active.contains_key(id) || self.pending.contains_key(id) {
            return RegistryChange::NONE;
        }
        self.pending.insert(id.to_string(), Device::new(id, now));
        info!("Discovered device {} (pending)", id);
        RegistryChange {
            registry: true,
            pending: true,
        }
    }

    /// Confirm a device from a qualifying frame. Unknown ids go straight to active.
    pub fn promote(&mut self, id: &str, now: Instant) -> RegistryChange {
        if let Some(device) = self.active.get_mut(id) {
            device.last_seen = now;
            return RegistryChange::NONE;
        }
        self.register_active(id, now)
    }

    /// Confirm a device the gateway has already heard of; a completely unknown
    /// id is only recorded as a discovery.
    pub fn promote_known(&mut self, id: &str, now: Instant) -> RegistryChange {
        if self.active.contains_key(id) || self.pending.contains_key(id) {
            self.promote(id, now)
        } else {
            self.record_discovery(id, now)
        }
    }

    /// Set the status token on a known device; an unknown id is treated as a
    /// discovery event instead.
    pub fn apply_status(&mut self, id: &str, status: &str, now: Instant) -> RegistryChange {
        match self.get_mut(id) {
            Some(device) => {
                if device.status == status {
                    return RegistryChange::NONE;
                }
                debug!("Device {} status '{}' -> '{}'", id, device.status, status);
                device.status = status.to_string();
                RegistryChange {
                    registry: true,
                    pending: false,
                }
            }
            None => self.record_discovery(id, now),
        }
    }

    /// Store a data payload; the caller is expected to have promoted the device.
    pub fn record_data(&mut self, id: &str, payload: &str) -> bool {
        match self.get_mut(id) {
            Some(device) => {
                device.last_data = Some(payload.to_string());
                true
            }
            None => false,
        }
    }

    /// Forget collected state after the device reports it reset its counters.
    pub fn reset_data(&mut self, id: &str) -> RegistryChange {
        match self.get_mut(id) {
            Some(device) => {
                device.status.clear();
                device.last_data = None;
                RegistryChange {
                    registry: true,
                    pending: false,
                }
            }
            None => RegistryChange::NONE,
        }
    }

    pub fn set_secret_key(&mut self, id: &str, key: &str) -> bool {
        match self.get_mut(id) {
            Some(device) => {
                device.secret_key = Some(key.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove every pending device unseen for longer than `threshold`.
    pub fn sweep_stale(&mut self, now: Instant, threshold: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .pending
            .values()
            .filter(|d| now.saturating_duration_since(d.last_seen) > threshold)
            .map(|d| d.id.clone())
            .collect();
        for id in &stale {
            self.pending.remove(id);
        }
        if !stale.is_empty() {
            info!("Evicted {} stale pending device(s): {}", stale.len(), stale.join(","));
        }
        stale
    }

    /// Drop a single pending entry that has outlived `threshold`, so the frame
    /// about to be routed for it starts from scratch. Returns whether it was
    /// removed.
    pub fn expire_stale(&mut self, id: &str, now: Instant, threshold: Duration) -> bool {
        let stale = self
            .pending
            .get(id)
            .is_some_and(|d| now.saturating_duration_since(d.last_seen) > threshold);
        if stale {
            self.pending.remove(id);
            info!("Evicted stale pending device {} ahead of its next frame", id);
        }
        stale
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        match self.active.get_mut(id) {
            Some(device) => Some(device),
            None => self.pending.get_mut(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(reg: &DeviceRegistry) {
        for id in reg.active_ids() {
            assert!(!reg.is_pending(&id), "{} in both sets", id);
        }
    }

    #[test]
    fn discovery_then_promotion_moves_between_sets() {
        let t0 = Instant::now();
        let mut reg = DeviceRegistry::new();
        let change = reg.record_discovery("D1", t0);
        assert_eq!(change, RegistryChange { registry: true, pending: true });
        assert!(reg.is_pending("D1"));

        let change = reg.promote("D1", t0 + Duration::from_secs(1));
        assert_eq!(change, RegistryChange { registry: true, pending: true });
        assert!(reg.is_active("D1"));
        assert!(!reg.is_pending("D1"));
        assert_disjoint(&reg);

        // discovery of an active device is ignored
        assert!(reg.record_discovery("D1", t0).is_empty());
        assert_disjoint(&reg);
    }

    #[test]
    fn register_active_is_idempotent() {
        let t0 = Instant::now();
        let mut reg = DeviceRegistry::new();
        assert!(!reg.register_active("D1", t0).is_empty());
        let before = reg.active_devices();
        assert!(reg.register_active("D1", t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(reg.active_devices(), before);
    }

    #[test]
    fn repeated_discovery_does_not_refresh_clock() {
        let t0 = Instant::now();
        let mut reg = DeviceRegistry::new();
        reg.record_discovery("D1", t0);
        assert!(reg.record_discovery("D1", t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(reg.get("D1").map(|d| d.last_seen), Some(t0));
    }

    #[test]
    fn sweep_evicts_only_stale_pending() {
        let t0 = Instant::now();
        let threshold = Duration::from_secs(15);
        let mut reg = DeviceRegistry::new();
        reg.record_discovery("old", t0);
        reg.record_discovery("new", t0 + Duration::from_secs(10));
        reg.register_active("act", t0);

        // exactly at the threshold is not yet stale
        assert!(reg.sweep_stale(t0 + threshold, threshold).is_empty());

        let removed = reg.sweep_stale(t0 + Duration::from_secs(16), threshold);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(reg.is_pending("new"));
        assert!(reg.is_active("act"));

        let removed = reg.sweep_stale(t0 + Duration::from_secs(3600), threshold);
        assert_eq!(removed, vec!["new".to_string()]);
        assert!(reg.is_active("act"));
        assert!(reg.get("old").is_none());
    }

    #[test]
    fn expire_stale_only_drops_overdue_pending_entries() {
        let t0 = Instant::now();
        let threshold = Duration::from_secs(15);
        let mut reg = DeviceRegistry::new();
        reg.record_discovery("P", t0);
        reg.register_active("A", t0);

        assert!(!reg.expire_stale("P", t0 + threshold, threshold));
        assert!(reg.is_pending("P"));
        assert!(!reg.expire_stale("A", t0 + Duration::from_secs(60), threshold));
        assert!(reg.is_active("A"));
        assert!(!reg.expire_stale("nobody", t0, threshold));

        assert!(reg.expire_stale("P", t0 + Duration::from_secs(16), threshold));
        assert!(reg.get("P").is_none());
        // a fresh announcement now starts a new staleness window
        let later = t0 + Duration::from_secs(16);
        assert!(!reg.record_discovery("P", later).is_empty());
        assert_eq!(reg.get("P").map(|d| d.last_seen), Some(later));
    }

    #[test]
    fn status_on_unknown_device_is_a_discovery() {
        let t0 = Instant::now();
        let mut reg = DeviceRegistry::new();
        let change = reg.apply_status("D2", "1", t0);
        assert!(change.pending);
        assert!(reg.is_pending("D2"));

        reg.promote("D2", t0);
        let change = reg.apply_status("D2", "1", t0);
        assert_eq!(change, RegistryChange { registry: true, pending: false });
        assert_eq!(reg.get("D2").map(|d| d.status.as_str()), Some("1"));
        assert!(reg.apply_status("D2", "1", t0).is_empty());
    }

    #[test]
    fn promote_known_leaves_strangers_pending() {
        let t0 = Instant::now();
        let mut reg = DeviceRegistry::new();
        reg.promote_known("D3", t0);
        assert!(reg.is_pending("D3"));
        reg.promote_known("D3", t0);
        assert!(reg.is_active("D3"));
    }

    #[test]
    fn key_and_data_follow_the_device() {
        let t0 = Instant::now();
        let mut reg = DeviceRegistry::new();
        reg.record_discovery("D4", t0);
        assert!(reg.set_secret_key("D4", "k9"));
        reg.promote("D4", t0);
        assert_eq!(reg.secret_key_for("D4").as_deref(), Some("k9"));

        assert!(reg.record_data("D4", "temp:20"));
        reg.apply_status("D4", "1", t0);
        assert!(reg.reset_data("D4").registry);
        let dev = reg.get("D4").cloned().unwrap();
        assert_eq!(dev.last_data, None);
        assert!(dev.status.is_empty());
        assert!(!reg.set_secret_key("nobody", "k"));
    }
}
