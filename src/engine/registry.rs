//! Registry of management sessions for the gateway and attached devices
//!
//! One entry per entity. An entry exists from registration (or first manage)
//! until unmanage; `managed` distinguishes a live management session from a
//! merely-registered entity. The lock is a plain mutex and is never held
//! across an await point.

use crate::protocol::{DeviceData, EntityKey, SupportedActions};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// State of one entity's management session.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagementSession {
    pub key: EntityKey,
    /// True once a manage request succeeded and until unmanage.
    pub managed: bool,
    /// When the server will consider the session dormant. `None` for
    /// sessions announced with an unlimited lifetime.
    pub dormancy_deadline: Option<DateTime<Utc>>,
    pub supports: SupportedActions,
    pub device_data: DeviceData,
    /// Whether server-initiated requests for this entity are routed to the
    /// global handlers.
    pub handlers_attached: bool,
}

impl ManagementSession {
    /// Seconds of lifetime left before the dormancy deadline, for announcing
    /// the session again after a reconnect. Unlimited sessions return 0
    /// (which is omitted from the wire payload).
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> u64 {
        match self.dormancy_deadline {
            Some(deadline) => (deadline - now).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

/// Thread-safe map of entity keys to management sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<EntityKey, ManagementSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful manage for `key`, creating or replacing the entry.
    /// A repeated manage refreshes the dormancy deadline and capability flags.
    pub fn upsert_managed(
        &self,
        key: EntityKey,
        supports: SupportedActions,
        device_data: DeviceData,
        lifetime_secs: u64,
        handlers_attached: bool,
    ) {
        let dormancy_deadline = if lifetime_secs > 0 {
            Some(Utc::now() + chrono::Duration::seconds(lifetime_secs as i64))
        } else {
            None
        };
        let session = ManagementSession {
            key: key.clone(),
            managed: true,
            dormancy_deadline,
            supports,
            device_data,
            handlers_attached,
        };
        self.sessions.lock().unwrap().insert(key, session);
    }

    /// Register an entity without starting a management session. Does not
    /// touch an existing entry.
    pub fn preregister(&self, key: EntityKey, device_data: DeviceData) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(key.clone()).or_insert(ManagementSession {
            key,
            managed: false,
            dormancy_deadline: None,
            supports: SupportedActions::default(),
            device_data,
            handlers_attached: false,
        });
    }

    /// Drop the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &EntityKey) -> bool {
        self.sessions.lock().unwrap().remove(key).is_some()
    }

    pub fn get(&self, key: &EntityKey) -> Option<ManagementSession> {
        self.sessions.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.sessions.lock().unwrap().contains_key(key)
    }

    /// Snapshot of all sessions with a live management session, for
    /// re-announcing them after a reconnect.
    pub fn managed_snapshot(&self) -> Vec<ManagementSession> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|session| session.managed)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn key(device_id: &str) -> EntityKey {
        EntityKey::new("thermostat", device_id)
    }

    #[test]
    fn test_upsert_and_get() {
        let registry = SessionRegistry::new();
        registry.upsert_managed(
            key("t-1"),
            SupportedActions::default(),
            DeviceData::default(),
            3600,
            true,
        );

        let session = registry.get(&key("t-1")).unwrap();
        assert!(session.managed);
        assert!(session.handlers_attached);
        assert!(session.dormancy_deadline.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_zero_lifetime_has_no_deadline() {
        let registry = SessionRegistry::new();
        registry.upsert_managed(
            key("t-1"),
            SupportedActions::default(),
            DeviceData::default(),
            0,
            false,
        );

        let session = registry.get(&key("t-1")).unwrap();
        assert!(session.dormancy_deadline.is_none());
        assert_eq!(session.remaining_lifetime(Utc::now()), 0);
    }

    #[test]
    fn test_remaining_lifetime_counts_down() {
        let now = Utc::now();
        let session = ManagementSession {
            key: key("t-1"),
            managed: true,
            dormancy_deadline: Some(now + ChronoDuration::seconds(3600)),
            supports: SupportedActions::default(),
            device_data: DeviceData::default(),
            handlers_attached: false,
        };

        assert_eq!(session.remaining_lifetime(now), 3600);
        assert_eq!(
            session.remaining_lifetime(now + ChronoDuration::seconds(3550)),
            50
        );
        // Past the deadline the remaining lifetime floors at zero
        assert_eq!(
            session.remaining_lifetime(now + ChronoDuration::seconds(7200)),
            0
        );
    }

    #[test]
    fn test_repeated_manage_refreshes_deadline() {
        let registry = SessionRegistry::new();
        registry.upsert_managed(
            key("t-1"),
            SupportedActions::default(),
            DeviceData::default(),
            60,
            false,
        );
        let first = registry.get(&key("t-1")).unwrap().dormancy_deadline.unwrap();

        registry.upsert_managed(
            key("t-1"),
            SupportedActions::default(),
            DeviceData::default(),
            7200,
            false,
        );
        let second = registry.get(&key("t-1")).unwrap().dormancy_deadline.unwrap();

        assert!(second > first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_preregister_does_not_clobber_managed_entry() {
        let registry = SessionRegistry::new();
        registry.upsert_managed(
            key("t-1"),
            SupportedActions {
                device_actions: true,
                firmware_actions: false,
            },
            DeviceData::default(),
            60,
            true,
        );

        registry.preregister(key("t-1"), DeviceData::default());

        let session = registry.get(&key("t-1")).unwrap();
        assert!(session.managed);
        assert!(session.supports.device_actions);
    }

    #[test]
    fn test_managed_snapshot_excludes_preregistered() {
        let registry = SessionRegistry::new();
        registry.preregister(key("t-1"), DeviceData::default());
        registry.upsert_managed(
            key("t-2"),
            SupportedActions::default(),
            DeviceData::default(),
            0,
            false,
        );

        let snapshot = registry.managed_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, key("t-2"));
    }

    #[test]
    fn test_remove() {
        let registry = SessionRegistry::new();
        registry.preregister(key("t-1"), DeviceData::default());

        assert!(registry.remove(&key("t-1")));
        assert!(!registry.remove(&key("t-1")));
        assert!(registry.is_empty());
    }
}
