// ── Service record store ──
//
// Canonical home of every Service and Group record. Records are swapped
// in whole, so `get` / `list` never observe a half-written value. Every
// successful write is published on the change bus.

use std::sync::Arc;

use super::collection::RecordCollection;
use crate::bus::{ChangeBus, ChangeKind, ChangeReason, ChangeSubscription, DEFAULT_EVENT_BUFFER};
use crate::error::CoreError;
use crate::model::{Group, GroupId, Service, ServiceId};
use crate::stream::RecordStream;

/// Thread-safe store for services and their groups.
///
/// Reads are wait-free `Arc` clones; writes take fine-grained per-shard
/// locks within `DashMap`. There is no store-wide lock.
pub struct ServiceStore {
    services: RecordCollection<ServiceId, Service>,
    groups: RecordCollection<GroupId, Group>,
    bus: ChangeBus,
}

impl ServiceStore {
    /// Create a store whose change bus buffers `event_buffer` events per
    /// subscriber.
    pub fn new(event_buffer: usize) -> Self {
        Self {
            services: RecordCollection::new(),
            groups: RecordCollection::new(),
            bus: ChangeBus::new(event_buffer),
        }
    }

    // ── Service reads ────────────────────────────────────────────────

    pub fn get(&self, id: &ServiceId) -> Option<Arc<Service>> {
        self.services.get(id)
    }

    /// Services of a group in the group's member order.
    ///
    /// Unknown groups yield an empty list.
    pub fn list(&self, group_id: &GroupId) -> Vec<Arc<Service>> {
        let Some(group) = self.groups.get(group_id) else {
            return Vec::new();
        };
        group
            .service_ids
            .iter()
            .filter_map(|id| self.services.get(id))
            .collect()
    }

    pub fn services_snapshot(&self) -> Arc<Vec<Arc<Service>>> {
        self.services.snapshot()
    }

    pub fn subscribe_services(&self) -> RecordStream<Service> {
        RecordStream::new(self.services.subscribe())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    // ── Service writes ───────────────────────────────────────────────

    /// Insert or replace a service record.
    ///
    /// The service's group must already exist; a new service is appended
    /// to the end of its group's member list.
    pub fn upsert(&self, service: Service) -> Result<Arc<Service>, CoreError> {
        let reason = if self.services.contains(&service.id) {
            ChangeReason::Updated
        } else {
            ChangeReason::Registered
        };
        self.upsert_with_reason(service, reason)
    }

    pub(crate) fn upsert_with_reason(
        &self,
        service: Service,
        reason: ChangeReason,
    ) -> Result<Arc<Service>, CoreError> {
        if !self.groups.contains(&service.group_id) {
            return Err(CoreError::GroupNotFound {
                id: service.group_id,
            });
        }

        let id = service.id.clone();
        let group_id = service.group_id.clone();
        let previous_group = self.services.get(&id).map(|s| s.group_id.clone());

        let (stored, _) = self.services.upsert(id.clone(), service);

        if let Some(old) = previous_group.filter(|old| *old != group_id) {
            self.groups.modify(&old, |g| g.without_member(&id));
        }
        self.groups.modify(&group_id, |g| g.with_member(&id));

        self.bus.publish(
            ChangeKind::ServiceUpdated {
                service: Arc::clone(&stored),
            },
            reason,
        );
        Ok(stored)
    }

    /// Remove a service record and detach it from its group.
    pub fn remove(&self, id: &ServiceId) -> Option<Arc<Service>> {
        let removed = self.services.remove(id)?;
        self.groups.modify(&removed.group_id, |g| g.without_member(id));
        self.bus.publish(
            ChangeKind::ServiceRemoved {
                id: id.clone(),
                group_id: removed.group_id.clone(),
            },
            ChangeReason::Removed,
        );
        Some(removed)
    }

    // ── Groups ───────────────────────────────────────────────────────

    /// Create a group. Member ids listed on `group` are ignored; members
    /// join as their services are upserted.
    pub fn insert_group(&self, group: Group) -> Result<Arc<Group>, CoreError> {
        if self.groups.contains(&group.id) {
            return Err(CoreError::DuplicateGroup { id: group.id });
        }
        let group = Group::new(group.id, group.name);
        let (stored, _) = self.groups.upsert(group.id.clone(), group);
        self.bus.publish(
            ChangeKind::GroupCreated {
                group: Arc::clone(&stored),
            },
            ChangeReason::Registered,
        );
        Ok(stored)
    }

    pub fn group(&self, id: &GroupId) -> Option<Arc<Group>> {
        self.groups.get(id)
    }

    /// All groups in creation order.
    pub fn groups(&self) -> Arc<Vec<Arc<Group>>> {
        self.groups.snapshot()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Remove a group together with any member records still present.
    pub fn remove_group(&self, id: &GroupId) -> Option<Arc<Group>> {
        let group = self.groups.get(id)?;
        for member in &group.service_ids {
            self.remove(member);
        }
        let removed = self.groups.remove(id)?;
        self.bus
            .publish(ChangeKind::GroupRemoved { id: id.clone() }, ChangeReason::Removed);
        Some(removed)
    }

    // ── Change notification ──────────────────────────────────────────

    pub fn subscribe(&self) -> ChangeSubscription {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }
}

impl Default for ServiceStore {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, ServiceState};

    fn store_with_group() -> ServiceStore {
        let store = ServiceStore::default();
        store.insert_group(Group::new("acme".into(), "Acme")).unwrap();
        store
    }

    fn svc(id: &str) -> Service {
        Service::new(id.into(), "acme".into(), id)
    }

    #[test]
    fn upsert_requires_known_group() {
        let store = ServiceStore::default();
        let err = store.upsert(svc("web")).unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound { .. }));
        assert!(store.get(&"web".into()).is_none());
    }

    #[test]
    fn list_follows_group_member_order() {
        let store = store_with_group();
        store.upsert(svc("b")).unwrap();
        store.upsert(svc("a")).unwrap();
        store.upsert(svc("c")).unwrap();

        let ids: Vec<String> = store
            .list(&"acme".into())
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert!(store.list(&"nope".into()).is_empty());
    }

    #[test]
    fn upsert_swaps_whole_record() {
        let store = store_with_group();
        let before = store.upsert(svc("web")).unwrap();
        let endpoint = Endpoint::new("127.0.0.1", 4000);
        store
            .upsert(svc("web").with_state(ServiceState::Connected { endpoint }))
            .unwrap();

        // The earlier Arc is untouched by the later write.
        assert!(!before.available());
        assert!(store.get(&"web".into()).unwrap().available());
        assert_eq!(store.group(&"acme".into()).unwrap().service_ids.len(), 1);
    }

    #[test]
    fn moving_a_service_between_groups_updates_membership() {
        let store = store_with_group();
        store.insert_group(Group::new("beta".into(), "Beta")).unwrap();
        store.upsert(svc("web")).unwrap();

        let mut moved = svc("web");
        moved.group_id = "beta".into();
        store.upsert(moved).unwrap();

        assert!(store.list(&"acme".into()).is_empty());
        assert_eq!(store.list(&"beta".into()).len(), 1);
    }

    #[tokio::test]
    async fn writes_publish_change_events() {
        let store = store_with_group();
        let mut sub = store.subscribe();

        store.upsert(svc("web")).unwrap();
        store.upsert(svc("web")).unwrap();
        store.remove(&"web".into()).unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.reason, ChangeReason::Registered);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.reason, ChangeReason::Updated);
        let third = sub.recv().await.unwrap();
        assert!(matches!(third.kind, ChangeKind::ServiceRemoved { .. }));
        assert!(first.sequence < second.sequence && second.sequence < third.sequence);
    }

    #[test]
    fn remove_is_a_no_op_for_unknown_ids() {
        let store = store_with_group();
        let mut sub = store.subscribe();
        assert!(store.remove(&"ghost".into()).is_none());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn remove_group_drops_members() {
        let store = store_with_group();
        store.upsert(svc("a")).unwrap();
        store.upsert(svc("b")).unwrap();

        let removed = store.remove_group(&"acme".into()).unwrap();
        assert_eq!(removed.id.as_str(), "acme");
        assert_eq!(store.service_count(), 0);
        assert_eq!(store.group_count(), 0);
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let store = store_with_group();
        let err = store.insert_group(Group::new("acme".into(), "Again")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateGroup { .. }));
    }

    #[test]
    fn services_snapshot_tracks_writes() {
        let store = store_with_group();
        let stream = store.subscribe_services();
        store.upsert(svc("a")).unwrap();
        assert!(stream.current().is_empty());
        assert_eq!(stream.latest().len(), 1);
        assert_eq!(store.services_snapshot().len(), 1);
    }
}
