// ── Group domain type ──

use serde::{Deserialize, Serialize};

use super::id::{GroupId, ServiceId};

/// Services sharing one tunnel / connection context, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub service_ids: Vec<ServiceId>,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            service_ids: Vec::new(),
        }
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.service_ids.contains(id)
    }

    /// Copy with `id` appended, or `None` if it is already a member.
    pub(crate) fn with_member(&self, id: &ServiceId) -> Option<Self> {
        if self.contains(id) {
            return None;
        }
        let mut next = self.clone();
        next.service_ids.push(id.clone());
        Some(next)
    }

    /// Copy with `id` removed, or `None` if it was not a member.
    pub(crate) fn without_member(&self, id: &ServiceId) -> Option<Self> {
        if !self.contains(id) {
            return None;
        }
        let mut next = self.clone();
        next.service_ids.retain(|member| member != id);
        Some(next)
    }
}
