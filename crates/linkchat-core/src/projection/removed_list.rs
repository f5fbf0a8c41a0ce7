//! Removed-set mirror: uuids of deleted conversations and handled invites

use std::collections::BTreeSet;
use std::sync::Arc;
use ulid::Ulid;

use crate::events::ChatEvent;

#[derive(Debug, Clone, Default)]
pub struct RemovedList {
    uuids: Arc<BTreeSet<Ulid>>,
}

impl RemovedList {
    pub fn uuids(&self) -> &Arc<BTreeSet<Ulid>> {
        &self.uuids
    }

    pub fn contains(&self, uuid: &Ulid) -> bool {
        self.uuids.contains(uuid)
    }

    pub fn reduce(&self, event: &ChatEvent) -> Self {
        match event {
            ChatEvent::RequestRemoved(uuid)
            | ChatEvent::RequestAccept(uuid)
            | ChatEvent::RequestDecline(uuid)
                if !self.uuids.contains(uuid) =>
            {
                let mut uuids = (*self.uuids).clone();
                uuids.insert(*uuid);
                Self {
                    uuids: Arc::new(uuids),
                }
            }
            _ => self.clone(),
        }
    }
}
