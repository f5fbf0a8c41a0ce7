//! Pending invites, deduplicated by message uuid

use std::sync::Arc;

use super::{remove_where, upsert_by};
use crate::chain::Message;
use crate::events::ChatEvent;

#[derive(Debug, Clone, Default)]
pub struct RequestList {
    requests: Arc<Vec<Message>>,
}

impl RequestList {
    pub fn requests(&self) -> &Arc<Vec<Message>> {
        &self.requests
    }

    pub fn find(&self, uuid: &ulid::Ulid) -> Option<&Message> {
        self.requests.iter().find(|m| &m.uuid == uuid)
    }

    pub fn reduce(&self, event: &ChatEvent) -> Self {
        let requests = match event {
            ChatEvent::RequestAppend(message) => {
                upsert_by(&self.requests, message.clone(), |m| m.uuid)
            }
            ChatEvent::RequestAccept(uuid)
            | ChatEvent::RequestDecline(uuid)
            | ChatEvent::RequestRemoved(uuid) => remove_where(&self.requests, |m| &m.uuid == uuid),
            _ => return self.clone(),
        };
        Self { requests }
    }
}
