//! List projection reducers
//!
//! Each list folds [`ChatEvent`]s into new state without mutating the old
//! one. Collections sit behind `Arc`s: an event that changes nothing returns
//! the very same `Arc`, so consumers can short-circuit on `Arc::ptr_eq`.
//!
//! [`Projection`] owns one of each list and decides which derived effects an
//! event raises (timestamp advancement, notifications).

mod contact_list;
mod conversation_list;
mod message_list;
mod removed_list;
mod request_list;

pub use contact_list::ContactList;
pub use conversation_list::ConversationList;
pub use message_list::MessageList;
pub use removed_list::RemovedList;
pub use request_list::RequestList;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chain::Message;
use crate::events::{ChatEvent, Effect, Notification};
use crate::identity::PubKey;

/// Insert or replace by natural key, keeping arrival order.
pub(crate) fn upsert_by<T, K, F>(list: &Arc<Vec<T>>, item: T, key: F) -> Arc<Vec<T>>
where
    T: Clone + PartialEq,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let wanted = key(&item);
    match list.iter().position(|existing| key(existing) == wanted) {
        Some(index) if list[index] == item => Arc::clone(list),
        Some(index) => {
            let mut next = (**list).clone();
            next[index] = item;
            Arc::new(next)
        }
        None => {
            let mut next = (**list).clone();
            next.push(item);
            Arc::new(next)
        }
    }
}

/// Drop every entry matching `pred`; the same `Arc` when none does.
pub(crate) fn remove_where<T, F>(list: &Arc<Vec<T>>, pred: F) -> Arc<Vec<T>>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    if !list.iter().any(&pred) {
        return Arc::clone(list);
    }
    Arc::new(list.iter().filter(|item| !pred(*item)).cloned().collect())
}

pub(crate) fn set_error(
    errors: &Arc<BTreeMap<PubKey, String>>,
    key: &PubKey,
    error: &str,
) -> Arc<BTreeMap<PubKey, String>> {
    if errors.get(key).map(String::as_str) == Some(error) {
        return Arc::clone(errors);
    }
    let mut next = (**errors).clone();
    next.insert(key.clone(), error.to_string());
    Arc::new(next)
}

pub(crate) fn clear_error(
    errors: &Arc<BTreeMap<PubKey, String>>,
    key: &PubKey,
) -> Arc<BTreeMap<PubKey, String>> {
    if !errors.contains_key(key) {
        return Arc::clone(errors);
    }
    let mut next = (**errors).clone();
    next.remove(key);
    Arc::new(next)
}

/// All lists of one client plus the classification of inbound messages.
#[derive(Debug, Clone)]
pub struct Projection {
    me: PubKey,
    pub contacts: ContactList,
    pub conversations: ConversationList,
    pub removed: RemovedList,
    pub requests: RequestList,
    pub messages: MessageList,
}

impl Projection {
    pub fn new(me: PubKey) -> Self {
        Self {
            me,
            contacts: ContactList::default(),
            conversations: ConversationList::default(),
            removed: RemovedList::default(),
            requests: RequestList::default(),
            messages: MessageList::default(),
        }
    }

    pub fn me(&self) -> &PubKey {
        &self.me
    }

    /// Fold one event into every list and return the effects it raises.
    pub fn apply(&mut self, event: &ChatEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            ChatEvent::MessageAppend(message) => {
                let Some(messages) = self.messages.insert(message) else {
                    // Already seen: no effects for re-deliveries
                    return effects;
                };
                self.messages = messages;
                effects.extend(self.classify(message));
            }
            ChatEvent::ConversationSelect {
                converse_pub,
                timestamp: Some(timestamp),
            } => {
                if let Some(conversation) = self.conversations.find(converse_pub) {
                    if *timestamp > conversation.last_timestamp {
                        effects.push(Effect::AdvanceTimestamp {
                            uuid: conversation.uuid,
                            timestamp: *timestamp,
                        });
                    }
                }
            }
            ChatEvent::RequestAppend(message) if self.removed.contains(&message.uuid) => {
                return effects;
            }
            _ => {}
        }

        self.contacts = self.contacts.reduce(event);
        self.conversations = self.conversations.reduce(event);
        self.removed = self.removed.reduce(event);
        self.requests = self.requests.reduce(event);
        self.messages = self.messages.reduce(&self.me, event);
        effects
    }

    fn classify(&self, message: &Message) -> Option<Effect> {
        let target = message.target(&self.me);
        let conversation = self.conversations.find(&target)?;
        if message.timestamp <= conversation.last_timestamp {
            return None;
        }
        if self.conversations.selected() == Some(&target) {
            return Some(Effect::AdvanceTimestamp {
                uuid: conversation.uuid,
                timestamp: message.timestamp,
            });
        }
        self.contacts.find(&message.from_pub)?;
        Some(Effect::Notify(Notification {
            converse_pub: target,
            from_pub: message.from_pub.clone(),
            message_uuid: message.uuid,
            timestamp: message.timestamp,
            preview: message.content().map(|c| c.body().to_string()),
        }))
    }

    /// Messages of a conversation newer than its `last_timestamp`.
    pub fn unread_count(&self, converse_pub: &PubKey) -> usize {
        let Some(conversation) = self.conversations.find(converse_pub) else {
            return 0;
        };
        self.messages
            .for_conversation(&self.me, converse_pub)
            .filter(|m| m.timestamp > conversation.last_timestamp)
            .count()
    }
}
