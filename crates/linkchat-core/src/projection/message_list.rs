//! Message list reducer: deduplicated by uuid, ordered by timestamp

use std::sync::Arc;

use super::remove_where;
use crate::chain::Message;
use crate::events::ChatEvent;
use crate::identity::PubKey;

#[derive(Debug, Clone, Default)]
pub struct MessageList {
    messages: Arc<Vec<Message>>,
}

impl MessageList {
    pub fn messages(&self) -> &Arc<Vec<Message>> {
        &self.messages
    }

    pub fn contains(&self, message: &Message) -> bool {
        self.messages.iter().any(|m| m.uuid == message.uuid)
    }

    /// Messages exchanged with one counterpart, oldest first.
    pub fn for_conversation<'a>(
        &'a self,
        me: &'a PubKey,
        converse_pub: &'a PubKey,
    ) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages
            .iter()
            .filter(move |m| &m.target(me) == converse_pub)
    }

    /// Newest message of a conversation.
    pub fn latest<'a>(&'a self, me: &'a PubKey, converse_pub: &'a PubKey) -> Option<&'a Message> {
        self.for_conversation(me, converse_pub).last()
    }

    /// A new list with `message` in timestamp order, or `None` if it is
    /// already present.
    pub fn insert(&self, message: &Message) -> Option<Self> {
        if self.contains(message) {
            return None;
        }
        let index = self
            .messages
            .partition_point(|m| (m.timestamp, m.uuid) <= (message.timestamp, message.uuid));
        let mut messages = (*self.messages).clone();
        messages.insert(index, message.clone());
        Some(Self {
            messages: Arc::new(messages),
        })
    }

    pub fn reduce(&self, me: &PubKey, event: &ChatEvent) -> Self {
        match event {
            ChatEvent::MessageAppend(message) => self.insert(message).unwrap_or_else(|| self.clone()),
            ChatEvent::MessageExpire {
                converse_pub,
                up_to,
            } => Self {
                messages: remove_where(&self.messages, |m| {
                    m.timestamp <= *up_to && &m.target(me) == converse_pub
                }),
            },
            ChatEvent::ConversationDelete(converse_pub) => Self {
                messages: remove_where(&self.messages, |m| &m.target(me) == converse_pub),
            },
            _ => self.clone(),
        }
    }
}
