//! Conversation list reducer, keyed by counterpart public key
//!
//! Also tracks the selected conversation and per-target errors of request
//! and send operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{clear_error, remove_where, set_error, upsert_by};
use crate::conversation::Conversation;
use crate::events::ChatEvent;
use crate::identity::PubKey;

#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    initialized: bool,
    conversations: Arc<Vec<Conversation>>,
    selected: Option<PubKey>,
    errors: Arc<BTreeMap<PubKey, String>>,
}

impl ConversationList {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn conversations(&self) -> &Arc<Vec<Conversation>> {
        &self.conversations
    }

    pub fn selected(&self) -> Option<&PubKey> {
        self.selected.as_ref()
    }

    pub fn errors(&self) -> &Arc<BTreeMap<PubKey, String>> {
        &self.errors
    }

    pub fn find(&self, converse_pub: &PubKey) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| &c.converse_pub == converse_pub)
    }

    pub fn reduce(&self, event: &ChatEvent) -> Self {
        let mut next = self.clone();
        match event {
            ChatEvent::ConversationInit => next.initialized = true,
            ChatEvent::ConversationAppend(conversation) => {
                next.conversations = upsert_by(&self.conversations, conversation.clone(), |c| {
                    c.converse_pub.clone()
                });
                next.errors = clear_error(&self.errors, &conversation.converse_pub);
            }
            ChatEvent::ConversationDelete(converse_pub) => {
                next.conversations =
                    remove_where(&self.conversations, |c| &c.converse_pub == converse_pub);
                if self.selected.as_ref() == Some(converse_pub) {
                    next.selected = None;
                }
            }
            ChatEvent::ConversationSelect { converse_pub, .. } => {
                next.selected = Some(converse_pub.clone());
            }
            ChatEvent::SendRequestError { pub_key, error } => {
                next.errors = set_error(&self.errors, pub_key, error);
            }
            ChatEvent::SendTextError {
                converse_pub,
                error,
            } => {
                next.errors = set_error(&self.errors, converse_pub, error);
            }
            ChatEvent::ClearRequestError(pub_key) => {
                next.errors = clear_error(&self.errors, pub_key);
            }
            _ => {}
        }
        next
    }
}
