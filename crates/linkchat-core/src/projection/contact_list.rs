//! Contact list reducer, keyed by identity public key

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{clear_error, remove_where, set_error, upsert_by};
use crate::contact::Contact;
use crate::events::ChatEvent;
use crate::identity::PubKey;

#[derive(Debug, Clone, Default)]
pub struct ContactList {
    initialized: bool,
    contacts: Arc<Vec<Contact>>,
    errors: Arc<BTreeMap<PubKey, String>>,
}

impl ContactList {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn contacts(&self) -> &Arc<Vec<Contact>> {
        &self.contacts
    }

    pub fn errors(&self) -> &Arc<BTreeMap<PubKey, String>> {
        &self.errors
    }

    pub fn find(&self, pub_key: &PubKey) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.pub_key == pub_key)
    }

    pub fn reduce(&self, event: &ChatEvent) -> Self {
        let mut next = self.clone();
        match event {
            ChatEvent::ContactInit => next.initialized = true,
            ChatEvent::ContactAppend(contact) => {
                next.contacts = upsert_by(&self.contacts, contact.clone(), |c| c.pub_key.clone());
                next.errors = clear_error(&self.errors, &contact.pub_key);
            }
            ChatEvent::ContactDelete(pub_key) => {
                next.contacts = remove_where(&self.contacts, |c| &c.pub_key == pub_key);
            }
            ChatEvent::ContactAppendError { pub_key, error } => {
                next.errors = set_error(&self.errors, pub_key, error);
            }
            ChatEvent::ContactClearError(pub_key) => {
                next.errors = clear_error(&self.errors, pub_key);
            }
            _ => {}
        }
        next
    }
}
