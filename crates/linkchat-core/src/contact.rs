//! Identity & contact registry
//!
//! Contacts are minimal sealed projections of a public profile, stored under
//! `~{me}/contacts` with a locally stable uuid. Display names are followed
//! live from each contact's profile node, so renames propagate without
//! resolving the whole profile again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

use crate::chain::Consumer;
use crate::crypto;
use crate::error::{ChatError, ChatResult};
use crate::identity::{read_profile, EncPubKey, Keypair, PubKey};
use crate::store::{listen, paths, GraphStore, Query, StorePath};
use crate::subscription::Subscription;

const CONTACT_PREFIX: &str = "contact-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub uuid: Ulid,
    pub pub_key: PubKey,
    pub epub: EncPubKey,
    pub alias: String,
    pub name: Option<String>,
}

/// What [`ContactRegistry::get_contact`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactChange {
    /// A record was written, re-delivered, or its live name changed
    Stored(Contact),
    Deleted {
        uuid: Ulid,
        pub_key: Option<PubKey>,
    },
}

#[derive(Default)]
struct ContactState {
    /// Public key -> stable uuid
    uuids: HashMap<PubKey, Ulid>,
    /// Latest stored record per contact
    known: HashMap<PubKey, Contact>,
    /// Latest name seen on each contact's profile
    live_names: HashMap<PubKey, Option<String>>,
}

#[derive(Clone)]
pub struct ContactRegistry {
    me: Keypair,
    store: Arc<dyn GraphStore>,
    state: Arc<Mutex<ContactState>>,
    name_watchers: Arc<Mutex<HashMap<PubKey, Subscription>>>,
}

impl ContactRegistry {
    pub fn new(me: Keypair, store: Arc<dyn GraphStore>) -> Self {
        Self {
            me,
            store,
            state: Arc::new(Mutex::new(ContactState::default())),
            name_watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn path(&self, uuid: &Ulid) -> StorePath {
        StorePath::new(paths::contacts_node(self.me.pub_key()), paths::contact_key(uuid))
    }

    pub fn known_uuid(&self, pub_key: &PubKey) -> Option<Ulid> {
        self.state.lock().uuids.get(pub_key).copied()
    }

    /// Resolve a public identity with a single read and store it as a
    /// contact. Repeated calls for the same identity reuse its uuid.
    pub fn set_contact(&self, pub_key: &PubKey) -> ChatResult<Contact> {
        let profile = read_profile(self.store.as_ref(), pub_key)?
            .ok_or_else(|| ChatError::InvalidInvite(format!("{}: no published profile", pub_key)))?;

        let uuid = *self
            .state
            .lock()
            .uuids
            .entry(pub_key.clone())
            .or_insert_with(Ulid::new);
        let contact = Contact {
            uuid,
            pub_key: profile.pub_key,
            epub: profile.epub,
            alias: profile.alias,
            name: profile.name,
        };
        self.store
            .put(&self.path(&uuid), Some(crypto::seal(&contact, &self.me)?))
            .inspect_err(|e| warn!(%uuid, error = %e, "Failed to store contact"))?;
        info!(%uuid, contact = %pub_key.short(), "Stored contact");
        Ok(contact)
    }

    /// Tombstone a contact and stop following its name.
    pub fn remove_contact(&self, pub_key: &PubKey) -> ChatResult<()> {
        let uuid = self
            .known_uuid(pub_key)
            .ok_or_else(|| ChatError::InvalidContact(format!("{} is not a contact", pub_key)))?;
        if let Some(watcher) = self.name_watchers.lock().remove(pub_key) {
            watcher.cancel();
        }
        self.store.put(&self.path(&uuid), None)?;
        self.state.lock().known.remove(pub_key);
        info!(%uuid, contact = %pub_key.short(), "Removed contact");
        Ok(())
    }

    /// Follow our contact list plus every contact's display name.
    pub fn get_contact(
        &self,
        scope: &Subscription,
        consumer: Consumer<ContactChange>,
    ) -> ChatResult<Subscription> {
        let handle = scope.child();
        let sub = self
            .store
            .subscribe(Query::all(paths::contacts_node(self.me.pub_key())))?;

        let registry = self.clone();
        let watch_scope = handle.clone();
        listen(sub, handle.clone(), move |record| {
            let Some(uuid) = paths::uuid_after(&record.path.key, CONTACT_PREFIX) else {
                return;
            };
            let Some(value) = record.value else {
                let pub_key = registry.forget(&uuid);
                consumer(ContactChange::Deleted { uuid, pub_key });
                return;
            };
            let Some(stored) = crypto::open::<Contact>(&value, &registry.me) else {
                trace!(%uuid, "Contact record not ours");
                return;
            };
            let contact = registry.remember(stored);
            let pub_key = contact.pub_key.clone();
            consumer(ContactChange::Stored(contact));
            // After the record, so a live name always lands last
            if let Err(e) = registry.watch_name(&pub_key, &watch_scope, consumer.clone()) {
                warn!(%uuid, error = %e, "Failed to watch contact name");
            }
        });
        Ok(handle)
    }

    /// Cache a stored record, overlaying the live name if one was seen.
    fn remember(&self, mut contact: Contact) -> Contact {
        let mut state = self.state.lock();
        state
            .uuids
            .entry(contact.pub_key.clone())
            .or_insert(contact.uuid);
        if let Some(name) = state.live_names.get(&contact.pub_key) {
            contact.name = name.clone();
        }
        state.known.insert(contact.pub_key.clone(), contact.clone());
        contact
    }

    fn forget(&self, uuid: &Ulid) -> Option<PubKey> {
        let mut state = self.state.lock();
        let pub_key = state
            .uuids
            .iter()
            .find(|(_, cached)| *cached == uuid)
            .map(|(pub_key, _)| pub_key.clone())?;
        state.known.remove(&pub_key);
        drop(state);
        if let Some(watcher) = self.name_watchers.lock().remove(&pub_key) {
            watcher.cancel();
        }
        Some(pub_key)
    }

    /// Memoized per identity: at most one live name watcher per contact.
    fn watch_name(
        &self,
        pub_key: &PubKey,
        scope: &Subscription,
        consumer: Consumer<ContactChange>,
    ) -> ChatResult<()> {
        let handle = {
            let mut watchers = self.name_watchers.lock();
            if watchers.get(pub_key).is_some_and(|w| !w.is_cancelled()) {
                return Ok(());
            }
            let handle = scope.child();
            watchers.insert(pub_key.clone(), handle.clone());
            handle
        };

        let query = Query::exact(paths::profile_node(pub_key), "name");
        let sub = match self.store.subscribe(query) {
            Ok(sub) => sub,
            Err(e) => {
                self.name_watchers.lock().remove(pub_key);
                return Err(e);
            }
        };
        debug!(contact = %pub_key.short(), "Watching contact name");

        let registry = self.clone();
        let pub_key = pub_key.clone();
        listen(sub, handle, move |record| {
            let name = record.value.and_then(|bytes| String::from_utf8(bytes).ok());
            let updated = {
                let mut state = registry.state.lock();
                state.live_names.insert(pub_key.clone(), name.clone());
                match state.known.get_mut(&pub_key) {
                    Some(contact) if contact.name != name => {
                        contact.name = name;
                        Some(contact.clone())
                    }
                    _ => None,
                }
            };
            if let Some(contact) = updated {
                consumer(ContactChange::Stored(contact));
            }
        });
        Ok(())
    }
}
