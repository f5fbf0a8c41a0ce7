//! Conversation & group registry
//!
//! Conversations are sealed per owner under `~{me}/conversations`. Group
//! conversations additionally follow the admin's shared descriptor under
//! `~{admin}/groups`, which every holder of the group pair can open.

mod record;

pub use record::{Conversation, ConversationUpdate, GroupDescriptor};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

use crate::chain::{now_ms, Consumer, Content, Message};
use crate::crypto;
use crate::error::{ChatError, ChatResult};
use crate::identity::{Keypair, PubKey};
use crate::removed::RemovedRegistry;
use crate::store::{listen, paths, GraphStore, Query, StorePath};
use crate::subscription::Subscription;

const CONVERSATION_PREFIX: &str = "conversation-";

/// What [`ConversationRegistry::get_conversation`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationChange {
    /// A record was written (or re-delivered)
    Stored(Conversation),
    /// A record was tombstoned
    Deleted {
        uuid: Ulid,
        converse_pub: Option<PubKey>,
    },
    /// A remote group descriptor was folded into the record
    GroupUpdated {
        uuid: Ulid,
        converse_pub: PubKey,
        descriptor: GroupDescriptor,
    },
}

#[derive(Clone)]
pub struct ConversationRegistry {
    me: Keypair,
    store: Arc<dyn GraphStore>,
    removed: RemovedRegistry,
    /// Counterpart identity -> stable local uuid
    uuids: Arc<Mutex<HashMap<PubKey, Ulid>>>,
    /// Group pub -> descriptor watcher
    group_watchers: Arc<Mutex<HashMap<PubKey, Subscription>>>,
}

impl ConversationRegistry {
    pub fn new(me: Keypair, store: Arc<dyn GraphStore>, removed: RemovedRegistry) -> Self {
        Self {
            me,
            store,
            removed,
            uuids: Arc::new(Mutex::new(HashMap::new())),
            group_watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn path(&self, uuid: &Ulid) -> StorePath {
        StorePath::new(
            paths::conversations_node(self.me.pub_key()),
            paths::conversation_key(uuid),
        )
    }

    /// Stable uuid for a counterpart, assigned on first use. A uuid that was
    /// removed is never handed out again.
    fn uuid_for(&self, target: &PubKey) -> Ulid {
        let mut uuids = self.uuids.lock();
        match uuids.get(target) {
            Some(uuid) if !self.removed.is_removed(uuid) => *uuid,
            _ => {
                let uuid = Ulid::new();
                uuids.insert(target.clone(), uuid);
                uuid
            }
        }
    }

    /// Uuid already cached for a counterpart.
    pub fn known_uuid(&self, target: &PubKey) -> Option<Ulid> {
        self.uuids.lock().get(target).copied()
    }

    /// Whether the conversation with a counterpart was deleted locally.
    pub fn is_deleted(&self, target: &PubKey) -> bool {
        self.known_uuid(target)
            .is_some_and(|uuid| self.removed.is_removed(&uuid))
    }

    /// Reverse of [`Self::known_uuid`].
    pub fn converse_pub_for(&self, uuid: &Ulid) -> Option<PubKey> {
        self.uuids
            .lock()
            .iter()
            .find(|(_, cached)| *cached == uuid)
            .map(|(pub_key, _)| pub_key.clone())
    }

    fn remember(&self, conversation: &Conversation) {
        self.uuids
            .lock()
            .entry(conversation.converse_pub.clone())
            .or_insert(conversation.uuid);
    }

    /// Single read of one record.
    pub fn read(&self, uuid: &Ulid) -> ChatResult<Option<Conversation>> {
        let value = self.store.read_once(&self.path(uuid))?;
        Ok(value.and_then(|v| crypto::open(&v, &self.me)))
    }

    fn write(&self, conversation: &Conversation) -> ChatResult<()> {
        let sealed = crypto::seal(conversation, &self.me)?;
        self.store
            .put(&self.path(&conversation.uuid), Some(sealed))
            .inspect_err(|e| warn!(uuid = %conversation.uuid, error = %e, "Failed to store conversation"))
    }

    /// Create (or return the existing) conversation for a message's
    /// counterpart. A group request also yields the group fields, and the
    /// admin publishes the descriptor.
    pub fn create_conversation(&self, message: &Message) -> ChatResult<Conversation> {
        let target = message.target(self.me.pub_key());
        let uuid = self.uuid_for(&target);
        if let Some(existing) = self.read(&uuid)? {
            trace!(%uuid, "Conversation already exists");
            return Ok(existing);
        }

        let group = match message.content() {
            Some(Content::Request {
                member_pubs: Some(members),
                name,
                ..
            }) => Some((members.clone(), name.clone())),
            _ => None,
        };
        let is_group = group.is_some();
        let (member_pubs, name) = group.unzip();

        let conversation = Conversation {
            uuid,
            converse_pub: target,
            root_pair: message.next_pair.clone(),
            next_pair: message.next_pair.clone(),
            last_timestamp: message.timestamp,
            created_timestamp: message.timestamp,
            admin_pub: is_group.then(|| message.from_pub.clone()),
            member_pubs,
            group_pair: is_group.then(|| message.next_pair.clone()),
            group_timestamp: is_group.then_some(message.timestamp),
            name: name.flatten(),
        };
        self.write(&conversation)?;
        self.remember(&conversation);
        info!(%uuid, converse = %conversation.converse_pub.short(), group = is_group, "Created conversation");

        if conversation.admin_pub.as_ref() == Some(self.me.pub_key()) {
            self.publish_group(&conversation)?;
        }
        Ok(conversation)
    }

    /// Read-merge-write. Returns the new record, or `None` when the merge
    /// changed nothing (and nothing was written).
    pub fn update_conversation(
        &self,
        uuid: &Ulid,
        update: &ConversationUpdate,
    ) -> ChatResult<Option<Conversation>> {
        let current = self
            .read(uuid)?
            .ok_or_else(|| ChatError::ConversationNotFound(uuid.to_string()))?;
        let merged = current.merge(update);
        if merged == current {
            trace!(%uuid, "Conversation update is a no-op");
            return Ok(None);
        }
        self.write(&merged)?;
        Ok(Some(merged))
    }

    /// Advance the stored frontier past an already-surfaced message.
    ///
    /// Returns `false` when the conversation is unknown or no longer targets
    /// the message's counterpart.
    pub fn expire_conversation_message(&self, message: &Message) -> ChatResult<bool> {
        let target = message.target(self.me.pub_key());
        let Some(uuid) = self.known_uuid(&target) else {
            return Ok(false);
        };
        let Some(current) = self.read(&uuid)? else {
            return Ok(false);
        };
        if current.converse_pub != target {
            debug!(%uuid, "Conversation target changed, not expiring");
            return Ok(false);
        }
        let update = ConversationUpdate::next_pair(message.next_pair.clone());
        Ok(self.update_conversation(&uuid, &update)?.is_some())
    }

    /// Tombstone a conversation and flag its uuid as removed.
    pub fn remove_conversation(&self, uuid: &Ulid) -> ChatResult<()> {
        self.removed.mark_removed(uuid)?;
        if let Some(group_pub) = self
            .read(uuid)?
            .and_then(|c| c.group_pair.map(|pair| pair.pub_key().clone()))
        {
            if let Some(watcher) = self.group_watchers.lock().remove(&group_pub) {
                watcher.cancel();
            }
        }
        self.store.put(&self.path(uuid), None)?;
        info!(%uuid, "Removed conversation");
        Ok(())
    }

    /// Publish the group descriptor of a conversation we administer.
    pub fn publish_group(&self, conversation: &Conversation) -> ChatResult<()> {
        let (Some(group_pair), Some(descriptor)) =
            (&conversation.group_pair, conversation.descriptor())
        else {
            return Ok(());
        };
        if conversation.admin_pub.as_ref() != Some(self.me.pub_key()) {
            return Err(ChatError::NotGroupAdmin(conversation.uuid.to_string()));
        }
        let path = StorePath::new(
            paths::groups_node(self.me.pub_key()),
            paths::group_key(group_pair.pub_key()),
        );
        self.store
            .put(&path, Some(crypto::seal(&descriptor, group_pair)?))?;
        debug!(uuid = %conversation.uuid, "Published group descriptor");
        Ok(())
    }

    /// Rename a group we administer and republish its descriptor.
    pub fn update_group_name(&self, uuid: &Ulid, name: impl Into<String>) -> ChatResult<Conversation> {
        let current = self
            .read(uuid)?
            .ok_or_else(|| ChatError::ConversationNotFound(uuid.to_string()))?;
        if !current.is_group() || current.admin_pub.as_ref() != Some(self.me.pub_key()) {
            return Err(ChatError::NotGroupAdmin(uuid.to_string()));
        }
        let update = ConversationUpdate {
            name: Some(name.into()),
            group_timestamp: Some(now_ms().max(current.group_timestamp.unwrap_or(0))),
            ..Default::default()
        };
        let renamed = self
            .update_conversation(uuid, &update)?
            .unwrap_or(current);
        self.publish_group(&renamed)?;
        Ok(renamed)
    }

    /// Follow every stored conversation of ours, attaching a group detail
    /// watcher to each group.
    pub fn get_conversation(
        &self,
        scope: &Subscription,
        consumer: Consumer<ConversationChange>,
    ) -> ChatResult<Subscription> {
        let handle = scope.child();
        let sub = self
            .store
            .subscribe(Query::all(paths::conversations_node(self.me.pub_key())))?;

        let registry = self.clone();
        let watch_scope = handle.clone();
        listen(sub, handle.clone(), move |record| {
            let Some(uuid) = paths::uuid_after(&record.path.key, CONVERSATION_PREFIX) else {
                return;
            };
            let Some(value) = record.value else {
                let converse_pub = registry.converse_pub_for(&uuid);
                consumer(ConversationChange::Deleted { uuid, converse_pub });
                return;
            };
            let Some(conversation) = crypto::open::<Conversation>(&value, &registry.me) else {
                trace!(%uuid, "Conversation record not ours");
                return;
            };
            registry.remember(&conversation);
            consumer(ConversationChange::Stored(conversation.clone()));
            if let Err(e) =
                registry.get_conversation_details(&conversation, &watch_scope, consumer.clone())
            {
                warn!(%uuid, error = %e, "Failed to watch group details");
            }
        });
        Ok(handle)
    }

    /// Watch the admin's descriptor of a group conversation, memoized per
    /// group pair. Remote changes are merged into our record unless the
    /// conversation was removed.
    pub fn get_conversation_details(
        &self,
        conversation: &Conversation,
        scope: &Subscription,
        consumer: Consumer<ConversationChange>,
    ) -> ChatResult<Option<Subscription>> {
        let (Some(admin_pub), Some(group_pair)) = (&conversation.admin_pub, &conversation.group_pair)
        else {
            return Ok(None);
        };
        let group_pub = group_pair.pub_key().clone();

        let handle = {
            let mut watchers = self.group_watchers.lock();
            if let Some(existing) = watchers.get(&group_pub).filter(|w| !w.is_cancelled()) {
                return Ok(Some(existing.clone()));
            }
            let handle = scope.child();
            watchers.insert(group_pub.clone(), handle.clone());
            handle
        };

        let query = Query::exact(paths::groups_node(admin_pub), paths::group_key(&group_pub));
        let sub = match self.store.subscribe(query) {
            Ok(sub) => sub,
            Err(e) => {
                self.group_watchers.lock().remove(&group_pub);
                return Err(e);
            }
        };
        debug!(uuid = %conversation.uuid, group = %group_pub.short(), "Watching group details");

        let registry = self.clone();
        let uuid = conversation.uuid;
        let converse_pub = conversation.converse_pub.clone();
        let group_pair = group_pair.clone();
        listen(sub, handle.clone(), move |record| {
            let Some(value) = record.value else { return };
            let Some(descriptor) = crypto::open::<GroupDescriptor>(&value, &group_pair) else {
                trace!(%uuid, "Group descriptor did not open");
                return;
            };
            if registry.removed.is_removed(&uuid) {
                debug!(%uuid, "Ignoring group update for removed conversation");
                return;
            }
            match registry.update_conversation(&uuid, &descriptor.as_update()) {
                Ok(Some(_)) => consumer(ConversationChange::GroupUpdated {
                    uuid,
                    converse_pub: converse_pub.clone(),
                    descriptor,
                }),
                Ok(None) => {}
                Err(e) => debug!(%uuid, error = %e, "Group update not applied"),
            }
        });
        Ok(Some(handle))
    }
}
