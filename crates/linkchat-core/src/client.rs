//! ChatClient - the primary entry point for Linkchat
//!
//! ChatClient wires the registries and the message chain of one identity:
//! - every live subscription feeds one `ChatEvent` inbox
//! - a dispatcher task folds the inbox through the [`Projection`]
//! - derived effects are written back through the registries
//! - events and notifications are rebroadcast to UI consumers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use linkchat_core::{ChatClient, ChatConfig, Identity, LocalStore};
//!
//! let store = Arc::new(LocalStore::open("~/.linkchat/replica.redb")?);
//! let client = ChatClient::new(Identity::generate("alice"), store, ChatConfig::default())?;
//! client.start()?;
//!
//! let mut events = client.subscribe_events();
//! client.send_request(&bob_pub, "hi, it's alice")?;
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

use crate::chain::{Consumer, Content, Message, MessageChain, Payload};
use crate::config::ChatConfig;
use crate::contact::{Contact, ContactChange, ContactRegistry};
use crate::conversation::{Conversation, ConversationChange, ConversationRegistry, ConversationUpdate};
use crate::error::{ChatError, ChatResult};
use crate::events::{ChatEvent, ClientEvent, Effect};
use crate::identity::{Identity, Keypair, PubKey};
use crate::projection::Projection;
use crate::removed::RemovedRegistry;
use crate::store::GraphStore;
use crate::subscription::Subscription;

/// User commands a UI dispatches into the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SendText {
        converse_pub: PubKey,
        text: String,
    },
    SendRequest {
        to: PubKey,
        text: String,
    },
    SendGroupRequests {
        member_pubs: Vec<PubKey>,
        text: String,
        name: Option<String>,
    },
    AcceptRequest(Ulid),
    DeclineRequest(Ulid),
    DeleteConversation(PubKey),
    AddContact(PubKey),
    RemoveContact(PubKey),
    RenameGroup {
        converse_pub: PubKey,
        name: String,
    },
    SelectConversation {
        converse_pub: PubKey,
        timestamp: Option<i64>,
    },
    ExpireMessages(PubKey),
    ReplayHistory(PubKey),
}

/// Items queued for the dispatcher task
enum Inbox {
    Event(ChatEvent),
    /// Answered once everything queued before it was folded
    Flush(oneshot::Sender<()>),
}

/// Newest chain link known for one conversation
struct Frontier {
    timestamp: i64,
    pair: Keypair,
}

struct ClientInner {
    identity: Identity,
    config: ChatConfig,
    store: Arc<dyn GraphStore>,
    chain: MessageChain,
    removed: RemovedRegistry,
    contacts: ContactRegistry,
    conversations: ConversationRegistry,
    projection: Mutex<Projection>,
    /// Event broadcast channel for UI consumers
    event_tx: broadcast::Sender<ClientEvent>,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbox>>>,
    /// Parent of every subscription this client opens
    root: Subscription,
    /// Live chain traversal per conversation
    traversals: Mutex<HashMap<PubKey, Subscription>>,
    frontiers: Arc<Mutex<HashMap<PubKey, Frontier>>>,
}

/// Messaging client for one local identity.
///
/// Cheap to clone; every clone drives the same state. All subscriptions end
/// when [`ChatClient::shutdown`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Build a client and publish the identity's profile.
    ///
    /// Nothing is subscribed until [`ChatClient::start`].
    pub fn new(
        identity: Identity,
        store: Arc<dyn GraphStore>,
        config: ChatConfig,
    ) -> ChatResult<Self> {
        config.validate()?;
        identity.publish_profile(store.as_ref())?;

        let me = identity.pair().clone();
        let chain = MessageChain::new(me.clone(), store.clone(), &config)?;
        let removed = RemovedRegistry::new(me.clone(), store.clone());
        let contacts = ContactRegistry::new(me.clone(), store.clone());
        let conversations = ConversationRegistry::new(me.clone(), store.clone(), removed.clone());

        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        info!(pub_key = %identity.pub_key(), alias = %identity.alias(), "Initializing ChatClient");

        Ok(Self {
            inner: Arc::new(ClientInner {
                projection: Mutex::new(Projection::new(me.pub_key().clone())),
                identity,
                config,
                store,
                chain,
                removed,
                contacts,
                conversations,
                event_tx,
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                root: Subscription::new(),
                traversals: Mutex::new(HashMap::new()),
                frontiers: Arc::new(Mutex::new(HashMap::new())),
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn pub_key(&self) -> &PubKey {
        self.inner.identity.pub_key()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.inner.store
    }

    pub fn chain(&self) -> &MessageChain {
        &self.inner.chain
    }

    /// Open every subscription and start folding events.
    ///
    /// Must run inside a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) -> ChatResult<()> {
        let Some(inbox_rx) = self.inner.inbox_rx.lock().take() else {
            debug!("ChatClient already started");
            return Ok(());
        };
        tokio::spawn(run_dispatcher(
            Arc::downgrade(&self.inner),
            inbox_rx,
            self.inner.root.clone(),
        ));

        let inner = &self.inner;
        let root = &inner.root;

        // Removed-set first: request discovery below consults it
        let tx = inner.inbox_tx.clone();
        inner.removed.get_removed(
            root,
            Arc::new(move |uuid: Ulid| {
                let _ = tx.send(Inbox::Event(ChatEvent::RequestRemoved(uuid)));
            }),
        )?;

        let tx = inner.inbox_tx.clone();
        inner.contacts.get_contact(
            root,
            Arc::new(move |change: ContactChange| {
                let event = match change {
                    ContactChange::Stored(contact) => ChatEvent::ContactAppend(contact),
                    ContactChange::Deleted {
                        pub_key: Some(pub_key),
                        ..
                    } => ChatEvent::ContactDelete(pub_key),
                    ContactChange::Deleted { uuid, pub_key: None } => {
                        trace!(%uuid, "Tombstone for an unknown contact");
                        return;
                    }
                };
                let _ = tx.send(Inbox::Event(event));
            }),
        )?;
        inner.emit(ChatEvent::ContactInit);

        let tx = inner.inbox_tx.clone();
        inner.conversations.get_conversation(
            root,
            Arc::new(move |change: ConversationChange| {
                let event = match change {
                    ConversationChange::Stored(conversation) => {
                        ChatEvent::ConversationAppend(conversation)
                    }
                    ConversationChange::Deleted {
                        converse_pub: Some(converse_pub),
                        ..
                    } => ChatEvent::ConversationDelete(converse_pub),
                    ConversationChange::Deleted {
                        uuid,
                        converse_pub: None,
                    } => {
                        trace!(%uuid, "Tombstone for an unknown conversation");
                        return;
                    }
                    ConversationChange::GroupUpdated {
                        uuid,
                        converse_pub,
                        descriptor,
                    } => ChatEvent::GroupUpdate {
                        uuid,
                        converse_pub,
                        descriptor,
                    },
                };
                let _ = tx.send(Inbox::Event(event));
            }),
        )?;
        inner.emit(ChatEvent::ConversationInit);

        let weak = Arc::downgrade(&self.inner);
        inner.chain.get_my_message(
            root,
            Arc::new(move |message: Message| {
                if let Some(inner) = weak.upgrade() {
                    inner.receive(message);
                }
            }),
        )?;

        info!(pub_key = %self.pub_key().short(), "ChatClient started");
        Ok(())
    }

    /// Cancel every subscription and stop the dispatcher.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.traversals.lock().clear();
        info!(pub_key = %self.pub_key().short(), "ChatClient stopped");
    }

    /// Subscribe to folded events and notifications.
    ///
    /// Multiple subscribers can exist; events are broadcast to all.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Copy of the current lists.
    pub fn snapshot(&self) -> Projection {
        self.inner.projection.lock().clone()
    }

    /// Wait until every event queued so far has been folded.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.inbox_tx.send(Inbox::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Run one user command.
    ///
    /// Failures that have an error event are also reported through it.
    pub fn dispatch(&self, intent: Intent) -> ChatResult<()> {
        debug!(?intent, "Dispatching intent");
        match intent {
            Intent::SendText { converse_pub, text } => {
                self.send_text(&converse_pub, text)?;
            }
            Intent::SendRequest { to, text } => {
                self.send_request(&to, text)?;
            }
            Intent::SendGroupRequests {
                member_pubs,
                text,
                name,
            } => {
                self.send_group_requests(&member_pubs, text, name)?;
            }
            Intent::AcceptRequest(uuid) => {
                self.accept_request(&uuid)?;
            }
            Intent::DeclineRequest(uuid) => self.decline_request(&uuid)?,
            Intent::DeleteConversation(converse_pub) => self.delete_conversation(&converse_pub)?,
            Intent::AddContact(pub_key) => {
                self.add_contact(&pub_key)?;
            }
            Intent::RemoveContact(pub_key) => self.remove_contact(&pub_key)?,
            Intent::RenameGroup { converse_pub, name } => {
                self.rename_group(&converse_pub, name)?;
            }
            Intent::SelectConversation {
                converse_pub,
                timestamp,
            } => self.select_conversation(&converse_pub, timestamp),
            Intent::ExpireMessages(converse_pub) => {
                self.expire_messages(&converse_pub)?;
            }
            Intent::ReplayHistory(converse_pub) => self.replay_history(&converse_pub)?,
        }
        Ok(())
    }

    fn conversation(&self, converse_pub: &PubKey) -> ChatResult<Conversation> {
        self.inner
            .projection
            .lock()
            .conversations
            .find(converse_pub)
            .cloned()
            .ok_or_else(|| ChatError::ConversationNotFound(converse_pub.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messaging
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a text message at the tail of a conversation's chain.
    pub fn send_text(&self, converse_pub: &PubKey, text: impl Into<String>) -> ChatResult<Message> {
        let inner = &self.inner;
        let result = self.conversation(converse_pub).and_then(|conversation| {
            let link = inner.frontier(&conversation);
            inner
                .chain
                .send_next_message(&link, &conversation.converse_pub, Content::text(text))
        });
        match result {
            Ok(message) => {
                inner.advance_frontier(converse_pub, &message);
                Ok(message)
            }
            Err(e) => {
                inner.emit(ChatEvent::SendTextError {
                    converse_pub: converse_pub.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Invites
    // ═══════════════════════════════════════════════════════════════════════

    /// Invite one identity to a direct conversation.
    pub fn send_request(&self, to: &PubKey, text: impl Into<String>) -> ChatResult<Conversation> {
        let inner = &self.inner;
        let content = Content::Request {
            text: text.into(),
            member_pubs: None,
            next_pair: None,
            name: None,
        };
        let result = inner
            .chain
            .send_message_to_user(to, to, Payload::Plain(content))
            .and_then(|message| inner.conversations.create_conversation(&message));
        match result {
            Ok(conversation) => {
                info!(to = %to.short(), uuid = %conversation.uuid, "Sent request");
                inner.emit(ChatEvent::ClearRequestError(to.clone()));
                Ok(conversation)
            }
            Err(e) => {
                inner.emit(ChatEvent::SendRequestError {
                    pub_key: to.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Create a group we administer and invite every member to it.
    ///
    /// Every invite carries the group pair as the chain's first link. Members
    /// whose profile cannot be resolved get a `SendRequestError`; the group is
    /// created as long as one invite went out.
    pub fn send_group_requests(
        &self,
        member_pubs: &[PubKey],
        text: impl Into<String>,
        name: Option<String>,
    ) -> ChatResult<Conversation> {
        let inner = &self.inner;
        let me = self.pub_key();
        let mut members: Vec<PubKey> = Vec::new();
        for member in member_pubs {
            if member != me && !members.contains(member) {
                members.push(member.clone());
            }
        }

        let group_pair = Keypair::generate();
        let content = Content::Request {
            text: text.into(),
            member_pubs: Some(members.clone()),
            next_pair: Some(group_pair.clone()),
            name,
        };

        let mut first_sent = None;
        for member in &members {
            match inner.chain.send_message_to_user(
                member,
                group_pair.pub_key(),
                Payload::Plain(content.clone()),
            ) {
                Ok(message) => {
                    inner.emit(ChatEvent::ClearRequestError(member.clone()));
                    first_sent.get_or_insert(message);
                }
                Err(e) => {
                    warn!(member = %member.short(), error = %e, "Failed to send group request");
                    inner.emit(ChatEvent::SendRequestError {
                        pub_key: member.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let message = first_sent
            .ok_or_else(|| ChatError::InvalidContact("no group member could be invited".into()))?;
        let conversation = inner.conversations.create_conversation(&message)?;
        info!(uuid = %conversation.uuid, members = members.len(), "Created group");
        Ok(conversation)
    }

    fn pending_request(&self, uuid: &Ulid) -> ChatResult<Message> {
        self.inner
            .projection
            .lock()
            .requests
            .find(uuid)
            .cloned()
            .ok_or_else(|| ChatError::InvalidInvite(format!("no pending request {}", uuid)))
    }

    /// Join the conversation a pending request invites us to.
    ///
    /// The sender (and, for a group, every other member) becomes a contact.
    /// The inviter gets an `Accept` whose rotated layer carries the request's
    /// chain pair, so it can re-seed its own record if that went missing.
    pub fn accept_request(&self, uuid: &Ulid) -> ChatResult<Conversation> {
        let inner = &self.inner;
        let request = self.pending_request(uuid)?;
        let me = self.pub_key();

        let mut new_contacts: Vec<PubKey> = request
            .content()
            .and_then(Content::member_pubs)
            .unwrap_or_default()
            .iter()
            .filter(|member| *member != me)
            .cloned()
            .collect();
        if !new_contacts.contains(&request.from_pub) {
            new_contacts.push(request.from_pub.clone());
        }
        for pub_key in &new_contacts {
            if let Err(e) = inner.contacts.set_contact(pub_key) {
                warn!(contact = %pub_key.short(), error = %e, "Failed to add contact from request");
                inner.emit(ChatEvent::ContactAppendError {
                    pub_key: pub_key.clone(),
                    error: e.to_string(),
                });
            }
        }

        let conversation = inner.conversations.create_conversation(&request)?;
        inner.removed.mark_removed(uuid)?;
        inner.emit(ChatEvent::RequestAccept(*uuid));
        info!(%uuid, conversation = %conversation.uuid, "Accepted request");

        let reply = Content::Accept {
            request_uuid: *uuid,
            text: String::new(),
        };
        if let Err(e) = inner.chain.send_rotated(
            &request.from_pub,
            &request.target(me),
            request.next_pair.clone(),
            reply,
        ) {
            warn!(%uuid, error = %e, "Failed to reply to request");
            inner.emit(ChatEvent::SendRequestError {
                pub_key: request.from_pub.clone(),
                error: e.to_string(),
            });
        }
        Ok(conversation)
    }

    /// Drop a pending request for good.
    pub fn decline_request(&self, uuid: &Ulid) -> ChatResult<()> {
        self.inner.removed.mark_removed(uuid)?;
        self.inner.emit(ChatEvent::RequestDecline(*uuid));
        info!(%uuid, "Declined request");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversations & contacts
    // ═══════════════════════════════════════════════════════════════════════

    /// Tombstone a conversation and stop following its chain.
    pub fn delete_conversation(&self, converse_pub: &PubKey) -> ChatResult<()> {
        let inner = &self.inner;
        let uuid = inner
            .conversations
            .known_uuid(converse_pub)
            .ok_or_else(|| ChatError::ConversationNotFound(converse_pub.to_string()))?;
        inner.conversations.remove_conversation(&uuid)?;
        inner.stop_following(converse_pub);
        Ok(())
    }

    pub fn add_contact(&self, pub_key: &PubKey) -> ChatResult<Contact> {
        match self.inner.contacts.set_contact(pub_key) {
            Ok(contact) => {
                self.inner.emit(ChatEvent::ContactClearError(pub_key.clone()));
                Ok(contact)
            }
            Err(e) => {
                self.inner.emit(ChatEvent::ContactAppendError {
                    pub_key: pub_key.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn remove_contact(&self, pub_key: &PubKey) -> ChatResult<()> {
        self.inner.contacts.remove_contact(pub_key)
    }

    /// Rename a group we administer.
    pub fn rename_group(&self, converse_pub: &PubKey, name: impl Into<String>) -> ChatResult<Conversation> {
        let uuid = self
            .inner
            .conversations
            .known_uuid(converse_pub)
            .ok_or_else(|| ChatError::ConversationNotFound(converse_pub.to_string()))?;
        self.inner.conversations.update_group_name(&uuid, name)
    }

    /// Make a conversation the active one.
    ///
    /// Without an explicit timestamp, the newest surfaced message counts as
    /// read.
    pub fn select_conversation(&self, converse_pub: &PubKey, timestamp: Option<i64>) {
        let timestamp = timestamp.or_else(|| {
            let projection = self.inner.projection.lock();
            projection
                .messages
                .latest(projection.me(), converse_pub)
                .map(|m| m.timestamp)
        });
        self.inner.emit(ChatEvent::ConversationSelect {
            converse_pub: converse_pub.clone(),
            timestamp,
        });
    }

    /// Collapse the surfaced messages of a conversation and move its stored
    /// frontier past them. Returns `false` when there was nothing to expire.
    pub fn expire_messages(&self, converse_pub: &PubKey) -> ChatResult<bool> {
        let latest = {
            let projection = self.inner.projection.lock();
            projection
                .messages
                .latest(projection.me(), converse_pub)
                .cloned()
        };
        let Some(latest) = latest else {
            return Ok(false);
        };
        if !self.inner.conversations.expire_conversation_message(&latest)? {
            return Ok(false);
        }
        self.inner.emit(ChatEvent::MessageExpire {
            converse_pub: converse_pub.clone(),
            up_to: latest.timestamp,
        });
        Ok(true)
    }

    /// Re-follow a conversation from its root pair, restoring expired history.
    pub fn replay_history(&self, converse_pub: &PubKey) -> ChatResult<()> {
        let conversation = self.conversation(converse_pub)?;
        self.inner.stop_following(converse_pub);
        self.inner.follow(&conversation, true)
    }
}

impl ClientInner {
    fn emit(&self, event: ChatEvent) {
        if self.inbox_tx.send(Inbox::Event(event)).is_err() {
            trace!("Dispatcher stopped, event dropped");
        }
    }

    /// Inbound identity-addressed message.
    fn receive(&self, message: Message) {
        if self.removed.is_removed(&message.uuid) {
            trace!(uuid = %message.uuid, "Inbound message already handled");
            return;
        }
        match message.content() {
            Some(Content::Request { .. }) => self.emit(ChatEvent::RequestAppend(message)),
            Some(Content::Accept { request_uuid, .. }) => {
                let request_uuid = *request_uuid;
                self.receive_accept(message, request_uuid);
            }
            Some(Content::Text { .. }) => self.emit(ChatEvent::MessageAppend(message)),
            None => trace!(uuid = %message.uuid, "Rotated payload not for us"),
        }
    }

    /// Our invite was accepted: make sure the conversation exists and the
    /// accepting identity is a contact.
    fn receive_accept(&self, message: Message, request_uuid: Ulid) {
        debug!(uuid = %message.uuid, %request_uuid, from = %message.from_pub.short(), "Request accepted");
        let target = message.target(self.identity.pub_key());
        if self.conversations.is_deleted(&target) {
            debug!(uuid = %message.uuid, converse = %target.short(), "Accept for a deleted conversation");
        } else if let Err(e) = self.conversations.create_conversation(&message) {
            warn!(uuid = %message.uuid, error = %e, "Failed to store accepted conversation");
            return;
        }
        if let Err(e) = self.contacts.set_contact(&message.from_pub) {
            self.emit(ChatEvent::ContactAppendError {
                pub_key: message.from_pub.clone(),
                error: e.to_string(),
            });
        }
        // Never reprocess this reply, even after the conversation is deleted
        if let Err(e) = self.removed.mark_removed(&message.uuid) {
            warn!(uuid = %message.uuid, error = %e, "Failed to flag accept as handled");
        }
    }

    fn process(&self, event: ChatEvent) {
        let effects = self.projection.lock().apply(&event);

        match &event {
            ChatEvent::ConversationAppend(conversation) => {
                if let Err(e) = self.follow(conversation, false) {
                    warn!(uuid = %conversation.uuid, error = %e, "Failed to follow conversation");
                }
            }
            ChatEvent::ConversationDelete(converse_pub) => self.stop_following(converse_pub),
            _ => {}
        }

        // No receivers is fine
        let _ = self.event_tx.send(ClientEvent::Event(event));
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&self, effect: Effect) {
        match effect {
            Effect::AdvanceTimestamp { uuid, timestamp } => {
                let update = ConversationUpdate::last_timestamp(timestamp);
                if let Err(e) = self.conversations.update_conversation(&uuid, &update) {
                    debug!(%uuid, error = %e, "Timestamp advance not applied");
                }
            }
            Effect::Notify(notification) => {
                debug!(uuid = %notification.message_uuid, "New message notification");
                let _ = self.event_tx.send(ClientEvent::Notification(notification));
            }
        }
    }

    fn frontier(&self, conversation: &Conversation) -> Keypair {
        self.frontiers
            .lock()
            .get(&conversation.converse_pub)
            .map(|f| f.pair.clone())
            .unwrap_or_else(|| conversation.next_pair.clone())
    }

    fn advance_frontier(&self, converse_pub: &PubKey, message: &Message) {
        advance_frontier(&self.frontiers, converse_pub, message);
    }

    /// Start the chain traversal of a conversation, from its frontier or,
    /// for a replay, from its root.
    fn follow(&self, conversation: &Conversation, from_root: bool) -> ChatResult<()> {
        let mut traversals = self.traversals.lock();
        if traversals
            .get(&conversation.converse_pub)
            .is_some_and(|t| !t.is_cancelled())
        {
            return Ok(());
        }
        let start = if from_root {
            &conversation.root_pair
        } else {
            &conversation.next_pair
        };

        let inbox = self.inbox_tx.clone();
        let frontiers = self.frontiers.clone();
        let converse_pub = conversation.converse_pub.clone();
        let consumer: Consumer<Message> = Arc::new(move |message: Message| {
            advance_frontier(&frontiers, &converse_pub, &message);
            let _ = inbox.send(Inbox::Event(ChatEvent::MessageAppend(message)));
        });

        let handle = self
            .chain
            .get_next_message_recursive(start, &self.root, consumer)?;
        debug!(
            converse = %conversation.converse_pub.short(),
            replay = from_root,
            "Following conversation chain"
        );
        traversals.insert(conversation.converse_pub.clone(), handle);
        Ok(())
    }

    fn stop_following(&self, converse_pub: &PubKey) {
        if let Some(handle) = self.traversals.lock().remove(converse_pub) {
            handle.cancel();
            debug!(converse = %converse_pub.short(), "Stopped following conversation chain");
        }
        self.frontiers.lock().remove(converse_pub);
    }
}

/// Track the newest `next_pair` seen so replies extend the chain's tail.
fn advance_frontier(
    frontiers: &Mutex<HashMap<PubKey, Frontier>>,
    converse_pub: &PubKey,
    message: &Message,
) {
    let mut frontiers = frontiers.lock();
    if frontiers
        .get(converse_pub)
        .is_some_and(|current| current.timestamp > message.timestamp)
    {
        return;
    }
    frontiers.insert(
        converse_pub.clone(),
        Frontier {
            timestamp: message.timestamp,
            pair: message.next_pair.clone(),
        },
    );
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_dispatcher(
    inner: Weak<ClientInner>,
    mut inbox: mpsc::UnboundedReceiver<Inbox>,
    root: Subscription,
) {
    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            item = inbox.recv() => match item {
                Some(Inbox::Event(event)) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.process(event);
                }
                Some(Inbox::Flush(done)) => {
                    let _ = done.send(());
                }
                None => break,
            },
        }
    }
    trace!("Dispatcher stopped");
}
