//! Events folded by the projection and rebroadcast to UI consumers
//!
//! ```text
//! registries / chain ──► ChatEvent ──► Projection::apply ──► Vec<Effect>
//!                                            │                    │
//!                                            ▼                    ▼
//!                             ClientEvent::Event      AdvanceTimestamp / Notify
//! ```

use ulid::Ulid;

use crate::chain::Message;
use crate::contact::Contact;
use crate::conversation::{Conversation, GroupDescriptor};
use crate::identity::PubKey;

/// Typed input of the list reducers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ContactInit,
    ContactAppend(Contact),
    ContactDelete(PubKey),
    ContactAppendError {
        pub_key: PubKey,
        error: String,
    },
    ContactClearError(PubKey),

    ConversationInit,
    ConversationAppend(Conversation),
    /// Make a conversation the active one; `timestamp` is the newest message
    /// the user is now looking at
    ConversationSelect {
        converse_pub: PubKey,
        timestamp: Option<i64>,
    },
    ConversationDelete(PubKey),
    SendRequestError {
        pub_key: PubKey,
        error: String,
    },
    ClearRequestError(PubKey),
    SendTextError {
        converse_pub: PubKey,
        error: String,
    },

    MessageAppend(Message),
    /// Drop surfaced messages of a conversation up to `up_to` (inclusive)
    MessageExpire {
        converse_pub: PubKey,
        up_to: i64,
    },

    RequestAppend(Message),
    RequestAccept(Ulid),
    RequestDecline(Ulid),
    RequestRemoved(Ulid),

    GroupUpdate {
        uuid: Ulid,
        converse_pub: PubKey,
        descriptor: GroupDescriptor,
    },
}

/// A fresh message worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub converse_pub: PubKey,
    pub from_pub: PubKey,
    pub message_uuid: Ulid,
    pub timestamp: i64,
    pub preview: Option<String>,
}

/// Side effects derived by the projection, executed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write-through of a newer `last_timestamp`
    AdvanceTimestamp { uuid: Ulid, timestamp: i64 },
    Notify(Notification),
}

/// What [`crate::ChatClient::subscribe_events`] receivers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Event(ChatEvent),
    Notification(Notification),
}
