//! Message records and their wire envelope
//!
//! ```text
//! store value = postcard(Signed { data, signer, signature })
//!   data      = postcard(Sealed { encrypted, origin })
//!   encrypted = AEAD(postcard(Message), derive_secret(..))
//!
//! Payload::Plain(Content)                       readable with the link secret
//! Payload::Rotated { origin, sealed }           second layer, sealed for the
//!   sealed = AEAD(postcard(Rotation), ..)       final recipient's identity
//! ```

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::identity::{EncPubKey, Keypair, PubKey};

/// What a message says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Text {
        text: String,
    },
    /// Invitation to a conversation. A group invite lists its members and
    /// carries the group pair, which also becomes the chain's next link.
    Request {
        text: String,
        member_pubs: Option<Vec<PubKey>>,
        next_pair: Option<Keypair>,
        name: Option<String>,
    },
    /// Reply to a request, sent back to the inviter's identity.
    Accept {
        request_uuid: Ulid,
        text: String,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Content::Request { .. })
    }

    /// Members of a group invite.
    pub fn member_pubs(&self) -> Option<&[PubKey]> {
        match self {
            Content::Request {
                member_pubs: Some(members),
                ..
            } => Some(members),
            _ => None,
        }
    }

    /// Human-readable body, if any.
    pub fn body(&self) -> &str {
        match self {
            Content::Text { text } | Content::Request { text, .. } | Content::Accept { text, .. } => {
                text
            }
        }
    }
}

/// Inner layer of a rotated payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotation {
    /// Replaces the outer `next_pair` once the inner layer is opened
    pub renew_pair: Keypair,
    pub content: Content,
}

/// Message body: plain, or re-encrypted for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Plain(Content),
    Rotated {
        /// Agreement key of the identity that sealed the inner layer
        origin: EncPubKey,
        sealed: Vec<u8>,
    },
}

/// One immutable link of a conversation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Ulid,
    pub payload: Payload,
    /// Counterpart identity of the conversation (a group's pub for groups)
    pub converse_pub: PubKey,
    /// Sender's long-lived identity
    pub from_pub: PubKey,
    /// Pair that signed and encrypted this message
    pub encrypt_pub: PubKey,
    /// Address of the next message in this chain
    pub next_pair: Keypair,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Message {
    /// Readable content; `None` while the payload is still rotated.
    pub fn content(&self) -> Option<&Content> {
        match &self.payload {
            Payload::Plain(content) => Some(content),
            Payload::Rotated { .. } => None,
        }
    }

    /// The identity this message is "with", seen from `me`.
    ///
    /// Our own messages point at their `converse_pub`; messages addressed to
    /// us point back at the sender; anything else (group traffic) belongs to
    /// its `converse_pub`.
    pub fn target(&self, me: &PubKey) -> PubKey {
        if &self.from_pub == me {
            self.converse_pub.clone()
        } else if &self.converse_pub == me {
            self.from_pub.clone()
        } else {
            self.converse_pub.clone()
        }
    }
}

/// Encrypted message plus the agreement key needed to open it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Sealed {
    pub encrypted: Vec<u8>,
    pub origin: EncPubKey,
}
