//! Graph store facade
//!
//! The shared store is a two-level map: a `node` (an owner namespace such as
//! `~{pub}/contacts`, or the public `#messages` space) holding `key -> bytes`
//! entries. Writing `None` is a tombstone.
//!
//! ```text
//! #messages             {recipientPub}-{bucket}-#{sha256}   identity-addressed
//!                       {linkPub}-#{sha256}                 chain links
//! ~{pub}/profile        alias | name | pub | epub           public, plain UTF-8
//! ~{pub}/contacts       contact-{uuid}                      sealed for the owner
//! ~{pub}/conversations  conversation-{uuid}                 sealed for the owner
//! ~{pub}/removed        {uuid}                              sealed for the owner
//! ~{admin}/groups       group-{groupPub}                    sealed for the group pair
//! ```
//!
//! Subscriptions deliver the current snapshot first, then every later change.
//! Delivery is at-least-once: a consumer may see the same value repeatedly.

mod local;

pub use local::LocalStore;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ChatResult;
use crate::subscription::Subscription;

/// Node holding every message envelope
pub const MESSAGES_NODE: &str = "#messages";

/// Address of one entry in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    pub node: String,
    pub key: String,
}

impl StorePath {
    pub fn new(node: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            key: key.into(),
        }
    }
}

/// Which keys of a node a query selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    /// Every key of the node
    All,
    /// One key
    Exact(String),
    /// A key range sharing a prefix (time buckets, chain links)
    Prefix(String),
}

impl KeyMatch {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatch::All => true,
            KeyMatch::Exact(k) => k == key,
            KeyMatch::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// A node plus a key match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub node: String,
    pub key: KeyMatch,
}

impl Query {
    pub fn all(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            key: KeyMatch::All,
        }
    }

    pub fn exact(node: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            key: KeyMatch::Exact(key.into()),
        }
    }

    pub fn prefix(node: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            key: KeyMatch::Prefix(prefix.into()),
        }
    }

    pub fn matches(&self, path: &StorePath) -> bool {
        self.node == path.node && self.key.matches(&path.key)
    }
}

/// One delivered entry; `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub path: StorePath,
    pub value: Option<Vec<u8>>,
}

/// Live feed of records for one query. Dropping it deregisters the listener.
pub struct StoreSubscription {
    rx: mpsc::UnboundedReceiver<StoreRecord>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl StoreSubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<StoreRecord>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Wait for the next record; `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<StoreRecord> {
        self.rx.recv().await
    }

    /// Records already queued (the snapshot, right after subscribing).
    pub fn drain_ready(&mut self) -> Vec<StoreRecord> {
        let mut ready = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            ready.push(record);
        }
        ready
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription").finish_non_exhaustive()
    }
}

/// Path-addressed put / read-once / subscribe against the shared graph.
///
/// Implementations never retry a failed write; the error goes to the caller.
pub trait GraphStore: Send + Sync {
    /// Write (or, with `None`, tombstone) one entry.
    fn put(&self, path: &StorePath, value: Option<Vec<u8>>) -> ChatResult<()>;

    /// Single-shot read of one entry.
    fn read_once(&self, path: &StorePath) -> ChatResult<Option<Vec<u8>>>;

    /// Snapshot plus live changes for every entry the query selects.
    fn subscribe(&self, query: Query) -> ChatResult<StoreSubscription>;
}

/// Feed a subscription into `handler` until `scope` is cancelled.
///
/// Records already queued at call time (the snapshot) are handled before this
/// returns; later ones on a spawned task. Nothing reaches `handler` after the
/// scope is cancelled, and the handler is dropped when the feed ends.
pub(crate) fn listen<F>(mut sub: StoreSubscription, scope: Subscription, mut handler: F)
where
    F: FnMut(StoreRecord) + Send + 'static,
{
    for record in sub.drain_ready() {
        if scope.is_cancelled() {
            return;
        }
        handler(record);
    }
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                record = sub.recv() => match record {
                    Some(record) => {
                        if scope.is_cancelled() {
                            break;
                        }
                        handler(record);
                    }
                    None => break,
                },
            }
        }
        trace!("Store listener finished");
    });
}

/// Node and key builders for every record kind.
pub mod paths {
    use crate::identity::PubKey;
    use ulid::Ulid;

    pub fn profile_node(pub_key: &PubKey) -> String {
        format!("~{}/profile", pub_key)
    }

    pub fn contacts_node(owner: &PubKey) -> String {
        format!("~{}/contacts", owner)
    }

    pub fn contact_key(uuid: &Ulid) -> String {
        format!("contact-{}", uuid)
    }

    pub fn conversations_node(owner: &PubKey) -> String {
        format!("~{}/conversations", owner)
    }

    pub fn conversation_key(uuid: &Ulid) -> String {
        format!("conversation-{}", uuid)
    }

    pub fn removed_node(owner: &PubKey) -> String {
        format!("~{}/removed", owner)
    }

    pub fn groups_node(admin: &PubKey) -> String {
        format!("~{}/groups", admin)
    }

    pub fn group_key(group_pub: &PubKey) -> String {
        format!("group-{}", group_pub)
    }

    /// Key range for identity-addressed messages in one time bucket.
    pub fn bucket_prefix(recipient: &PubKey, bucket: i64) -> String {
        format!("{}-{}-#", recipient, bucket)
    }

    /// Key range for messages at one chain link (no time bucket).
    pub fn link_prefix(link: &PubKey) -> String {
        format!("{}-#", link)
    }

    /// Parse `uuid` out of a `{prefix}{uuid}` key.
    pub fn uuid_after(key: &str, prefix: &str) -> Option<Ulid> {
        key.strip_prefix(prefix)
            .and_then(|s| Ulid::from_string(s).ok())
    }
}
