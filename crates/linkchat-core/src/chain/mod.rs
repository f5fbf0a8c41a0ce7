//! Message chain protocol
//!
//! Messages carry no sequence numbers. Each one names a fresh `next_pair`
//! whose public half is the address of the following message, so a
//! conversation is a linked list through the store:
//!
//! ```text
//! root_pair ──► msg1 (next_pair = L1) ──► msg2 (next_pair = L2) ──► ...
//! ```
//!
//! Two address families exist in the `#messages` node:
//!
//! - identity-addressed: `{recipientPub}-{bucket}-#{hash}`, encrypted for the
//!   recipient's long-lived identity. Used for invites and their replies, and
//!   discovered by watching the latest time buckets.
//! - link-addressed: `{linkPub}-#{hash}`, encrypted and signed with the link
//!   pair itself, which both sides hold.

mod message;

pub use message::{Content, Message, Payload, Rotation};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use ulid::Ulid;

use crate::config::ChatConfig;
use crate::crypto::{self, Signed};
use crate::error::{ChatError, ChatResult};
use crate::identity::{read_profile, EncPubKey, Keypair, Profile, PubKey};
use crate::store::{listen, paths, GraphStore, Query, StorePath, MESSAGES_NODE};
use crate::subscription::Subscription;
use message::Sealed;

const MIN_ROLLOVER_TICK_MS: i64 = 10;
const MAX_ROLLOVER_TICK_MS: i64 = 60_000;

/// Callback invoked once per delivered item (at-least-once).
pub type Consumer<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Index of the time bucket containing `timestamp_ms`.
pub fn time_bucket(timestamp_ms: i64, width_ms: i64) -> i64 {
    timestamp_ms.div_euclid(width_ms)
}

/// Public components of a recipient identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub pub_key: PubKey,
    pub epub: EncPubKey,
}

impl From<&Profile> for Address {
    fn from(profile: &Profile) -> Self {
        Self {
            pub_key: profile.pub_key.clone(),
            epub: profile.epub.clone(),
        }
    }
}

/// How a message is addressed and keyed.
#[derive(Debug, Clone)]
pub enum Route {
    /// To a long-lived identity, signed by our own identity
    Identity(Address),
    /// At a chain link, signed and encrypted with the link pair
    Link(Keypair),
}

/// Releases a link's memo entry once its listener ends, unless a live
/// traversal has claimed the link again in the meantime.
struct ActiveLink {
    links: Arc<Mutex<HashMap<PubKey, Subscription>>>,
    pub_key: PubKey,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        let mut links = self.links.lock();
        if links.get(&self.pub_key).is_some_and(Subscription::is_cancelled) {
            links.remove(&self.pub_key);
        }
    }
}

/// Sends, discovers and follows messages for one local identity.
#[derive(Clone)]
pub struct MessageChain {
    me: Keypair,
    store: Arc<dyn GraphStore>,
    bucket_width_ms: i64,
    discovery_buckets: u32,
    /// Links with a live listener, keyed by link pub, valued by the handle
    /// of the traversal owning them
    active_links: Arc<Mutex<HashMap<PubKey, Subscription>>>,
}

impl MessageChain {
    /// Fails with [`ChatError::Config`] when the bucket settings are unusable.
    pub fn new(me: Keypair, store: Arc<dyn GraphStore>, config: &ChatConfig) -> ChatResult<Self> {
        config.validate()?;
        Ok(Self {
            me,
            store,
            bucket_width_ms: config.bucket_width_ms,
            discovery_buckets: config.discovery_buckets,
            active_links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn me(&self) -> &Keypair {
        &self.me
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt, sign and store one message; returns the stored record.
    ///
    /// The next link is a fresh pair, unless the content is a request
    /// carrying its own pair.
    pub fn send_message(
        &self,
        route: Route,
        converse_pub: &PubKey,
        payload: Payload,
    ) -> ChatResult<Message> {
        let next_pair = match &payload {
            Payload::Plain(Content::Request {
                next_pair: Some(pair),
                ..
            }) => pair.clone(),
            _ => Keypair::generate(),
        };
        let timestamp = now_ms();

        let (signer, secret, prefix) = match &route {
            Route::Identity(to) => {
                let secret = crypto::derive_secret(&to.epub, &self.me).ok_or_else(|| {
                    ChatError::InvalidContact(format!("{}: unusable epub", to.pub_key))
                })?;
                let bucket = time_bucket(timestamp, self.bucket_width_ms);
                (&self.me, secret, paths::bucket_prefix(&to.pub_key, bucket))
            }
            Route::Link(link) => {
                let secret = crypto::derive_secret(link.epub(), link).ok_or_else(|| {
                    ChatError::Crypto(format!("{}: unusable link pair", link.pub_key()))
                })?;
                (link, secret, paths::link_prefix(link.pub_key()))
            }
        };

        let message = Message {
            uuid: Ulid::new(),
            payload,
            converse_pub: converse_pub.clone(),
            from_pub: self.me.pub_key().clone(),
            encrypt_pub: signer.pub_key().clone(),
            next_pair,
            timestamp,
        };

        let sealed = Sealed {
            encrypted: crypto::encrypt(&postcard::to_allocvec(&message)?, &secret)?,
            origin: signer.epub().clone(),
        };
        let signed = crypto::sign(postcard::to_allocvec(&sealed)?, signer);
        let value = postcard::to_allocvec(&signed)?;
        let key = format!("{}{}", prefix, crypto::hash(&value));

        self.store
            .put(&StorePath::new(MESSAGES_NODE, key), Some(value))
            .inspect_err(|e| warn!(uuid = %message.uuid, error = %e, "Failed to store message"))?;
        debug!(uuid = %message.uuid, converse = %converse_pub.short(), "Sent message");
        Ok(message)
    }

    /// Identity-addressed send, resolving the recipient's published profile.
    pub fn send_message_to_user(
        &self,
        to: &PubKey,
        converse_pub: &PubKey,
        payload: Payload,
    ) -> ChatResult<Message> {
        let profile = read_profile(self.store.as_ref(), to)?
            .ok_or_else(|| ChatError::InvalidContact(format!("{}: no published profile", to)))?;
        self.send_message(Route::Identity(Address::from(&profile)), converse_pub, payload)
    }

    /// Identity-addressed send whose content is sealed a second time for the
    /// recipient, carrying `renew_pair` as the chain's next link.
    pub fn send_rotated(
        &self,
        to: &PubKey,
        converse_pub: &PubKey,
        renew_pair: Keypair,
        content: Content,
    ) -> ChatResult<Message> {
        let profile = read_profile(self.store.as_ref(), to)?
            .ok_or_else(|| ChatError::InvalidContact(format!("{}: no published profile", to)))?;
        let secret = crypto::derive_secret(&profile.epub, &self.me)
            .ok_or_else(|| ChatError::InvalidContact(format!("{}: unusable epub", to)))?;
        let rotation = Rotation {
            renew_pair,
            content,
        };
        let payload = Payload::Rotated {
            origin: self.me.epub().clone(),
            sealed: crypto::encrypt(&postcard::to_allocvec(&rotation)?, &secret)?,
        };
        self.send_message(Route::Identity(Address::from(&profile)), converse_pub, payload)
    }

    /// Continue an established chain at `link`.
    pub fn send_next_message(
        &self,
        link: &Keypair,
        converse_pub: &PubKey,
        content: Content,
    ) -> ChatResult<Message> {
        self.send_message(Route::Link(link.clone()), converse_pub, Payload::Plain(content))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Opening
    // ═══════════════════════════════════════════════════════════════════════

    fn open_envelope(value: &[u8]) -> Option<(PubKey, Sealed)> {
        let signed: Signed = postcard::from_bytes(value).ok()?;
        let data = crypto::verify(&signed, &signed.signer)?;
        let sealed = postcard::from_bytes(&data).ok()?;
        Some((signed.signer, sealed))
    }

    /// Open the inner layer of a rotated payload addressed to our identity.
    fn unwrap_rotation(&self, message: Message) -> Option<Message> {
        let Payload::Rotated { origin, sealed } = &message.payload else {
            return Some(message);
        };
        let secret = crypto::derive_secret(origin, &self.me)?;
        let rotation: Rotation = postcard::from_bytes(&crypto::decrypt(sealed, &secret)?).ok()?;
        Some(Message {
            payload: Payload::Plain(rotation.content),
            next_pair: rotation.renew_pair,
            ..message
        })
    }

    /// Decode an identity-addressed envelope sent to us.
    ///
    /// The signer must be the claimed sender. A rotated payload must open for
    /// our identity, and its renew pair overrides the outer `next_pair`.
    pub fn open_identity_message(&self, value: &[u8]) -> Option<Message> {
        let (signer, sealed) = Self::open_envelope(value)?;
        let secret = crypto::derive_secret(&sealed.origin, &self.me)?;
        let plain = crypto::decrypt(&sealed.encrypted, &secret)?;
        let message: Message = postcard::from_bytes(&plain).ok()?;
        if message.from_pub != signer || message.encrypt_pub != signer {
            trace!(uuid = %message.uuid, "Dropping message signed by someone else");
            return None;
        }
        self.unwrap_rotation(message)
    }

    /// Decode a message stored at `link`. Rotated payloads that are not for
    /// us stay opaque.
    pub fn open_link_message(&self, link: &Keypair, value: &[u8]) -> Option<Message> {
        let (signer, sealed) = Self::open_envelope(value)?;
        if &signer != link.pub_key() {
            return None;
        }
        let secret = crypto::derive_secret(link.epub(), link)?;
        let plain = crypto::decrypt(&sealed.encrypted, &secret)?;
        let message: Message = postcard::from_bytes(&plain).ok()?;
        if &message.encrypt_pub != link.pub_key() {
            return None;
        }
        match message.payload {
            Payload::Plain(_) => Some(message),
            Payload::Rotated { .. } => Some(self.unwrap_rotation(message.clone()).unwrap_or(message)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscribing
    // ═══════════════════════════════════════════════════════════════════════

    /// Watch the latest time buckets of our own inbox.
    ///
    /// The window slides with the clock: when a new bucket begins it is
    /// opened, and the bucket that falls out of the window is closed.
    pub fn get_my_message(
        &self,
        scope: &Subscription,
        consumer: Consumer<Message>,
    ) -> ChatResult<Subscription> {
        let handle = scope.child();
        let current = time_bucket(now_ms(), self.bucket_width_ms);
        let mut open = BTreeMap::new();

        for offset in (0..self.discovery_buckets).rev() {
            let bucket = current - i64::from(offset);
            match self.watch_bucket(bucket, &handle, &consumer) {
                Ok(bucket_handle) => {
                    open.insert(bucket, bucket_handle);
                }
                Err(e) => {
                    handle.cancel();
                    return Err(e);
                }
            }
        }

        let chain = self.clone();
        let driver = handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(chain.rollover_tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = driver.cancelled() => break,
                    _ = ticker.tick() => chain.slide_window(&mut open, &driver, &consumer),
                }
            }
            trace!("Inbox window driver finished");
        });
        Ok(handle)
    }

    fn watch_bucket(
        &self,
        bucket: i64,
        scope: &Subscription,
        consumer: &Consumer<Message>,
    ) -> ChatResult<Subscription> {
        let query = Query::prefix(MESSAGES_NODE, paths::bucket_prefix(self.me.pub_key(), bucket));
        let sub = self.store.subscribe(query)?;
        let handle = scope.child();
        debug!(bucket, "Watching inbox bucket");

        let chain = self.clone();
        let consumer = consumer.clone();
        listen(sub, handle.clone(), move |record| {
            let Some(value) = record.value else { return };
            match chain.open_identity_message(&value) {
                Some(message) => consumer(message),
                None => trace!(key = %record.path.key, "Inbox record not for us"),
            }
        });
        Ok(handle)
    }

    /// Open every bucket that began since the last tick and close the ones
    /// older than the discovery window.
    fn slide_window(
        &self,
        open: &mut BTreeMap<i64, Subscription>,
        scope: &Subscription,
        consumer: &Consumer<Message>,
    ) {
        let current = time_bucket(now_ms(), self.bucket_width_ms);
        let oldest = current - i64::from(self.discovery_buckets) + 1;
        let newest = open.keys().next_back().copied().unwrap_or(oldest - 1);
        if newest >= current {
            return;
        }

        for bucket in (newest + 1).max(oldest)..=current {
            match self.watch_bucket(bucket, scope, consumer) {
                Ok(handle) => {
                    open.insert(bucket, handle);
                }
                // Retried on the next tick
                Err(e) => {
                    warn!(bucket, error = %e, "Failed to watch inbox bucket");
                    return;
                }
            }
        }

        let kept = open.split_off(&oldest);
        for (bucket, handle) in std::mem::replace(open, kept) {
            handle.cancel();
            debug!(bucket, "Closed inbox bucket");
        }
    }

    /// How often the inbox window checks for a new bucket.
    fn rollover_tick(&self) -> Duration {
        let millis = (self.bucket_width_ms / 4).clamp(MIN_ROLLOVER_TICK_MS, MAX_ROLLOVER_TICK_MS);
        Duration::from_millis(millis.unsigned_abs())
    }

    /// Watch the messages stored at one link, without following further.
    pub fn get_next_message(
        &self,
        link: &Keypair,
        scope: &Subscription,
        consumer: Consumer<Message>,
    ) -> ChatResult<Subscription> {
        let handle = scope.child();
        let sub = self
            .store
            .subscribe(Query::prefix(MESSAGES_NODE, paths::link_prefix(link.pub_key())))?;

        let chain = self.clone();
        let link = link.clone();
        listen(sub, handle.clone(), move |record| {
            let Some(value) = record.value else { return };
            if let Some(message) = chain.open_link_message(&link, &value) {
                consumer(message);
            }
        });
        Ok(handle)
    }

    fn is_active(&self, pub_key: &PubKey) -> bool {
        self.active_links
            .lock()
            .get(pub_key)
            .is_some_and(|owner| !owner.is_cancelled())
    }

    /// Follow a chain from `start`, live, through every later link.
    ///
    /// Each link is opened at most once while some traversal holds it, so a
    /// repeated call (or a re-delivered message) never duplicates a
    /// subscription. Cancelling the returned handle stops every link opened
    /// beneath it.
    pub fn get_next_message_recursive(
        &self,
        start: &Keypair,
        scope: &Subscription,
        consumer: Consumer<Message>,
    ) -> ChatResult<Subscription> {
        if self.is_active(start.pub_key()) {
            debug!(link = %start.pub_key().short(), "Chain already followed");
            return Ok(scope.child());
        }

        let handle = scope.child();
        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<Keypair>();
        self.open_link(start.clone(), &handle, &work_tx, &consumer)?;

        let chain = self.clone();
        let driver = handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = driver.cancelled() => break,
                    next = work_rx.recv() => match next {
                        Some(pair) => {
                            if let Err(e) = chain.open_link(pair, &driver, &work_tx, &consumer) {
                                warn!(error = %e, "Failed to follow chain link");
                            }
                        }
                        None => break,
                    },
                }
            }
            trace!("Chain traversal stopped");
        });
        Ok(handle)
    }

    fn open_link(
        &self,
        link: Keypair,
        handle: &Subscription,
        work_tx: &mpsc::UnboundedSender<Keypair>,
        consumer: &Consumer<Message>,
    ) -> ChatResult<()> {
        {
            let mut active = self.active_links.lock();
            if active
                .get(link.pub_key())
                .is_some_and(|owner| !owner.is_cancelled())
            {
                return Ok(());
            }
            active.insert(link.pub_key().clone(), handle.clone());
        }

        let query = Query::prefix(MESSAGES_NODE, paths::link_prefix(link.pub_key()));
        let sub = match self.store.subscribe(query) {
            Ok(sub) => sub,
            Err(e) => {
                self.active_links.lock().remove(link.pub_key());
                return Err(e);
            }
        };
        trace!(link = %link.pub_key().short(), "Following chain link");

        let guard = ActiveLink {
            links: self.active_links.clone(),
            pub_key: link.pub_key().clone(),
        };
        let chain = self.clone();
        let work_tx = work_tx.clone();
        let consumer = consumer.clone();
        listen(sub, handle.clone(), move |record| {
            let _held = &guard;
            let Some(value) = record.value else { return };
            let Some(message) = chain.open_link_message(&link, &value) else {
                trace!(key = %record.path.key, "Undecryptable record at link");
                return;
            };
            let _ = work_tx.send(message.next_pair.clone());
            consumer(message);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::store::LocalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup() -> Arc<LocalStore> {
        Arc::new(LocalStore::in_memory().unwrap())
    }

    fn peer(store: &Arc<LocalStore>, alias: &str) -> MessageChain {
        peer_with(store, alias, &ChatConfig::default())
    }

    fn peer_with(store: &Arc<LocalStore>, alias: &str, config: &ChatConfig) -> MessageChain {
        let identity = Identity::generate(alias);
        identity.publish_profile(store.as_ref()).unwrap();
        let shared: Arc<dyn GraphStore> = store.clone();
        MessageChain::new(identity.pair().clone(), shared, config).unwrap()
    }

    fn collector() -> (Consumer<Message>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: Consumer<Message> = Arc::new(move |m: Message| {
            let _ = tx.send(m);
        });
        (consumer, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[test]
    fn test_time_bucket() {
        let width = ChatConfig::default().bucket_width_ms;
        assert_eq!(time_bucket(0, width), 0);
        assert_eq!(time_bucket(width - 1, width), 0);
        assert_eq!(time_bucket(width, width), 1);
        assert_eq!(time_bucket(-1, width), -1);
    }

    #[test]
    fn test_identity_message_roundtrip() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let eve = peer(&store, "eve");

        let sent = alice
            .send_message_to_user(
                bob.me().pub_key(),
                bob.me().pub_key(),
                Payload::Plain(Content::text("hello")),
            )
            .unwrap();

        let mut sub = store
            .subscribe(Query::prefix(MESSAGES_NODE, format!("{}-", bob.me().pub_key())))
            .unwrap();
        let record = sub.drain_ready().pop().unwrap();
        let value = record.value.unwrap();

        assert_eq!(bob.open_identity_message(&value), Some(sent));
        assert!(eve.open_identity_message(&value).is_none());
    }

    #[test]
    fn test_send_to_unknown_user_fails() {
        let store = setup();
        let alice = peer(&store, "alice");
        let stranger = Keypair::generate();
        let result = alice.send_message_to_user(
            stranger.pub_key(),
            stranger.pub_key(),
            Payload::Plain(Content::text("hi")),
        );
        assert!(matches!(result, Err(ChatError::InvalidContact(_))));
    }

    #[test]
    fn test_request_pair_becomes_next_link() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let group = Keypair::generate();

        let sent = alice
            .send_message_to_user(
                bob.me().pub_key(),
                group.pub_key(),
                Payload::Plain(Content::Request {
                    text: "join".into(),
                    member_pubs: Some(vec![bob.me().pub_key().clone()]),
                    next_pair: Some(group.clone()),
                    name: Some("crew".into()),
                }),
            )
            .unwrap();
        assert_eq!(sent.next_pair, group);
    }

    #[tokio::test]
    async fn test_rotated_reply_renews_next_pair() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let renew = Keypair::generate();

        let (consumer, mut rx) = collector();
        let scope = Subscription::new();
        alice.get_my_message(&scope, consumer).unwrap();

        let request_uuid = Ulid::new();
        let sent = bob
            .send_rotated(
                alice.me().pub_key(),
                alice.me().pub_key(),
                renew.clone(),
                Content::Accept {
                    request_uuid,
                    text: "ok".into(),
                },
            )
            .unwrap();
        assert!(sent.content().is_none());

        let received = next(&mut rx).await;
        assert_eq!(received.uuid, sent.uuid);
        assert_eq!(received.next_pair, renew);
        assert_eq!(
            received.content(),
            Some(&Content::Accept {
                request_uuid,
                text: "ok".into()
            })
        );
    }

    #[tokio::test]
    async fn test_get_next_message_single_link() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let link = Keypair::generate();

        let first = alice
            .send_next_message(&link, bob.me().pub_key(), Content::text("one"))
            .unwrap();
        // Continuing at the next link is not picked up
        alice
            .send_next_message(&first.next_pair, bob.me().pub_key(), Content::text("two"))
            .unwrap();

        let (consumer, mut rx) = collector();
        let handle = bob.get_next_message(&link, &Subscription::new(), consumer).unwrap();
        assert_eq!(next(&mut rx).await.uuid, first.uuid);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_recursive_follows_chain_live() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let root = Keypair::generate();

        let m1 = alice
            .send_next_message(&root, bob.me().pub_key(), Content::text("one"))
            .unwrap();
        let m2 = bob
            .send_next_message(&m1.next_pair, alice.me().pub_key(), Content::text("two"))
            .unwrap();

        let (consumer, mut rx) = collector();
        let handle = bob
            .get_next_message_recursive(&root, &Subscription::new(), consumer)
            .unwrap();
        assert_eq!(next(&mut rx).await.uuid, m1.uuid);
        assert_eq!(next(&mut rx).await.uuid, m2.uuid);

        let m3 = alice
            .send_next_message(&m2.next_pair, bob.me().pub_key(), Content::text("three"))
            .unwrap();
        assert_eq!(next(&mut rx).await.uuid, m3.uuid);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_recursive_twice_opens_one_subscription() {
        let store = setup();
        let bob = peer(&store, "bob");
        let root = Keypair::generate();
        let scope = Subscription::new();
        let noop: Consumer<Message> = Arc::new(|_: Message| {});

        let before = store.subscribe_count();
        bob.get_next_message_recursive(&root, &scope, noop.clone()).unwrap();
        bob.get_next_message_recursive(&root, &scope, noop).unwrap();
        assert_eq!(store.subscribe_count(), before + 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_callbacks() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let root = Keypair::generate();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let consumer: Consumer<Message> = Arc::new(move |_: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = bob
            .get_next_message_recursive(&root, &Subscription::new(), consumer)
            .unwrap();
        handle.cancel();

        let m1 = alice
            .send_next_message(&root, bob.me().pub_key(), Content::text("late"))
            .unwrap();
        alice
            .send_next_message(&m1.next_pair, bob.me().pub_key(), Content::text("later"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_chain_can_be_followed_again() {
        let store = setup();
        let alice = peer(&store, "alice");
        let bob = peer(&store, "bob");
        let root = Keypair::generate();
        let sent = alice
            .send_next_message(&root, bob.me().pub_key(), Content::text("again"))
            .unwrap();

        let noop: Consumer<Message> = Arc::new(|_: Message| {});
        let first = bob
            .get_next_message_recursive(&root, &Subscription::new(), noop)
            .unwrap();
        first.cancel();

        let (consumer, mut rx) = collector();
        bob.get_next_message_recursive(&root, &Subscription::new(), consumer)
            .unwrap();
        assert_eq!(next(&mut rx).await.uuid, sent.uuid);
    }

    #[test]
    fn test_link_message_rejects_foreign_link() {
        let store = setup();
        let alice = peer(&store, "alice");
        let link = Keypair::generate();
        let other = Keypair::generate();
        alice
            .send_next_message(&link, alice.me().pub_key(), Content::text("x"))
            .unwrap();

        let mut sub = store
            .subscribe(Query::prefix(MESSAGES_NODE, paths::link_prefix(link.pub_key())))
            .unwrap();
        let value = sub.drain_ready().pop().unwrap().value.unwrap();
        assert!(alice.open_link_message(&link, &value).is_some());
        assert!(alice.open_link_message(&other, &value).is_none());
    }

    #[test]
    fn test_zero_bucket_width_rejected() {
        let store = setup();
        let shared: Arc<dyn GraphStore> = store.clone();
        let config = ChatConfig {
            bucket_width_ms: 0,
            ..ChatConfig::default()
        };
        let result = MessageChain::new(Keypair::generate(), shared, &config);
        assert!(matches!(result, Err(ChatError::Config(_))));
    }

    #[tokio::test]
    async fn test_inbox_window_follows_new_buckets() {
        let store = setup();
        let config = ChatConfig {
            bucket_width_ms: 200,
            ..ChatConfig::default()
        };
        let alice = peer_with(&store, "alice", &config);
        let bob = peer_with(&store, "bob", &config);

        let (consumer, mut rx) = collector();
        let scope = Subscription::new();
        bob.get_my_message(&scope, consumer).unwrap();
        assert_eq!(store.listener_count(), 2);

        // Well past the buckets open at subscribe time
        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = alice
            .send_message_to_user(
                bob.me().pub_key(),
                bob.me().pub_key(),
                Payload::Plain(Content::text("after rollover")),
            )
            .unwrap();
        assert_eq!(next(&mut rx).await, sent);

        // Buckets leaving the window are closed
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while store.listener_count() != 2 {
            assert!(std::time::Instant::now() < deadline, "inbox window kept stale buckets");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        scope.cancel();
    }
}
