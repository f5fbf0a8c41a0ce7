//! Integration tests for the chat client
//!
//! Two or three `ChatClient`s share one in-memory `LocalStore`, the way peers
//! share one graph. Every assertion waits on the client's projection, since
//! delivery through the store is asynchronous.

use std::sync::Arc;
use std::time::{Duration, Instant};

use linkchat_core::{
    ChatClient, ChatConfig, ClientEvent, Content, GraphStore, Identity, LocalStore, Projection,
    PubKey,
};
use tokio::sync::broadcast;

// ============================================================================
// Helpers
// ============================================================================

fn client(store: &Arc<LocalStore>, alias: &str) -> ChatClient {
    let _ = tracing_subscriber::fmt::try_init();
    let shared: Arc<dyn GraphStore> = store.clone();
    let client = ChatClient::new(Identity::generate(alias), shared, ChatConfig::default())
        .expect("client should build");
    client.start().expect("client should start");
    client
}

/// Poll `client`'s projection until `check` holds.
async fn wait_until<F>(client: &ChatClient, what: &str, check: F) -> Projection
where
    F: Fn(&Projection) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        client.flush().await;
        let snapshot = client.snapshot();
        if check(&snapshot) {
            return snapshot;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn pending_request(client: &ChatClient) -> ulid::Ulid {
    let snapshot = wait_until(client, "a pending request", |p| {
        !p.requests.requests().is_empty()
    })
    .await;
    snapshot.requests.requests()[0].uuid
}

fn texts(projection: &Projection, converse_pub: &PubKey) -> Vec<String> {
    projection
        .messages
        .for_conversation(projection.me(), converse_pub)
        .filter_map(|m| m.content().map(|c| c.body().to_string()))
        .collect()
}

fn drain_notifications(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ulid::Ulid> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ClientEvent::Notification(n) = event {
            seen.push(n.message_uuid);
        }
    }
    seen
}

/// Alice invites Bob to a direct conversation and Bob accepts.
async fn connected_pair(store: &Arc<LocalStore>) -> (ChatClient, ChatClient) {
    let alice = client(store, "alice");
    let bob = client(store, "bob");

    alice.send_request(bob.pub_key(), "hi bob").unwrap();
    let uuid = pending_request(&bob).await;
    bob.accept_request(&uuid).unwrap();

    wait_until(&alice, "bob as a contact", |p| {
        p.contacts.find(bob.pub_key()).is_some() && p.conversations.find(bob.pub_key()).is_some()
    })
    .await;
    wait_until(&bob, "alice as a contact", |p| {
        p.contacts.find(alice.pub_key()).is_some()
            && p.conversations.find(alice.pub_key()).is_some()
    })
    .await;
    (alice, bob)
}

// ============================================================================
// Direct conversations
// ============================================================================

#[tokio::test]
async fn test_request_lists_invite_for_recipient() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");

    let conversation = alice.send_request(bob.pub_key(), "hi bob").unwrap();
    assert_eq!(&conversation.converse_pub, bob.pub_key());

    let snapshot = wait_until(&bob, "the request", |p| !p.requests.requests().is_empty()).await;
    let request = &snapshot.requests.requests()[0];
    assert_eq!(&request.from_pub, alice.pub_key());
    assert!(matches!(request.content(), Some(Content::Request { text, .. }) if text == "hi bob"));
}

#[tokio::test]
async fn test_two_peers_exchange_messages() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let (alice, bob) = connected_pair(&store).await;

    alice.send_text(bob.pub_key(), "first").unwrap();
    wait_until(&bob, "alice's message", |p| {
        texts(p, alice.pub_key()) == vec!["first".to_string()]
    })
    .await;

    // Distinct millisecond timestamps keep the expected order
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.send_text(alice.pub_key(), "second").unwrap();
    let snapshot = wait_until(&alice, "bob's reply", |p| texts(p, bob.pub_key()).len() == 2).await;
    assert_eq!(texts(&snapshot, bob.pub_key()), vec!["first", "second"]);
}

#[tokio::test]
async fn test_accepted_request_is_not_listed_again() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let (_alice, bob) = connected_pair(&store).await;

    let snapshot = wait_until(&bob, "the request to leave", |p| {
        p.requests.requests().is_empty()
    })
    .await;
    assert_eq!(snapshot.removed.uuids().len(), 1);

    // A fresh client for the same identity reloads the removed-set first
    let shared: Arc<dyn GraphStore> = store.clone();
    let reloaded =
        ChatClient::new(bob.identity().clone(), shared, ChatConfig::default()).unwrap();
    reloaded.start().unwrap();
    let snapshot = wait_until(&reloaded, "the conversation", |p| {
        p.conversations.is_initialized() && !p.conversations.conversations().is_empty()
    })
    .await;
    assert!(snapshot.requests.requests().is_empty());
}

#[tokio::test]
async fn test_declined_request_creates_nothing() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");

    alice.send_request(bob.pub_key(), "hi").unwrap();
    let uuid = pending_request(&bob).await;
    bob.decline_request(&uuid).unwrap();

    let snapshot = wait_until(&bob, "the request to leave", |p| {
        p.requests.requests().is_empty()
    })
    .await;
    assert!(snapshot.conversations.conversations().is_empty());
    assert!(snapshot.contacts.find(alice.pub_key()).is_none());
}

#[tokio::test]
async fn test_request_to_unknown_identity_reports_error() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let stranger = linkchat_core::Keypair::generate();

    assert!(alice.send_request(stranger.pub_key(), "hi").is_err());
    let snapshot = wait_until(&alice, "the request error", |p| {
        !p.conversations.errors().is_empty()
    })
    .await;
    assert!(snapshot.conversations.errors().contains_key(stranger.pub_key()));
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_redelivered_message_notifies_once() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let (alice, bob) = connected_pair(&store).await;
    let mut events = bob.subscribe_events();

    let sent = alice.send_text(bob.pub_key(), "ping").unwrap();
    wait_until(&bob, "the message", |p| texts(p, alice.pub_key()).len() == 1).await;

    // Following the chain again from its root delivers every link again
    bob.replay_history(alice.pub_key()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.flush().await;

    assert_eq!(drain_notifications(&mut events), vec![sent.uuid]);
    assert_eq!(texts(&bob.snapshot(), alice.pub_key()).len(), 1);
}

#[tokio::test]
async fn test_selected_conversation_advances_instead_of_notifying() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let (alice, bob) = connected_pair(&store).await;
    bob.select_conversation(alice.pub_key(), None);
    let mut events = bob.subscribe_events();

    let sent = alice.send_text(bob.pub_key(), "seen right away").unwrap();
    wait_until(&bob, "the advanced timestamp", |p| {
        p.conversations
            .find(alice.pub_key())
            .is_some_and(|c| c.last_timestamp == sent.timestamp)
    })
    .await;
    assert!(drain_notifications(&mut events).is_empty());
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn test_expire_then_replay_restores_history() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let (alice, bob) = connected_pair(&store).await;

    alice.send_text(bob.pub_key(), "one").unwrap();
    wait_until(&alice, "own message", |p| texts(p, bob.pub_key()).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.send_text(bob.pub_key(), "two").unwrap();
    wait_until(&bob, "both messages", |p| texts(p, alice.pub_key()).len() == 2).await;

    assert!(bob.expire_messages(alice.pub_key()).unwrap());
    wait_until(&bob, "collapsed history", |p| texts(p, alice.pub_key()).is_empty()).await;

    bob.replay_history(alice.pub_key()).unwrap();
    let snapshot = wait_until(&bob, "restored history", |p| {
        texts(p, alice.pub_key()).len() == 2
    })
    .await;
    assert_eq!(texts(&snapshot, alice.pub_key()), vec!["one", "two"]);
}

// ============================================================================
// Groups
// ============================================================================

#[tokio::test]
async fn test_group_invite_accept_adds_members() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");
    let carol = client(&store, "carol");
    let members = vec![bob.pub_key().clone(), carol.pub_key().clone()];

    let group = alice
        .send_group_requests(&members, "join us", Some("crew".into()))
        .unwrap();
    assert_eq!(group.admin_pub.as_ref(), Some(alice.pub_key()));

    let uuid = pending_request(&bob).await;
    bob.accept_request(&uuid).unwrap();

    let snapshot = wait_until(&bob, "the group and its members", |p| {
        p.conversations.find(&group.converse_pub).is_some()
            && p.contacts.find(carol.pub_key()).is_some()
    })
    .await;
    let joined = snapshot.conversations.find(&group.converse_pub).unwrap();
    assert_eq!(joined.admin_pub.as_ref(), Some(alice.pub_key()));
    assert_eq!(joined.member_pubs.as_deref(), Some(&members[..]));
    assert_eq!(joined.name.as_deref(), Some("crew"));
    assert!(snapshot.contacts.find(bob.pub_key()).is_none());
}

#[tokio::test]
async fn test_group_messages_reach_every_member() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");
    let carol = client(&store, "carol");
    let members = vec![bob.pub_key().clone(), carol.pub_key().clone()];
    let group = alice.send_group_requests(&members, "join", None).unwrap();

    for member in [&bob, &carol] {
        let uuid = pending_request(member).await;
        member.accept_request(&uuid).unwrap();
        wait_until(member, "the group", |p| {
            p.conversations.find(&group.converse_pub).is_some()
        })
        .await;
    }
    wait_until(&alice, "the group on the admin side", |p| {
        p.conversations.find(&group.converse_pub).is_some()
    })
    .await;

    bob.send_text(&group.converse_pub, "hello all").unwrap();
    for member in [&alice, &carol] {
        wait_until(member, "bob's group message", |p| {
            texts(p, &group.converse_pub) == vec!["hello all".to_string()]
        })
        .await;
    }
}

#[tokio::test]
async fn test_group_rename_propagates() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");
    let group = alice
        .send_group_requests(&[bob.pub_key().clone()], "join", Some("old".into()))
        .unwrap();
    let uuid = pending_request(&bob).await;
    bob.accept_request(&uuid).unwrap();
    wait_until(&bob, "the group", |p| {
        p.conversations.find(&group.converse_pub).is_some()
    })
    .await;

    alice.rename_group(&group.converse_pub, "new").unwrap();
    wait_until(&bob, "the new name", |p| {
        p.conversations
            .find(&group.converse_pub)
            .is_some_and(|c| c.name.as_deref() == Some("new"))
    })
    .await;

    // Only the admin may rename
    assert!(bob.rename_group(&group.converse_pub, "mine").is_err());
}

#[tokio::test]
async fn test_deleted_group_not_resurrected_by_rename() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");
    let group = alice
        .send_group_requests(&[bob.pub_key().clone()], "join", Some("old".into()))
        .unwrap();
    let uuid = pending_request(&bob).await;
    bob.accept_request(&uuid).unwrap();
    wait_until(&bob, "the group", |p| {
        p.conversations.find(&group.converse_pub).is_some()
    })
    .await;

    bob.delete_conversation(&group.converse_pub).unwrap();
    wait_until(&bob, "the group to disappear", |p| {
        p.conversations.find(&group.converse_pub).is_none()
    })
    .await;

    alice.rename_group(&group.converse_pub, "renamed").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.flush().await;
    assert!(bob.snapshot().conversations.find(&group.converse_pub).is_none());
}

#[tokio::test]
async fn test_late_accept_does_not_restore_deleted_group() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");
    let group = alice
        .send_group_requests(&[bob.pub_key().clone()], "join", Some("crew".into()))
        .unwrap();
    wait_until(&alice, "the group", |p| {
        p.conversations.find(&group.converse_pub).is_some()
    })
    .await;

    alice.delete_conversation(&group.converse_pub).unwrap();
    wait_until(&alice, "the group to disappear", |p| {
        p.conversations.find(&group.converse_pub).is_none()
    })
    .await;

    let uuid = pending_request(&bob).await;
    bob.accept_request(&uuid).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.flush().await;

    let snapshot = alice.snapshot();
    assert!(snapshot.conversations.find(&group.converse_pub).is_none());
    assert!(snapshot.conversations.conversations().is_empty());
}

#[tokio::test]
async fn test_late_accept_does_not_restore_deleted_conversation() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = client(&store, "alice");
    let bob = client(&store, "bob");
    alice.send_request(bob.pub_key(), "hi bob").unwrap();
    wait_until(&alice, "the conversation", |p| {
        p.conversations.find(bob.pub_key()).is_some()
    })
    .await;

    alice.delete_conversation(bob.pub_key()).unwrap();
    wait_until(&alice, "the conversation to disappear", |p| {
        p.conversations.find(bob.pub_key()).is_none()
    })
    .await;

    let uuid = pending_request(&bob).await;
    bob.accept_request(&uuid).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.flush().await;

    assert!(alice.snapshot().conversations.find(bob.pub_key()).is_none());
}
