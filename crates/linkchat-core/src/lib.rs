//! Linkchat Core Library
//!
//! End-to-end encrypted messaging over a shared, eventually-consistent graph
//! store.
//!
//! ## Overview
//!
//! Messages carry no sequence numbers. Each one names the keypair that
//! addresses the next, so a conversation is a linked list of immutable,
//! content-addressed records that any peer can read and only the holders of
//! the current link can open. Invites travel to a long-lived identity; once
//! accepted, both sides follow the shared chain.
//!
//! ## Core Principles
//!
//! - **No ordering assumptions**: the store delivers at-least-once, in any
//!   order; every algorithm here is idempotent
//! - **Encrypted at rest**: contacts, conversations and the removed-set are
//!   sealed for their owner
//! - **Tombstones win**: a deleted conversation never comes back through a
//!   late remote update
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use linkchat_core::{ChatClient, ChatConfig, Identity, LocalStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(LocalStore::open("replica.redb")?);
//!     let alice = ChatClient::new(Identity::generate("alice"), store, ChatConfig::default())?;
//!     alice.start()?;
//!
//!     let mut events = alice.subscribe_events();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod client;
pub mod config;
pub mod contact;
pub mod conversation;
pub mod crypto;
pub mod display;
pub mod error;
pub mod events;
pub mod identity;
pub mod projection;
pub mod removed;
pub mod store;
pub mod subscription;

// Re-exports
pub use chain::{now_ms, time_bucket, Address, Consumer, Content, Message, MessageChain, Payload, Route};
pub use client::{ChatClient, Intent};
pub use config::ChatConfig;
pub use contact::{Contact, ContactChange, ContactRegistry};
pub use conversation::{
    Conversation, ConversationChange, ConversationRegistry, ConversationUpdate, GroupDescriptor,
};
pub use display::{contact_display_name, conversation_label, group_default_name};
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, ClientEvent, Effect, Notification};
pub use identity::{EncPubKey, Identity, Keypair, Profile, PubKey};
pub use projection::Projection;
pub use removed::RemovedRegistry;
pub use store::{GraphStore, LocalStore, Query, StorePath, StoreRecord, StoreSubscription};
pub use subscription::Subscription;
