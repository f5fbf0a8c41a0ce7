//! Conversation and group descriptor records

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::identity::{Keypair, PubKey};

/// Private per-owner conversation record, sealed at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub uuid: Ulid,
    /// Counterpart identity, or the group pair's pub for a group
    pub converse_pub: PubKey,
    /// First link of the chain; never changes
    pub root_pair: Keypair,
    /// Live frontier of the chain
    pub next_pair: Keypair,
    /// Newest message timestamp seen by the owner; never decreases
    pub last_timestamp: i64,
    pub created_timestamp: i64,
    pub admin_pub: Option<PubKey>,
    pub member_pubs: Option<Vec<PubKey>>,
    pub group_pair: Option<Keypair>,
    /// Timestamp of the group descriptor last folded in
    pub group_timestamp: Option<i64>,
    pub name: Option<String>,
}

/// Partial update; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub next_pair: Option<Keypair>,
    pub last_timestamp: Option<i64>,
    pub member_pubs: Option<Vec<PubKey>>,
    pub name: Option<String>,
    pub group_timestamp: Option<i64>,
}

impl ConversationUpdate {
    pub fn last_timestamp(timestamp: i64) -> Self {
        Self {
            last_timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn next_pair(pair: Keypair) -> Self {
        Self {
            next_pair: Some(pair),
            ..Default::default()
        }
    }
}

/// Shared, admin-owned group metadata sealed with the group pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub name: Option<String>,
    pub member_pubs: Vec<PubKey>,
    pub timestamp: i64,
}

impl GroupDescriptor {
    pub fn as_update(&self) -> ConversationUpdate {
        ConversationUpdate {
            name: self.name.clone(),
            member_pubs: Some(self.member_pubs.clone()),
            group_timestamp: Some(self.timestamp),
            ..Default::default()
        }
    }
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.group_pair.is_some()
    }

    /// Apply `update` without ever moving `last_timestamp` backward.
    ///
    /// Group fields carrying a `group_timestamp` older than the stored one
    /// are ignored, so a stale descriptor cannot undo a newer rename.
    pub fn merge(&self, update: &ConversationUpdate) -> Conversation {
        let mut merged = self.clone();

        if let Some(pair) = &update.next_pair {
            merged.next_pair = pair.clone();
        }
        if let Some(timestamp) = update.last_timestamp {
            merged.last_timestamp = merged.last_timestamp.max(timestamp);
        }

        let group_fresh = match (update.group_timestamp, self.group_timestamp) {
            (Some(incoming), Some(current)) => incoming >= current,
            _ => true,
        };
        if group_fresh {
            if let Some(members) = &update.member_pubs {
                merged.member_pubs = Some(members.clone());
            }
            if let Some(name) = &update.name {
                merged.name = Some(name.clone());
            }
            if update.group_timestamp.is_some() {
                merged.group_timestamp = update.group_timestamp;
            }
        }
        merged
    }

    /// Descriptor as the admin publishes it.
    pub fn descriptor(&self) -> Option<GroupDescriptor> {
        self.group_pair.as_ref()?;
        Some(GroupDescriptor {
            name: self.name.clone(),
            member_pubs: self.member_pubs.clone().unwrap_or_default(),
            timestamp: self.group_timestamp.unwrap_or(self.created_timestamp),
        })
    }
}
