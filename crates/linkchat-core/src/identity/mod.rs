//! Local identity and public profiles
//!
//! Every identity publishes a readable profile node `~{pub}/profile` with one
//! UTF-8 entry per field (`alias`, `name`, `pub`, `epub`). Peers resolve it with
//! a single read when adding a contact and watch `name` to follow renames.

mod keypair;

pub use keypair::{EncPubKey, Keypair, PubKey};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ChatError, ChatResult};
use crate::store::{paths, GraphStore, StorePath};

/// Public, unencrypted view of an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub pub_key: PubKey,
    pub epub: EncPubKey,
    pub alias: String,
    pub name: Option<String>,
}

/// Long-lived local identity: the keypair plus self-chosen display fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pair: Keypair,
    alias: String,
    name: Option<String>,
}

impl Identity {
    /// Create a fresh identity with a new keypair.
    pub fn generate(alias: impl Into<String>) -> Self {
        Self {
            pair: Keypair::generate(),
            alias: alias.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pair(&self) -> &Keypair {
        &self.pair
    }

    pub fn pub_key(&self) -> &PubKey {
        self.pair.pub_key()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn profile(&self) -> Profile {
        Profile {
            pub_key: self.pair.pub_key().clone(),
            epub: self.pair.epub().clone(),
            alias: self.alias.clone(),
            name: self.name.clone(),
        }
    }

    /// Write every profile field under `~{pub}/profile`.
    pub fn publish_profile(&self, store: &dyn GraphStore) -> ChatResult<()> {
        let node = paths::profile_node(self.pub_key());
        let fields = [
            ("alias", Some(self.alias.as_str())),
            ("name", self.name.as_deref()),
            ("pub", Some(self.pair.pub_key().as_str())),
            ("epub", Some(self.pair.epub().as_str())),
        ];
        for (key, value) in fields {
            let value = value.map(|v| v.as_bytes().to_vec());
            store.put(&StorePath::new(node.clone(), key), value)?;
        }
        info!(pub_key = %self.pub_key(), alias = %self.alias, "Published profile");
        Ok(())
    }

    /// Change the display name and republish it.
    pub fn rename(&mut self, store: &dyn GraphStore, name: impl Into<String>) -> ChatResult<()> {
        let name = name.into();
        let path = StorePath::new(paths::profile_node(self.pub_key()), "name");
        store.put(&path, Some(name.as_bytes().to_vec()))?;
        debug!(pub_key = %self.pub_key(), %name, "Renamed identity");
        self.name = Some(name);
        Ok(())
    }

    /// Persist as JSON (private material included).
    pub fn to_json(&self) -> ChatResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ChatError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> ChatResult<Self> {
        let parsed: Identity =
            serde_json::from_str(json).map_err(|e| ChatError::Serialization(e.to_string()))?;
        // Round-trip the pair through its own validating import
        let pair = Keypair::from_json(&parsed.pair.to_json()?)?;
        Ok(Self { pair, ..parsed })
    }
}

fn read_field(store: &dyn GraphStore, node: &str, key: &str) -> ChatResult<Option<String>> {
    let value = store.read_once(&StorePath::new(node, key))?;
    Ok(value.and_then(|bytes| String::from_utf8(bytes).ok()))
}

/// Resolve a published profile with a single read.
///
/// Returns `Ok(None)` when nothing usable is published: no agreement key, or
/// a `pub` field that does not match the node it sits under.
pub fn read_profile(store: &dyn GraphStore, pub_key: &PubKey) -> ChatResult<Option<Profile>> {
    let node = paths::profile_node(pub_key);
    let Some(epub) = read_field(store, &node, "epub")? else {
        return Ok(None);
    };
    let Ok(epub) = EncPubKey::parse(&epub) else {
        debug!(%pub_key, "Profile carries an unparsable epub");
        return Ok(None);
    };
    if let Some(published) = read_field(store, &node, "pub")? {
        if published != pub_key.as_str() {
            return Ok(None);
        }
    }
    let alias = read_field(store, &node, "alias")?.unwrap_or_default();
    let name = read_field(store, &node, "name")?;
    Ok(Some(Profile {
        pub_key: pub_key.clone(),
        epub,
        alias,
        name,
    }))
}
