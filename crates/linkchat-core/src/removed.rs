//! Removed-set: tombstone flags for deleted conversations and handled invites
//!
//! One sealed record per uuid under `~{pub}/removed`. The in-memory set is
//! filled by [`RemovedRegistry::get_removed`] and by local marks, and is
//! consulted before any late remote update may touch a conversation again.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};
use ulid::Ulid;

use crate::chain::Consumer;
use crate::crypto;
use crate::error::ChatResult;
use crate::identity::Keypair;
use crate::store::{listen, paths, GraphStore, Query, StorePath};
use crate::subscription::Subscription;

#[derive(Clone)]
pub struct RemovedRegistry {
    me: Keypair,
    store: Arc<dyn GraphStore>,
    removed: Arc<Mutex<HashSet<Ulid>>>,
}

impl RemovedRegistry {
    pub fn new(me: Keypair, store: Arc<dyn GraphStore>) -> Self {
        Self {
            me,
            store,
            removed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_removed(&self, uuid: &Ulid) -> bool {
        self.removed.lock().contains(uuid)
    }

    /// Flag `uuid` locally and persist the flag.
    pub fn mark_removed(&self, uuid: &Ulid) -> ChatResult<()> {
        self.removed.lock().insert(*uuid);
        let path = StorePath::new(paths::removed_node(self.me.pub_key()), uuid.to_string());
        self.store.put(&path, Some(crypto::seal(&true, &self.me)?))?;
        debug!(%uuid, "Marked removed");
        Ok(())
    }

    /// Follow the persisted set; `consumer` sees every flagged uuid.
    ///
    /// Already-persisted flags are loaded before this returns.
    pub fn get_removed(
        &self,
        scope: &Subscription,
        consumer: Consumer<Ulid>,
    ) -> ChatResult<Subscription> {
        let handle = scope.child();
        let sub = self
            .store
            .subscribe(Query::all(paths::removed_node(self.me.pub_key())))?;

        let registry = self.clone();
        listen(sub, handle.clone(), move |record| {
            let Ok(uuid) = Ulid::from_string(&record.path.key) else {
                return;
            };
            let flagged = record
                .value
                .and_then(|value| crypto::open::<bool>(&value, &registry.me))
                .unwrap_or(false);
            if !flagged {
                trace!(%uuid, "Ignoring removed entry that is not ours");
                return;
            }
            registry.removed.lock().insert(uuid);
            consumer(uuid);
        });
        Ok(handle)
    }
}
