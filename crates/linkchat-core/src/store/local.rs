//! Local replica of the shared graph, persisted with redb
//!
//! All nodes live in one table under the composite key `"{node}\0{key}"`, so
//! a node (or a key prefix within it) is a contiguous range scan.

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{GraphStore, KeyMatch, Query, StorePath, StoreRecord, StoreSubscription, MESSAGES_NODE};
use crate::crypto;
use crate::error::{ChatError, ChatResult};

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

const SEPARATOR: char = '\0';

struct Listener {
    query: Query,
    tx: mpsc::UnboundedSender<StoreRecord>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: HashMap<u64, Listener>,
}

/// [`GraphStore`] backed by a redb database, file or in-memory.
///
/// Share one instance (behind an `Arc`) between several clients to simulate
/// peers replicating the same graph.
pub struct LocalStore {
    db: Database,
    listeners: Arc<Mutex<Listeners>>,
    subscribe_calls: AtomicUsize,
}

impl LocalStore {
    /// Open (or create) a file-backed replica.
    pub fn open(path: impl AsRef<Path>) -> ChatResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        debug!(path = %path.display(), "Opened local store");
        Self::init(db)
    }

    /// A replica that lives only as long as this value.
    pub fn in_memory() -> ChatResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> ChatResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            subscribe_calls: AtomicUsize::new(0),
        })
    }

    /// Number of `subscribe` calls served so far.
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    fn composite(path: &StorePath) -> String {
        format!("{}{}{}", path.node, SEPARATOR, path.key)
    }

    /// Message envelopes are write-once and addressed by their own hash.
    fn check_message_write(&self, path: &StorePath, value: Option<&[u8]>) -> ChatResult<()> {
        let Some(value) = value else {
            return Err(ChatError::Store(format!(
                "messages are immutable, refusing tombstone at {}",
                path.key
            )));
        };
        let expected = format!("#{}", crypto::hash(value));
        if !path.key.ends_with(&expected) {
            return Err(ChatError::Store(format!(
                "message key {} does not match its content hash",
                path.key
            )));
        }
        Ok(())
    }

    fn snapshot(&self, query: &Query) -> ChatResult<Vec<StoreRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;
        let mut records = Vec::new();

        let start = match &query.key {
            KeyMatch::All => format!("{}{}", query.node, SEPARATOR),
            KeyMatch::Prefix(prefix) => format!("{}{}{}", query.node, SEPARATOR, prefix),
            KeyMatch::Exact(key) => {
                let path = StorePath::new(query.node.clone(), key.clone());
                if let Some(v) = table.get(Self::composite(&path).as_str())? {
                    records.push(StoreRecord {
                        path,
                        value: Some(v.value().to_vec()),
                    });
                }
                return Ok(records);
            }
        };

        for entry in table.range(start.as_str()..)? {
            let (k, v) = entry?;
            let composite = k.value();
            if !composite.starts_with(start.as_str()) {
                break;
            }
            let key = &composite[query.node.len() + SEPARATOR.len_utf8()..];
            records.push(StoreRecord {
                path: StorePath::new(query.node.clone(), key),
                value: Some(v.value().to_vec()),
            });
        }
        Ok(records)
    }
}

impl GraphStore for LocalStore {
    fn put(&self, path: &StorePath, value: Option<Vec<u8>>) -> ChatResult<()> {
        if path.node == MESSAGES_NODE {
            self.check_message_write(path, value.as_deref())?;
        }

        let composite = Self::composite(path);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            if path.node == MESSAGES_NODE {
                if let Some(existing) = table.get(composite.as_str())? {
                    if Some(existing.value()) != value.as_deref() {
                        return Err(ChatError::Store(format!(
                            "message {} already written",
                            path.key
                        )));
                    }
                }
            }
            match &value {
                Some(bytes) => {
                    table.insert(composite.as_str(), bytes.as_slice())?;
                }
                None => {
                    table.remove(composite.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        trace!(node = %path.node, key = %path.key, tombstone = value.is_none(), "Stored record");

        let record = StoreRecord {
            path: path.clone(),
            value,
        };
        let listeners = self.listeners.lock();
        for listener in listeners.entries.values() {
            if listener.query.matches(path) {
                // A closed receiver is deregistered by its own drop guard
                let _ = listener.tx.send(record.clone());
            }
        }
        Ok(())
    }

    fn read_once(&self, path: &StorePath) -> ChatResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;
        Ok(table
            .get(Self::composite(path).as_str())?
            .map(|v| v.value().to_vec()))
    }

    fn subscribe(&self, query: Query) -> ChatResult<StoreSubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        // Snapshot and registration under one lock: a concurrent put either
        // lands in the snapshot or is notified afterwards.
        let mut listeners = self.listeners.lock();
        for record in self.snapshot(&query)? {
            let _ = tx.send(record);
        }
        let id = listeners.next_id;
        listeners.next_id += 1;
        debug!(id, node = %query.node, key = ?query.key, "Store subscription opened");
        listeners.entries.insert(id, Listener { query, tx });
        drop(listeners);

        let registry: Weak<Mutex<Listeners>> = Arc::downgrade(&self.listeners);
        Ok(StoreSubscription::new(rx, move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().entries.remove(&id);
                trace!(id, "Store subscription closed");
            }
        }))
    }
}
