use std::{
    collections::hash_map::Entry,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::{connection::Connection, registry::TopicMap};

struct Subscriber {
    conn: Arc<Connection>,
    wants_presence: bool,
}

/// A multicast topic: the set of connections subscribed to one name, each
/// with its presence opt-in flag.
///
/// A topic keeps a back-reference to the registry map so it can remove
/// itself the moment its subscriber set empties; a registered topic is never
/// empty. Lock order is always topic, then registry.
pub struct Topic {
    name: String,
    registry: Weak<TopicMap>,
    subscribers: RwLock<FxHashMap<usize, Subscriber>>,
}

impl Topic {
    pub(crate) fn new(name: String, registry: Weak<TopicMap>) -> Arc<Self> {
        Arc::new(Self { name, registry, subscribers: RwLock::new(FxHashMap::default()) })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a connection to the subscriber set. Returns `true` on insertion,
    /// `false` if the connection was already subscribed (no state change).
    pub fn subscribe(&self, conn: &Arc<Connection>, wants_presence: bool) -> bool {
        let mut subs = self.subscribers.write();
        match subs.entry(Connection::key(conn)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(Subscriber { conn: Arc::clone(conn), wants_presence });
                true
            }
        }
    }

    /// Removes a connection from the subscriber set, reporting whether it had
    /// been a member. An emptied topic removes itself from the registry.
    pub fn unsubscribe(&self, conn: &Connection) -> bool {
        let mut subs = self.subscribers.write();
        let subscribed = subs.remove(&(conn as *const Connection as usize)).is_some();
        if subs.is_empty() {
            if let Some(registry) = self.registry.upgrade() {
                let mut topics = registry.lock();
                // a same-name topic may already have been re-created
                if topics.get(&self.name).is_some_and(|t| std::ptr::eq(Arc::as_ptr(t), self)) {
                    topics.remove(&self.name);
                }
            }
        }
        subscribed
    }

    /// A point-in-time snapshot of the subscriber set, skipping connections
    /// already closed. Fan-out iterates the snapshot so no topic lock is held
    /// while writing to recipients.
    pub fn snapshot(&self) -> Vec<(Arc<Connection>, bool)> {
        let subs = self.subscribers.read();
        subs.values()
            .filter(|s| !s.conn.is_closed())
            .map(|s| (Arc::clone(&s.conn), s.wants_presence))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
