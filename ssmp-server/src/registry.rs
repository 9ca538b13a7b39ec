use std::{io, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::{connection::Connection, topic::Topic};

pub(crate) type TopicMap = Mutex<FxHashMap<String, Arc<Topic>>>;

/// The connection table: one slot per authenticated name, plus the set of
/// anonymous connections. A newer login under an already-present name
/// displaces the older connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Connections>>,
}

#[derive(Default)]
struct Connections {
    anonymous: FxHashMap<usize, Arc<Connection>>,
    named: FxHashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to the table, returning the displaced same-name
    /// predecessor (if any) so the caller can close it outside the lock.
    pub fn register(&self, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        if conn.is_anonymous() {
            inner.anonymous.insert(Connection::key(conn), Arc::clone(conn));
            None
        } else {
            inner.named.insert(conn.user().to_owned(), Arc::clone(conn))
        }
    }

    /// The current connection for a user name, if any. Anonymous connections
    /// are not addressable.
    pub fn get_by_name(&self, name: &[u8]) -> Option<Arc<Connection>> {
        let name = String::from_utf8_lossy(name);
        self.inner.lock().named.get(name.as_ref()).cloned()
    }

    /// Drops a connection from the table. A named entry is only removed if it
    /// still points at `conn`: a newer same-name login must not be evicted by
    /// the connection it displaced.
    pub fn remove(&self, conn: &Arc<Connection>) {
        let mut inner = self.inner.lock();
        if conn.is_anonymous() {
            inner.anonymous.remove(&Connection::key(conn));
        } else if inner.named.get(conn.user()).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            inner.named.remove(conn.user());
        } else {
            warn!(user = %conn.user(), "mismatching connection closed");
        }
    }

    /// Every connection currently in the table.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner.anonymous.values().chain(inner.named.values()).cloned().collect()
    }

    pub(crate) fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let inner = self.inner.lock();
        writeln!(w, "{:5} anonymous connections", inner.anonymous.len())?;
        for conn in inner.anonymous.values() {
            writeln!(w, "\t{:p} {}", Arc::as_ptr(conn), conn.addr())?;
        }
        writeln!(w, "{:5} named connections", inner.named.len())?;
        for (user, conn) in &inner.named {
            writeln!(w, "\t{:p} {} {}", Arc::as_ptr(conn), conn.addr(), user)?;
            for name in conn.subscription_names() {
                writeln!(w, "\t\t{name}")?;
            }
        }
        Ok(())
    }
}

/// The topic table. All resident topics have at least one subscriber; a
/// topic removes itself when its last subscriber leaves.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    inner: Arc<TopicMap>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The topic registered under `name`, created on demand.
    pub fn get_or_create(&self, name: &[u8]) -> Arc<Topic> {
        let name = String::from_utf8_lossy(name);
        let mut topics = self.inner.lock();
        if let Some(t) = topics.get(name.as_ref()) {
            return Arc::clone(t);
        }
        let t = Topic::new(name.clone().into_owned(), Arc::downgrade(&self.inner));
        topics.insert(name.into_owned(), Arc::clone(&t));
        t
    }

    /// The topic registered under `name`, if any.
    pub fn get(&self, name: &[u8]) -> Option<Arc<Topic>> {
        let name = String::from_utf8_lossy(name);
        self.inner.lock().get(name.as_ref()).cloned()
    }

    pub(crate) fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let topics: Vec<Arc<Topic>> = self.inner.lock().values().cloned().collect();
        writeln!(w, "{:5} active topics", topics.len())?;
        for t in topics {
            writeln!(w, "\t{:p} {}", Arc::as_ptr(&t), t.name())?;
            for (conn, wants_presence) in t.snapshot() {
                writeln!(w, "\t\t{:p} {} {}", Arc::as_ptr(&conn), wants_presence, conn.user())?;
            }
        }
        Ok(())
    }
}
