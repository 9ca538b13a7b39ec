use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::{
    io::{AsyncRead, AsyncWriteExt, WriteHalf},
    sync::Mutex as AsyncMutex,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use ssmp_wire::{DecodeError, Decoder};

use crate::{
    dispatch::{unsubscribe_event, Dispatcher, Flow},
    stats::ServerStats,
    topic::Topic,
    Io, EVENT_PING, RESP_BAD_REQUEST,
};

/// Read deadline between frames; drives the idle keep-alive.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

// A valid response or event line: at least a code, at most a full event.
const MIN_WRITE: usize = 2;
const MAX_WRITE: usize = 1024;

/// An open client connection, created after a successful LOGIN.
///
/// The read task owns the decoder and drives dispatch; any task may write
/// through the internally serialised writer or close the connection. The
/// subscription map is released exactly once, by whichever task flips the
/// `closed` flag.
pub struct Connection {
    user: String,
    addr: SocketAddr,
    writer: AsyncMutex<WriteHalf<Box<dyn Io>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    /// Subscribed topics by name. Mutated only by the read task; drained by
    /// whichever task wins the close.
    subs: Mutex<FxHashMap<String, Arc<Topic>>>,
    stats: Arc<ServerStats>,
}

impl Connection {
    pub(crate) fn new(
        user: String,
        addr: SocketAddr,
        writer: WriteHalf<Box<dyn Io>>,
        stats: Arc<ServerStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user,
            addr,
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            subs: Mutex::new(FxHashMap::default()),
            stats,
        })
    }

    /// The authenticated user name, fixed for the connection's lifetime.
    #[inline]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.user.as_bytes() == ssmp_wire::ANONYMOUS
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connection identity, used to key subscriber and registry maps.
    #[inline]
    pub(crate) fn key(conn: &Arc<Self>) -> usize {
        Arc::as_ptr(conn) as usize
    }

    /// Writes one response or event line to the client.
    ///
    /// Safe to call from any task; concurrent writes are serialised so each
    /// line reaches the stream as one atomic write. A transport error closes
    /// the connection and is returned; the payload must be a full line of
    /// 2..=1024 bytes.
    pub async fn write(&self, payload: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_err());
        }
        let n = payload.len();
        if !(MIN_WRITE..=MAX_WRITE).contains(&n) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid message size"));
        }
        if payload[n - 1] != b'\n' {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing message delimiter"));
        }
        let mut writer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(closed_err()),
            writer = self.writer.lock() => writer,
        };
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(closed_err()),
            res = writer.write_all(payload) => res,
        };
        drop(writer);
        match res {
            Ok(()) => {
                self.stats.add_tx(n);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Adds a topic to the subscription map. Read task only.
    pub(crate) fn subscribe(&self, topic: Arc<Topic>) {
        self.subs.lock().insert(topic.name().to_owned(), topic);
    }

    /// Drops a topic from the subscription map. Read task only.
    pub(crate) fn unsubscribe(&self, name: &str) {
        self.subs.lock().remove(name);
    }

    pub(crate) fn subscription_names(&self) -> Vec<String> {
        self.subs.lock().keys().cloned().collect()
    }

    /// Sends an identical event to every connection sharing at least one
    /// topic with this one, deduplicated by connection identity.
    pub(crate) async fn broadcast(&self, payload: &[u8]) {
        let topics: Vec<Arc<Topic>> = self.subs.lock().values().cloned().collect();
        let mut seen: FxHashMap<usize, Arc<Connection>> = FxHashMap::default();
        for t in topics {
            for (conn, _) in t.snapshot() {
                if std::ptr::eq(conn.as_ref(), self) {
                    continue;
                }
                seen.entry(Connection::key(&conn)).or_insert(conn);
            }
        }
        for conn in seen.values() {
            let _ = conn.write(payload).await;
        }
    }

    /// Closes the connection: releases every subscription (notifying
    /// presence-opted members of each left topic), then tears down the
    /// transport. Idempotent; the losing caller of a close race returns
    /// immediately.
    pub fn close(&self) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        let drained: Vec<Arc<Topic>> = {
            let mut subs = self.subs.lock();
            subs.drain().map(|(_, t)| t).collect()
        };
        let mut notifications = Vec::new();
        for t in drained {
            t.unsubscribe(self);
            let targets: Vec<Arc<Connection>> = t
                .snapshot()
                .into_iter()
                .filter(|(_, wants_presence)| *wants_presence)
                .map(|(conn, _)| conn)
                .collect();
            if !targets.is_empty() {
                notifications.push((unsubscribe_event(&self.user, t.name()), targets));
            }
        }
        if !notifications.is_empty() {
            tokio::spawn(async move {
                for (event, targets) in notifications {
                    for conn in targets {
                        let _ = conn.write(&event).await;
                    }
                }
            });
        }
        self.cancel.cancel();
    }

    /// Reads and dispatches frames until the connection closes.
    ///
    /// A read deadline without a complete verb earns one `PING` grace period
    /// per idle span; a second one closes the connection. Protocol errors
    /// answer `400` and close; transport errors close silently (EOF) or with
    /// a log line.
    pub(crate) async fn read_loop<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        mut dec: Decoder<R>,
        dispatcher: &Dispatcher,
    ) {
        let mut idle = false;
        loop {
            if self.is_closed() {
                break;
            }
            let decoded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                decoded = timeout(READ_TIMEOUT, dec.decode_verb()) => decoded,
            };
            if self.is_closed() {
                break;
            }
            let verb = match decoded {
                Err(_) => {
                    if !idle {
                        idle = true;
                        if self.write(EVENT_PING).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    debug!(user = %self.user, "idle connection timed out");
                    break;
                }
                Ok(Err(DecodeError::Eof)) => break,
                Ok(Err(DecodeError::Io(e))) => {
                    error!(user = %self.user, "read failed: {e:?}");
                    break;
                }
                Ok(Err(DecodeError::InvalidMessage)) => {
                    let _ = self.write(RESP_BAD_REQUEST).await;
                    break;
                }
                Ok(Ok(verb)) => verb,
            };
            idle = false;
            match dispatcher.dispatch(&self, &mut dec, verb).await {
                Ok(Flow::Continue) => dec.reset(),
                Ok(Flow::Stop) => break,
                Err(DecodeError::InvalidMessage) => {
                    let _ = self.write(RESP_BAD_REQUEST).await;
                    break;
                }
                Err(DecodeError::Eof) => break,
                Err(DecodeError::Io(e)) => {
                    error!(user = %self.user, "read failed: {e:?}");
                    break;
                }
            }
        }
        self.close();
        dispatcher.remove_connection(&self);
    }

    /// A connection over an in-memory stream, for registry and topic tests.
    #[cfg(test)]
    pub(crate) fn test_connection(user: &str) -> Arc<Self> {
        let (local, _remote) = tokio::io::duplex(MAX_WRITE);
        let boxed: Box<dyn Io> = Box::new(local);
        let (_rd, wr) = tokio::io::split(boxed);
        Self::new(
            user.to_owned(),
            "127.0.0.1:0".parse().expect("test addr"),
            wr,
            Arc::new(ServerStats::default()),
        )
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}
