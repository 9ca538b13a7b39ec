use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use ssmp_wire as wire;
use ssmp_wire::{DecodeError, Decoder, Span};

use crate::{
    connection::Connection,
    registry::{ConnectionRegistry, TopicRegistry},
    stats::ServerStats,
    EVENT_PONG, EVENT_PREFIX, RESP_BAD_REQUEST, RESP_CONFLICT, RESP_NOT_ALLOWED, RESP_NOT_FOUND,
    RESP_NOT_IMPLEMENTED, RESP_OK,
};

/// Presence catch-up events are coalesced into writes of at least this many
/// bytes to amortise syscalls.
const PRESENCE_BATCH: usize = 512;

/// What the read loop should do after a dispatched frame.
pub(crate) enum Flow {
    Continue,
    /// The response was already written; stop reading and close.
    Stop,
}

#[derive(Clone, Copy)]
enum Verb {
    Subscribe,
    Unsubscribe,
    Ucast,
    Mcast,
    Bcast,
    Ping,
    Pong,
    Close,
    Login,
    Unknown,
}

fn lookup(verb: &[u8]) -> Verb {
    match verb {
        wire::SUBSCRIBE => Verb::Subscribe,
        wire::UNSUBSCRIBE => Verb::Unsubscribe,
        wire::UCAST => Verb::Ucast,
        wire::MCAST => Verb::Mcast,
        wire::BCAST => Verb::Bcast,
        wire::PING => Verb::Ping,
        wire::PONG => Verb::Pong,
        wire::CLOSE => Verb::Close,
        wire::LOGIN => Verb::Login,
        _ => Verb::Unknown,
    }
}

/// Parses each request past the verb, enforces its semantics and fans events
/// out to the right recipients. Shared by every connection's read task.
pub struct Dispatcher {
    topics: TopicRegistry,
    connections: ConnectionRegistry,
    stats: Arc<ServerStats>,
}

impl Dispatcher {
    pub fn new(
        topics: TopicRegistry,
        connections: ConnectionRegistry,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self { topics, connections, stats }
    }

    pub(crate) fn remove_connection(&self, conn: &Arc<Connection>) {
        self.connections.remove(conn);
    }

    /// Decodes the rest of the frame started by `verb` and reacts to it.
    ///
    /// Decode errors are the caller's to handle: `InvalidMessage` means the
    /// frame was malformed and the connection should get a `400` and close.
    /// Semantic errors (absent topic, duplicate subscription, ...) answer
    /// their response code here and keep the connection going.
    pub(crate) async fn dispatch<R: AsyncRead + Unpin>(
        &self,
        conn: &Arc<Connection>,
        dec: &mut Decoder<R>,
        verb: Span,
    ) -> Result<Flow, DecodeError> {
        match lookup(dec.bytes(verb)) {
            Verb::Login => {
                debug!(user = %conn.user(), "re-login attempt");
                let _ = conn.write(RESP_NOT_ALLOWED).await;
                return Ok(Flow::Stop);
            }
            Verb::Unknown => {
                dec.decode_compat().await?;
                warn!(user = %conn.user(), "unsupported verb");
                let _ = conn.write(RESP_NOT_IMPLEMENTED).await;
            }
            Verb::Subscribe => {
                let to = dec.decode_id().await?;
                let option = if dec.at_end() { None } else { Some(dec.decode_payload().await?) };
                self.finish(dec)?;
                self.on_subscribe(conn, dec, to, option).await;
            }
            Verb::Unsubscribe => {
                let to = dec.decode_id().await?;
                self.finish(dec)?;
                self.on_unsubscribe(conn, dec, to).await;
            }
            Verb::Ucast => {
                let to = dec.decode_id().await?;
                dec.decode_payload().await?;
                self.finish(dec)?;
                self.on_ucast(conn, dec, to).await;
            }
            Verb::Mcast => {
                let to = dec.decode_id().await?;
                dec.decode_payload().await?;
                self.finish(dec)?;
                self.on_mcast(conn, dec, to).await;
            }
            Verb::Bcast => {
                dec.decode_payload().await?;
                self.finish(dec)?;
                self.on_bcast(conn, dec).await;
            }
            Verb::Ping => {
                self.finish(dec)?;
                let _ = conn.write(EVENT_PONG).await;
            }
            Verb::Pong => {
                self.finish(dec)?;
            }
            Verb::Close => {
                self.finish(dec)?;
                let _ = conn.write(RESP_OK).await;
                conn.close();
            }
        }
        Ok(Flow::Continue)
    }

    /// Rejects trailing garbage and accounts the finished frame.
    fn finish<R: AsyncRead + Unpin>(&self, dec: &Decoder<R>) -> Result<(), DecodeError> {
        if !dec.at_end() {
            return Err(DecodeError::InvalidMessage);
        }
        self.stats.add_rx(dec.raw_message().len());
        Ok(())
    }

    async fn on_subscribe<R: AsyncRead + Unpin>(
        &self,
        conn: &Arc<Connection>,
        dec: &Decoder<R>,
        to: Span,
        option: Option<Span>,
    ) {
        if conn.is_anonymous() {
            let _ = conn.write(RESP_NOT_ALLOWED).await;
            return;
        }
        if let Some(option) = option {
            if dec.bytes(option) != wire::PRESENCE {
                debug!(user = %conn.user(), "unrecognized SUBSCRIBE option");
                let _ = conn.write(RESP_BAD_REQUEST).await;
                return;
            }
        }
        let presence = option.is_some();
        let name = dec.bytes(to);
        let t = self.topics.get_or_create(name);
        if !t.subscribe(conn, presence) {
            let _ = conn.write(RESP_CONFLICT).await;
            return;
        }
        conn.subscribe(Arc::clone(&t));
        let _ = conn.write(RESP_OK).await;

        // notify existing presence-opted members of the new subscription;
        // when the newcomer opted in itself, answer with the current
        // membership, batched to amortise syscalls
        let event = event_line(conn.user(), dec.raw_message());
        let mut batch = BytesMut::new();
        for (member, wants_presence) in t.snapshot() {
            if std::ptr::eq(member.as_ref(), conn.as_ref()) {
                continue;
            }
            if wants_presence {
                let _ = member.write(&event).await;
            }
            if presence {
                batch.put_slice(EVENT_PREFIX);
                batch.put_slice(member.user().as_bytes());
                batch.put_u8(b' ');
                batch.put_slice(wire::SUBSCRIBE);
                batch.put_u8(b' ');
                batch.put_slice(name);
                if wants_presence {
                    batch.put_slice(b" PRESENCE\n");
                } else {
                    batch.put_u8(b'\n');
                }
                if batch.len() > PRESENCE_BATCH {
                    let _ = conn.write(&batch).await;
                    batch.clear();
                }
            }
        }
        if !batch.is_empty() {
            let _ = conn.write(&batch).await;
        }
    }

    async fn on_unsubscribe<R: AsyncRead + Unpin>(
        &self,
        conn: &Arc<Connection>,
        dec: &Decoder<R>,
        to: Span,
    ) {
        if conn.is_anonymous() {
            let _ = conn.write(RESP_NOT_ALLOWED).await;
            return;
        }
        let name = dec.bytes(to);
        let Some(t) = self.topics.get(name) else {
            let _ = conn.write(RESP_NOT_FOUND).await;
            return;
        };
        if !t.unsubscribe(conn) {
            let _ = conn.write(RESP_NOT_FOUND).await;
            return;
        }
        conn.unsubscribe(t.name());
        let event = event_line(conn.user(), dec.raw_message());
        for (member, wants_presence) in t.snapshot() {
            if wants_presence {
                let _ = member.write(&event).await;
            }
        }
        let _ = conn.write(RESP_OK).await;
    }

    async fn on_ucast<R: AsyncRead + Unpin>(
        &self,
        conn: &Arc<Connection>,
        dec: &Decoder<R>,
        to: Span,
    ) {
        let Some(target) = self.connections.get_by_name(dec.bytes(to)) else {
            let _ = conn.write(RESP_NOT_FOUND).await;
            return;
        };
        let event = event_line(conn.user(), dec.raw_message());
        let _ = target.write(&event).await;
        let _ = conn.write(RESP_OK).await;
    }

    async fn on_mcast<R: AsyncRead + Unpin>(
        &self,
        conn: &Arc<Connection>,
        dec: &Decoder<R>,
        to: Span,
    ) {
        if let Some(t) = self.topics.get(dec.bytes(to)) {
            let event = event_line(conn.user(), dec.raw_message());
            for (member, _) in t.snapshot() {
                if std::ptr::eq(member.as_ref(), conn.as_ref()) {
                    continue;
                }
                let _ = member.write(&event).await;
            }
        }
        // nothing to send on an absent topic, but the request is fine
        let _ = conn.write(RESP_OK).await;
    }

    async fn on_bcast<R: AsyncRead + Unpin>(&self, conn: &Arc<Connection>, dec: &Decoder<R>) {
        if conn.is_anonymous() {
            let _ = conn.write(RESP_NOT_ALLOWED).await;
            return;
        }
        let event = event_line(conn.user(), dec.raw_message());
        conn.broadcast(&event).await;
        let _ = conn.write(RESP_OK).await;
    }
}

/// Builds `000 <from> <tail>` reusing the raw bytes of the inbound request,
/// which preserves the sender's exact payload framing.
pub(crate) fn event_line(from: &str, tail: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EVENT_PREFIX.len() + from.len() + 1 + tail.len());
    buf.put_slice(EVENT_PREFIX);
    buf.put_slice(from.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(tail);
    buf.freeze()
}

/// Builds the synthetic `000 <from> UNSUBSCRIBE <topic>` event delivered when
/// a closing connection leaves its topics.
pub(crate) fn unsubscribe_event(from: &str, topic: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        EVENT_PREFIX.len() + from.len() + wire::UNSUBSCRIBE.len() + topic.len() + 3,
    );
    buf.put_slice(EVENT_PREFIX);
    buf.put_slice(from.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(wire::UNSUBSCRIBE);
    buf.put_u8(b' ');
    buf.put_slice(topic.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}
