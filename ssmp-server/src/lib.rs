//! Reference server for the Stupid-Simple Messaging Protocol.
//!
//! The server accepts authenticated long-lived connections and routes three
//! kinds of messages between them: unicast to a named client, multicast to
//! the subscribers of a topic, and broadcast to every client sharing at
//! least one topic with the sender. Topics additionally deliver presence
//! notifications to subscribers that opted in.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use tokio::io::{AsyncRead, AsyncWrite};

mod auth;
pub use auth::{
    open_scheme, secret_scheme, Authenticator, MultiSchemeAuthenticator, PeerInfo, SchemeFn,
};

mod connection;
pub use connection::Connection;

mod dispatch;
pub use dispatch::Dispatcher;

mod registry;
pub use registry::{ConnectionRegistry, TopicRegistry};

mod server;
pub use server::{Server, ServerError};

mod stats;
pub use stats::ServerStats;

mod topic;
pub use topic::Topic;

/// The duplex byte streams the server operates on.
pub trait Io: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Io for T {}

// Canned response lines.
pub(crate) const RESP_OK: &[u8] = b"200\n";
pub(crate) const RESP_BAD_REQUEST: &[u8] = b"400\n";
pub(crate) const RESP_NOT_FOUND: &[u8] = b"404\n";
pub(crate) const RESP_NOT_ALLOWED: &[u8] = b"405\n";
pub(crate) const RESP_CONFLICT: &[u8] = b"409\n";
pub(crate) const RESP_NOT_IMPLEMENTED: &[u8] = b"501\n";

/// Prefix of every server-initiated event.
pub(crate) const EVENT_PREFIX: &[u8] = b"000 ";

// Keep-alive events on behalf of the server pseudo-user.
pub(crate) const EVENT_PING: &[u8] = b"000 . PING\n";
pub(crate) const EVENT_PONG: &[u8] = b"000 . PONG\n";
