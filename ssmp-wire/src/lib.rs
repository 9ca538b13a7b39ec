//! Constants and shared definitions for the SSMP wire format.
//!
//! SSMP messages are single lines terminated by `\n`. Requests start with an
//! uppercase verb, responses with a three-digit code; the reserved code `000`
//! marks server-initiated events. Payloads are either raw text or a
//! length-prefixed binary run (see [`Decoder::decode_payload`]).

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod byteset;
pub use byteset::ByteSet;

mod decoder;
pub use decoder::{DecodeError, Decoder, Span};

// Request verbs.
pub const LOGIN: &[u8] = b"LOGIN";
pub const SUBSCRIBE: &[u8] = b"SUBSCRIBE";
pub const UNSUBSCRIBE: &[u8] = b"UNSUBSCRIBE";
pub const UCAST: &[u8] = b"UCAST";
pub const MCAST: &[u8] = b"MCAST";
pub const BCAST: &[u8] = b"BCAST";
pub const PING: &[u8] = b"PING";
pub const PONG: &[u8] = b"PONG";
pub const CLOSE: &[u8] = b"CLOSE";

/// The only SUBSCRIBE option.
pub const PRESENCE: &[u8] = b"PRESENCE";

// Response codes.
pub const CODE_EVENT: u16 = 0;
pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_UNAUTHORIZED: u16 = 401;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_NOT_ALLOWED: u16 = 405;
pub const CODE_CONFLICT: u16 = 409;
pub const CODE_NOT_IMPLEMENTED: u16 = 501;

/// Reserved identifier for the anonymous / server pseudo-user.
pub const ANONYMOUS: &[u8] = b".";

// Field limits.
pub const CODE_LENGTH: usize = 3;
pub const MAX_VERB_LENGTH: usize = 16;
pub const MAX_IDENTIFIER_LENGTH: usize = 64;
pub const MAX_PAYLOAD_LENGTH: usize = 1024;
pub const BINARY_PAYLOAD_PREFIX: usize = 2;

/// Upper bound on a full message: code/verb, two identifiers, payload and
/// separators.
pub const MAX_MESSAGE_LENGTH: usize = CODE_LENGTH
    + 5
    + MAX_VERB_LENGTH
    + 2 * MAX_IDENTIFIER_LENGTH
    + BINARY_PAYLOAD_PREFIX
    + MAX_PAYLOAD_LENGTH;

/// Bytes allowed in a VERB field.
pub static VERB_CHARSET: ByteSet = ByteSet::new().range(b'A', b'Z');

/// Bytes allowed in an IDENTIFIER field.
pub static ID_CHARSET: ByteSet = ByteSet::new()
    .range(b'a', b'z')
    .range(b'A', b'Z')
    .range(b'0', b'9')
    .all(b".:@/-_+=~");
