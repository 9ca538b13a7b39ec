use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    ByteSet, BINARY_PAYLOAD_PREFIX, CODE_LENGTH, ID_CHARSET, MAX_IDENTIFIER_LENGTH,
    MAX_MESSAGE_LENGTH, MAX_PAYLOAD_LENGTH, MAX_VERB_LENGTH, VERB_CHARSET,
};

/// Room for at least one maximum-length message plus read-ahead.
const BUFFER_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The transport reached end of stream with no bytes pending.
    #[error("end of stream")]
    Eof,
    /// The transport failed mid-message.
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    /// The bytes do not form a valid message.
    #[error("invalid message")]
    InvalidMessage,
}

/// A byte range into the decoder buffer, resolved with [`Decoder::bytes`].
///
/// Spans stay valid until the next [`Decoder::reset`], so every field of one
/// message can be held and resolved simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    start: usize,
    end: usize,
}

impl Span {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// An incremental SSMP frame decoder.
///
/// The decoder pulls bytes from `rd` on demand and parses one message field
/// at a time; the dispatcher decides which fields to expect after seeing the
/// verb. Field extractions return [`Span`]s aliasing the internal buffer and
/// never copy payload bytes.
///
/// After a message is fully consumed ([`Decoder::at_end`] is true), call
/// [`Decoder::reset`] before decoding the next one. A decoder whose last
/// extraction returned [`DecodeError::InvalidMessage`] is left at an
/// unspecified position and must not be reused.
pub struct Decoder<R> {
    rd: R,
    buf: Box<[u8]>,
    /// Start of the current raw message.
    s: usize,
    /// Read cursor.
    r: usize,
    /// Write cursor.
    w: usize,
    /// Transport error observed past the read cursor, released once the
    /// buffered bytes run out.
    last_err: Option<DecodeError>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(rd: R) -> Self {
        Self { rd, buf: vec![0; BUFFER_SIZE].into_boxed_slice(), s: 0, r: 0, w: 0, last_err: None }
    }

    /// Reads from the source until `n` bytes are available past the read
    /// cursor or the source fails.
    async fn ensure_buffered(&mut self, n: usize) -> Result<(), DecodeError> {
        while self.w - self.r < n {
            if let Some(err) = self.last_err.take() {
                return Err(err);
            }
            match self.rd.read(&mut self.buf[self.w..]).await {
                Ok(0) => self.last_err = Some(DecodeError::Eof),
                Ok(read) => self.w += read,
                Err(e) => self.last_err = Some(DecodeError::Io(e)),
            }
        }
        Ok(())
    }

    /// True iff the last consumed byte was the message terminator.
    #[inline]
    pub fn at_end(&self) -> bool {
        self.r > self.s && self.buf[self.r - 1] == b'\n'
    }

    /// Marks the start of the next message and compacts the buffer if less
    /// than one max-message-worth of room remains at the tail.
    ///
    /// Must only be called at a message boundary.
    pub fn reset(&mut self) {
        debug_assert!(self.at_end(), "reset outside a message boundary");
        if self.r >= self.buf.len() - MAX_MESSAGE_LENGTH {
            self.buf.copy_within(self.r..self.w, 0);
            self.w -= self.r;
            self.r = 0;
        }
        self.s = self.r;
    }

    /// The raw bytes of the current message, terminator included.
    pub fn raw_message(&self) -> &[u8] {
        debug_assert!(self.at_end(), "raw_message on a partial message");
        &self.buf[self.s..self.r]
    }

    /// Resolves a span produced by one of the `decode_*` operations.
    #[inline]
    pub fn bytes(&self, span: Span) -> &[u8] {
        &self.buf[span.start..span.end]
    }

    /// Consumes a three-digit response code and its delimiter.
    pub async fn decode_code(&mut self) -> Result<u16, DecodeError> {
        let mut code = 0u16;
        for i in 0..CODE_LENGTH {
            self.ensure_buffered(i + 1).await?;
            let c = self.buf[self.r + i];
            if !c.is_ascii_digit() {
                return Err(DecodeError::InvalidMessage);
            }
            code = 10 * code + u16::from(c - b'0');
        }
        self.ensure_buffered(CODE_LENGTH + 1).await?;
        let c = self.buf[self.r + CODE_LENGTH];
        if c != b' ' && c != b'\n' {
            return Err(DecodeError::InvalidMessage);
        }
        self.r += CODE_LENGTH + 1;
        Ok(code)
    }

    /// Consumes a VERB field (1..=16 uppercase letters) and its delimiter.
    pub async fn decode_verb(&mut self) -> Result<Span, DecodeError> {
        self.decode_field(&VERB_CHARSET, MAX_VERB_LENGTH).await
    }

    /// Consumes an IDENTIFIER field (1..=64 bytes) and its delimiter.
    pub async fn decode_id(&mut self) -> Result<Span, DecodeError> {
        self.decode_field(&ID_CHARSET, MAX_IDENTIFIER_LENGTH).await
    }

    async fn decode_field(&mut self, charset: &ByteSet, max: usize) -> Result<Span, DecodeError> {
        if self.at_end() {
            return Err(DecodeError::InvalidMessage);
        }
        let mut n = 0;
        while n <= max {
            self.ensure_buffered(n + 1).await?;
            let c = self.buf[self.r + n];
            n += 1;
            if c == b' ' || c == b'\n' {
                // empty fields are invalid
                if n == 1 {
                    break;
                }
                self.r += n;
                return Ok(Span { start: self.r - n, end: self.r - 1 });
            } else if !charset.contains(c) {
                break;
            }
        }
        Err(DecodeError::InvalidMessage)
    }

    /// Consumes a PAYLOAD field and the message terminator.
    ///
    /// A first byte in `0x00..=0x03` selects the binary form: two header
    /// bytes `b0 b1` encode a run of `1 + (b0 << 8) + b1` raw bytes, followed
    /// by the terminator. The returned span excludes the header. Any other
    /// first byte selects the text form: 1..=1024 bytes up to the terminator,
    /// none of them in `0x00..=0x03`.
    pub async fn decode_payload(&mut self) -> Result<Span, DecodeError> {
        if self.at_end() {
            return Err(DecodeError::InvalidMessage);
        }
        self.ensure_buffered(1).await?;
        if self.buf[self.r] <= 0x03 {
            let n = self.decode_binary_payload().await?;
            self.r += n + BINARY_PAYLOAD_PREFIX + 1;
            return Ok(Span { start: self.r - n - 1, end: self.r - 1 });
        }
        self.decode_text_payload().await
    }

    /// Consumes an optional identifier followed by an optional payload,
    /// returning the whole tail. Used to skip the arguments of unknown verbs.
    pub async fn decode_compat(&mut self) -> Result<Span, DecodeError> {
        if self.at_end() {
            return Ok(Span { start: self.r, end: self.r });
        }
        let s = self.r;
        match self.decode_id().await {
            Ok(_) | Err(DecodeError::InvalidMessage) => {}
            Err(e) => return Err(e),
        }
        if self.at_end() {
            return Ok(Span { start: s, end: self.r - 1 });
        }
        match self.decode_payload().await {
            Ok(_) => Ok(Span { start: s, end: self.r - 1 }),
            Err(e) => {
                self.r = s;
                Err(e)
            }
        }
    }

    /// Consumes the credential tail of a LOGIN request: empty if the message
    /// already ended, a binary payload if the first byte announces one,
    /// otherwise raw bytes up to the terminator.
    pub async fn decode_trailing(&mut self) -> Result<Span, DecodeError> {
        if self.at_end() {
            return Ok(Span { start: self.r, end: self.r });
        }
        self.ensure_buffered(1).await?;
        if self.buf[self.r] <= 0x03 {
            let n = self.decode_binary_payload().await?;
            self.r += n + BINARY_PAYLOAD_PREFIX + 1;
            return Ok(Span { start: self.r - n - 1, end: self.r - 1 });
        }
        let mut n = 0;
        while n <= MAX_PAYLOAD_LENGTH {
            self.ensure_buffered(n + 1).await?;
            let c = self.buf[self.r + n];
            n += 1;
            if c == b'\n' {
                self.r += n;
                return Ok(Span { start: self.r - n, end: self.r - 1 });
            }
        }
        Err(DecodeError::InvalidMessage)
    }

    async fn decode_text_payload(&mut self) -> Result<Span, DecodeError> {
        let mut n = 0;
        while n <= MAX_PAYLOAD_LENGTH {
            self.ensure_buffered(n + 1).await?;
            let c = self.buf[self.r + n];
            n += 1;
            if c == b'\n' {
                // empty text payload is invalid
                if n == 1 {
                    break;
                }
                self.r += n;
                return Ok(Span { start: self.r - n, end: self.r - 1 });
            } else if c <= 0x03 {
                break;
            }
        }
        Err(DecodeError::InvalidMessage)
    }

    /// Validates a binary payload and returns its length without consuming
    /// anything.
    async fn decode_binary_payload(&mut self) -> Result<usize, DecodeError> {
        self.ensure_buffered(BINARY_PAYLOAD_PREFIX).await?;
        let n = 1 + ((self.buf[self.r] as usize) << 8) + self.buf[self.r + 1] as usize;
        if n > MAX_PAYLOAD_LENGTH {
            return Err(DecodeError::InvalidMessage);
        }
        self.ensure_buffered(n + BINARY_PAYLOAD_PREFIX + 1).await?;
        if self.buf[self.r + n + BINARY_PAYLOAD_PREFIX] != b'\n' {
            return Err(DecodeError::InvalidMessage);
        }
        Ok(n)
    }
}
