//! Wire framing and packet classification.
//!
//! Each ESL packet is a MIME-style header block terminated by a blank line,
//! optionally followed by exactly `Content-Length` body bytes. The
//! [`PacketDecoder`] accumulates stream data and emits [`RawPacket`]s; the
//! [`classify`](RawPacket::classify) step tags each packet by its
//! `Content-Type` so the session loop can route it.

use std::fmt;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::constants::*;
use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use crate::headers::Headers;

/// A framed packet as read off the socket: envelope headers plus an
/// unparsed body. Envelope header values are never percent-escaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPacket {
    pub headers: Headers,
    pub body: String,
}

impl RawPacket {
    /// Value of the `Content-Type` header, empty when absent.
    pub fn content_type(&self) -> &str {
        self.headers.get(HEADER_CONTENT_TYPE)
    }

    /// Tag this packet by its `Content-Type`.
    pub fn classify(self) -> Packet {
        match self.content_type() {
            CONTENT_TYPE_AUTH_REQUEST => Packet::AuthRequest(self),
            CONTENT_TYPE_COMMAND_REPLY => Packet::Reply(Reply { raw: self }),
            CONTENT_TYPE_API_RESPONSE => Packet::ApiResponse(ApiResponse { raw: self }),
            CONTENT_TYPE_EVENT_PLAIN => Packet::Event(EslEvent::from_packet(self)),
            CONTENT_TYPE_DISCONNECT_NOTICE => Packet::Disconnect(DisconnectNotice { raw: self }),
            _ => Packet::Other(self),
        }
    }
}

impl fmt::Display for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.headers, self.body)
    }
}

/// A [`RawPacket`] tagged by content type.
#[derive(Debug)]
pub enum Packet {
    /// `auth/request` - FreeSWITCH wants a password
    AuthRequest(RawPacket),
    /// `command/reply` - short `+OK`/`-ERR` acknowledgement
    Reply(Reply),
    /// `api/response` - textual payload of a synchronous API command
    ApiResponse(ApiResponse),
    /// `text/event-plain` - an event notification
    Event(EslEvent),
    /// `text/disconnect-notice` - the server is hanging up
    Disconnect(DisconnectNotice),
    /// Anything else, passed through untouched
    Other(RawPacket),
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::AuthRequest(raw) | Packet::Other(raw) => raw.fmt(f),
            Packet::Reply(reply) => reply.fmt(f),
            Packet::ApiResponse(response) => response.fmt(f),
            Packet::Event(event) => event.fmt(f),
            Packet::Disconnect(notice) => notice.fmt(f),
        }
    }
}

/// A `command/reply` packet.
#[derive(Debug)]
pub struct Reply {
    raw: RawPacket,
}

impl Reply {
    /// The full `Reply-Text` header.
    pub fn reply_text(&self) -> &str {
        self.raw.headers.get(HEADER_REPLY_TEXT)
    }

    /// `true` when `Reply-Text` starts with `+OK`.
    pub fn ok(&self) -> bool {
        self.reply_text().starts_with("+OK")
    }

    /// Everything after the first space of `Reply-Text`, empty when the
    /// reply carries no detail.
    pub fn text(&self) -> &str {
        self.reply_text()
            .split_once(' ')
            .map(|(_, rest)| rest)
            .unwrap_or("")
    }

    /// The `Job-UUID` header a `bgapi` reply echoes back, empty otherwise.
    pub fn job_uuid(&self) -> &str {
        self.raw.headers.get(HEADER_JOB_UUID)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reply_text())
    }
}

/// An `api/response` packet; stringifies to its raw body.
#[derive(Debug)]
pub struct ApiResponse {
    raw: RawPacket,
}

impl ApiResponse {
    pub fn body(&self) -> &str {
        &self.raw.body
    }
}

impl fmt::Display for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw.body)
    }
}

/// A `text/disconnect-notice` packet; stringifies to its raw body.
#[derive(Debug)]
pub struct DisconnectNotice {
    raw: RawPacket,
}

impl fmt::Display for DisconnectNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw.body)
    }
}

enum DecodeState {
    Headers,
    Body { headers: Headers, length: usize },
}

/// Incremental packet framer. Feed it stream data with
/// [`feed`](Self::feed) and drain complete packets with
/// [`next_packet`](Self::next_packet).
pub struct PacketDecoder {
    buf: BytesMut,
    state: DecodeState,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(SOCKET_BUF_SIZE),
            state: DecodeState::Headers,
        }
    }

    /// Append stream data to the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) -> EslResult<()> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFER_SIZE {
            return Err(EslError::protocol(format!(
                "receive buffer exceeds {} bytes, protocol desync",
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Extract the next complete packet, or `None` when more stream data is
    /// needed.
    pub fn next_packet(&mut self) -> EslResult<Option<RawPacket>> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Headers) {
                DecodeState::Headers => {
                    let Some((block_len, consumed)) = find_blank_line(&self.buf) else {
                        return Ok(None);
                    };
                    let block = std::str::from_utf8(&self.buf[..block_len])
                        .map_err(|_| EslError::protocol("non-UTF-8 packet headers"))?;
                    let headers = Headers::parse(block, false)?;
                    self.buf.advance(consumed);

                    let length = match headers.get(HEADER_CONTENT_LENGTH) {
                        "" => 0,
                        text => text.trim().parse::<usize>().map_err(|_| {
                            EslError::protocol(format!("invalid Content-Length: {text:?}"))
                        })?,
                    };
                    if length > MAX_MESSAGE_SIZE {
                        return Err(EslError::protocol(format!(
                            "Content-Length {} exceeds limit {}",
                            length, MAX_MESSAGE_SIZE
                        )));
                    }
                    if length > 0 {
                        self.state = DecodeState::Body { headers, length };
                    } else {
                        trace!(content_type = headers.get(HEADER_CONTENT_TYPE), "framed packet");
                        return Ok(Some(RawPacket {
                            headers,
                            body: String::new(),
                        }));
                    }
                }
                DecodeState::Body { headers, length } => {
                    if self.buf.len() < length {
                        self.state = DecodeState::Body { headers, length };
                        return Ok(None);
                    }
                    let body_bytes = self.buf.split_to(length);
                    let body = String::from_utf8(body_bytes.to_vec())
                        .map_err(|_| EslError::protocol("non-UTF-8 packet body"))?;
                    trace!(
                        content_type = headers.get(HEADER_CONTENT_TYPE),
                        body_len = body.len(),
                        "framed packet"
                    );
                    return Ok(Some(RawPacket { headers, body }));
                }
            }
        }
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate the blank line terminating a header block. Returns the length of
/// the header block (including its final newline) and the total number of
/// bytes to consume. Lines may end with either `\n` or `\r\n`.
pub(crate) fn find_blank_line(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == b'\n' {
            if data[i + 1] == b'\n' {
                return Some((i + 1, i + 2));
            }
            if data[i + 1] == b'\r' && data.get(i + 2) == Some(&b'\n') {
                return Some((i + 1, i + 3));
            }
        }
        i += 1;
    }
    None
}
