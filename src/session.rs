//! Protocol sessions.
//!
//! A session owns the framing of one application protocol over one
//! connection. Bytes flow in through [`Session::on_read`] and out through
//! [`Session::on_write`], which drains the session's queued frames into
//! the client's write buffer. Everything a session learns about streams
//! travels upward as [`SessionEvent`]s, drained synchronously by the
//! client after each call.

use core::fmt::Debug;
use std::collections::VecDeque;

use anyhow::Result;
use bytes::{Bytes, BytesMut};

pub mod bolt;
pub mod hpack;
pub mod http1;
pub mod http2;

/// Write buffer level above which the client stops pulling frames from
/// the session until the socket drains.
pub const BACKOFF_WRITE_BUFFER_THRES: usize = 16 * 1024;

/// Events a session reports to its client.
#[derive(Debug)]
pub enum SessionEvent {
    /// A request was handed to the protocol layer; the stream exists now.
    Request { stream_id: u32 },
    /// A response header field arrived (HTTP/2 path).
    Header { stream_id: u32, name: Bytes, value: Bytes },
    /// A response status arrived (HTTP/1.1 path).
    StatusCode { stream_id: u32, status: u16 },
    /// A SOFARPC response status arrived.
    RpcStatus { stream_id: u32, status: u16 },
    /// A stream finished. `success` means the protocol layer saw a
    /// complete exchange; `last` means no further request may be
    /// submitted on this connection.
    StreamClose { stream_id: u32, success: bool, last: bool },
    /// First response byte of this connection.
    FirstByte,
    /// The session wants the client to reconnect before submitting more
    /// requests (http/1.1 `Connection: close`).
    NewConnection,
    /// Header bytes received: wire size and decompressed size.
    HeadBytes { wire: u64, decomp: u64 },
    /// Body bytes received.
    BodyBytes { n: u64 },
}

pub type EventSink = VecDeque<SessionEvent>;

/// Uniform framing contract consumed by the client.
pub trait Session: Debug {
    /// Called once the connection (and TLS, if any) is established.
    fn on_connect(&mut self, out: &mut EventSink);

    /// Queues one request. Emits [`SessionEvent::Request`] on success.
    fn submit_request(&mut self, out: &mut EventSink) -> Result<()>;

    /// Feeds received bytes through the protocol decoder.
    fn on_read(&mut self, data: &[u8], out: &mut EventSink) -> Result<()>;

    /// Moves queued frames into the client's write buffer.
    fn on_write(&mut self, wb: &mut BytesMut, out: &mut EventSink) -> Result<()>;

    /// Called when the peer closed the read side cleanly. Lets the
    /// http/1.1 read-until-close body complete its stream.
    fn on_eof(&mut self, _out: &mut EventSink) {}

    /// In-flight cap for this session.
    fn max_concurrent_streams(&self) -> u32;

    /// Starts a graceful shutdown; no more requests are accepted.
    fn terminate(&mut self);

    /// True once the session is terminated and fully flushed, at which
    /// point the client may tear the connection down.
    fn is_closed(&self) -> bool;
}
