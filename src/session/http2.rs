//! HTTP/2 session: client preface, SETTINGS, HPACK-coded HEADERS and DATA
//! framing over the client's byte buffers. Stream ids are the odd ids the
//! protocol assigns to client-initiated streams, in submission order.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{hpack, EventSink, Session, SessionEvent};
use crate::cfg::Config;

const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEAD_LEN: usize = 9;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_PUSH_PROMISE: u8 = 0x5;
const FRAME_PING: u8 = 0x6;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

const DEFAULT_WINDOW: i64 = 65_535;
/// Stream and connection receive windows are raised to 2^30 - 1 so flow
/// control never throttles the benchmark's downloads.
const LOCAL_WINDOW: u32 = (1 << 30) - 1;
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;

#[derive(Debug)]
struct Continuation {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

#[derive(Debug)]
pub struct Http2Session {
    cfg: Arc<Config>,
    decoder: hpack::Decoder,
    next_stream_id: u32,
    reqidx: usize,
    outbox: BytesMut,
    rbuf: BytesMut,
    open: HashSet<u32>,
    continuation: Option<Continuation>,
    /// Peer-granted connection-level send window.
    conn_send_window: i64,
    stream_send_windows: HashMap<u32, i64>,
    peer_initial_window: i64,
    peer_max_frame_size: usize,
    /// Request bodies waiting for send-window capacity.
    pending_data: VecDeque<(u32, Bytes)>,
    saw_first_byte: bool,
    goaway_last_id: Option<u32>,
    terminated: bool,
}

fn frame_head(out: &mut BytesMut, len: usize, typ: u8, flags: u8, stream_id: u32) {
    out.put_uint(len as u64, 3);
    out.put_u8(typ);
    out.put_u8(flags);
    out.put_u32(stream_id);
}

impl Http2Session {
    pub fn new(cfg: Arc<Config>) -> Self {
        let decoder = hpack::Decoder::new(cfg.header_table_size as usize);

        Self {
            cfg,
            decoder,
            next_stream_id: 1,
            reqidx: 0,
            outbox: BytesMut::new(),
            rbuf: BytesMut::new(),
            open: HashSet::new(),
            continuation: None,
            conn_send_window: DEFAULT_WINDOW,
            stream_send_windows: HashMap::new(),
            peer_initial_window: DEFAULT_WINDOW,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pending_data: VecDeque::new(),
            saw_first_byte: false,
            goaway_last_id: None,
            terminated: false,
        }
    }

    fn close_stream(&mut self, stream_id: u32, success: bool, out: &mut EventSink) {
        if !self.open.remove(&stream_id) {
            return;
        }
        self.stream_send_windows.remove(&stream_id);
        self.pending_data.retain(|(id, _)| *id != stream_id);
        out.push_back(SessionEvent::StreamClose {
            stream_id,
            success,
            last: self.goaway_last_id.is_some(),
        });
    }

    fn decode_header_block(&mut self, stream_id: u32, block: &[u8], end_stream: bool, out: &mut EventSink) -> Result<()> {
        let fields = self.decoder.decode(block)?;
        let decomp: u64 = fields.iter().map(|(n, v)| (n.len() + v.len()) as u64).sum();
        out.push_back(SessionEvent::HeadBytes { wire: block.len() as u64, decomp });
        for (name, value) in fields {
            out.push_back(SessionEvent::Header { stream_id, name, value });
        }
        if end_stream {
            self.close_stream(stream_id, true, out);
        }

        Ok(())
    }

    fn queue_window_update(&mut self, stream_id: u32, increment: u32) {
        frame_head(&mut self.outbox, 4, FRAME_WINDOW_UPDATE, 0, stream_id);
        self.outbox.put_u32(increment);
    }

    /// Moves queued request bodies into DATA frames as far as the peer's
    /// send windows allow.
    fn drain_pending_data(&mut self) {
        while let Some((stream_id, body)) = self.pending_data.front().cloned() {
            let stream_window = *self.stream_send_windows.get(&stream_id).unwrap_or(&0);
            let budget = self
                .conn_send_window
                .min(stream_window)
                .min(self.peer_max_frame_size as i64);
            if budget <= 0 {
                return;
            }
            let take = (budget as usize).min(body.len());
            let last = take == body.len();
            let flags = if last { FLAG_END_STREAM } else { 0 };

            frame_head(&mut self.outbox, take, FRAME_DATA, flags, stream_id);
            self.outbox.extend_from_slice(&body[..take]);
            self.conn_send_window -= take as i64;
            if let Some(w) = self.stream_send_windows.get_mut(&stream_id) {
                *w -= take as i64;
            }

            if last {
                self.pending_data.pop_front();
            } else {
                self.pending_data[0].1 = body.slice(take..);
            }
        }
    }

    fn handle_settings(&mut self, payload: &[u8], flags: u8) -> Result<()> {
        if flags & FLAG_ACK != 0 {
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            bail!("malformed SETTINGS frame");
        }
        let mut p = payload;
        while p.has_remaining() {
            let id = p.get_u16();
            let value = p.get_u32();
            match id {
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    let delta = i64::from(value) - self.peer_initial_window;
                    self.peer_initial_window = i64::from(value);
                    for w in self.stream_send_windows.values_mut() {
                        *w += delta;
                    }
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    self.peer_max_frame_size = value as usize;
                }
                _ => {}
            }
        }
        frame_head(&mut self.outbox, 0, FRAME_SETTINGS, FLAG_ACK, 0);
        self.drain_pending_data();

        Ok(())
    }

    fn handle_frame(&mut self, typ: u8, flags: u8, stream_id: u32, payload: Bytes, out: &mut EventSink) -> Result<()> {
        if let Some(cont) = &self.continuation {
            if typ != FRAME_CONTINUATION || stream_id != cont.stream_id {
                bail!("expected CONTINUATION for stream {}", cont.stream_id);
            }
        }

        match typ {
            FRAME_HEADERS => {
                let mut p = payload;
                if flags & FLAG_PADDED != 0 {
                    if p.is_empty() {
                        bail!("malformed HEADERS frame");
                    }
                    let pad = p[0] as usize;
                    if pad + 1 > p.len() {
                        bail!("malformed HEADERS padding");
                    }
                    p = p.slice(1..p.len() - pad);
                }
                if flags & FLAG_PRIORITY != 0 {
                    if p.len() < 5 {
                        bail!("malformed HEADERS frame");
                    }
                    p.advance(5);
                }
                let end_stream = flags & FLAG_END_STREAM != 0;
                if flags & FLAG_END_HEADERS != 0 {
                    self.decode_header_block(stream_id, &p, end_stream, out)?;
                } else {
                    self.continuation = Some(Continuation {
                        stream_id,
                        block: BytesMut::from(&p[..]),
                        end_stream,
                    });
                }
            }
            FRAME_CONTINUATION => {
                let Some(mut cont) = self.continuation.take() else {
                    bail!("unexpected CONTINUATION frame");
                };
                cont.block.extend_from_slice(&payload);
                if flags & FLAG_END_HEADERS != 0 {
                    let block = cont.block.freeze();
                    self.decode_header_block(cont.stream_id, &block, cont.end_stream, out)?;
                } else {
                    self.continuation = Some(cont);
                }
            }
            FRAME_DATA => {
                let wire_len = payload.len();
                let mut p = payload;
                if flags & FLAG_PADDED != 0 {
                    if p.is_empty() {
                        bail!("malformed DATA frame");
                    }
                    let pad = p[0] as usize;
                    if pad + 1 > p.len() {
                        bail!("malformed DATA padding");
                    }
                    p = p.slice(1..p.len() - pad);
                }
                if !p.is_empty() {
                    out.push_back(SessionEvent::BodyBytes { n: p.len() as u64 });
                }
                let end_stream = flags & FLAG_END_STREAM != 0;
                if wire_len > 0 {
                    self.queue_window_update(0, wire_len as u32);
                    if !end_stream {
                        self.queue_window_update(stream_id, wire_len as u32);
                    }
                }
                if end_stream {
                    self.close_stream(stream_id, true, out);
                }
            }
            FRAME_RST_STREAM => {
                self.close_stream(stream_id, false, out);
            }
            FRAME_SETTINGS => {
                self.handle_settings(&payload, flags)?;
            }
            FRAME_PING => {
                if flags & FLAG_ACK == 0 {
                    frame_head(&mut self.outbox, payload.len(), FRAME_PING, FLAG_ACK, 0);
                    self.outbox.extend_from_slice(&payload);
                }
            }
            FRAME_GOAWAY => {
                if payload.len() < 8 {
                    bail!("malformed GOAWAY frame");
                }
                let mut p = payload;
                let last = p.get_u32() & 0x7fff_ffff;
                let error = p.get_u32();
                if error != 0 {
                    log::debug!("GOAWAY with error code {error}");
                }
                self.goaway_last_id = Some(last);
                let orphans: Vec<u32> = self.open.iter().copied().filter(|&id| id > last).collect();
                for id in orphans {
                    self.close_stream(id, false, out);
                }
            }
            FRAME_WINDOW_UPDATE => {
                if payload.len() != 4 {
                    bail!("malformed WINDOW_UPDATE frame");
                }
                let mut p = &payload[..];
                let incr = i64::from(p.get_u32() & 0x7fff_ffff);
                if stream_id == 0 {
                    self.conn_send_window += incr;
                } else if let Some(w) = self.stream_send_windows.get_mut(&stream_id) {
                    *w += incr;
                }
                self.drain_pending_data();
            }
            FRAME_PUSH_PROMISE => {
                bail!("server push is disabled");
            }
            _ => {}
        }

        Ok(())
    }
}

impl Session for Http2Session {
    fn on_connect(&mut self, _out: &mut EventSink) {
        self.outbox.extend_from_slice(CONNECTION_PREFACE);

        frame_head(&mut self.outbox, 3 * 6, FRAME_SETTINGS, 0, 0);
        self.outbox.put_u16(SETTINGS_HEADER_TABLE_SIZE);
        self.outbox.put_u32(self.cfg.header_table_size);
        self.outbox.put_u16(SETTINGS_ENABLE_PUSH);
        self.outbox.put_u32(0);
        self.outbox.put_u16(SETTINGS_INITIAL_WINDOW_SIZE);
        self.outbox.put_u32(LOCAL_WINDOW);

        self.queue_window_update(0, LOCAL_WINDOW - DEFAULT_WINDOW as u32);
    }

    fn submit_request(&mut self, out: &mut EventSink) -> Result<()> {
        if self.terminated {
            bail!("session is terminating");
        }
        if self.goaway_last_id.is_some() {
            bail!("GOAWAY received");
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let template = self.cfg.h2_templates[self.reqidx].clone();
        self.reqidx = (self.reqidx + 1) % self.cfg.h2_templates.len();

        let mut block = BytesMut::new();
        hpack::encode_block(&template, &mut block);

        let end_stream = if self.cfg.data.is_none() { FLAG_END_STREAM } else { 0 };
        let mut first = true;
        let mut rest = &block[..];
        loop {
            let take = rest.len().min(self.peer_max_frame_size);
            let end = take == rest.len();
            let typ = if first { FRAME_HEADERS } else { FRAME_CONTINUATION };
            let mut flags = if first { end_stream } else { 0 };
            if end {
                flags |= FLAG_END_HEADERS;
            }
            frame_head(&mut self.outbox, take, typ, flags, stream_id);
            self.outbox.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            first = false;
            if end {
                break;
            }
        }

        if let Some(data) = &self.cfg.data {
            self.stream_send_windows.insert(stream_id, self.peer_initial_window);
            self.pending_data.push_back((stream_id, data.clone()));
            self.drain_pending_data();
        }

        self.open.insert(stream_id);
        out.push_back(SessionEvent::Request { stream_id });

        Ok(())
    }

    fn on_read(&mut self, data: &[u8], out: &mut EventSink) -> Result<()> {
        if !self.saw_first_byte && !data.is_empty() {
            self.saw_first_byte = true;
            out.push_back(SessionEvent::FirstByte);
        }
        self.rbuf.extend_from_slice(data);

        while self.rbuf.len() >= FRAME_HEAD_LEN {
            let len = u32::from_be_bytes([0, self.rbuf[0], self.rbuf[1], self.rbuf[2]]) as usize;
            if self.rbuf.len() < FRAME_HEAD_LEN + len {
                break;
            }
            let typ = self.rbuf[3];
            let flags = self.rbuf[4];
            let stream_id =
                u32::from_be_bytes([self.rbuf[5], self.rbuf[6], self.rbuf[7], self.rbuf[8]]) & 0x7fff_ffff;
            self.rbuf.advance(FRAME_HEAD_LEN);
            let payload = self.rbuf.split_to(len).freeze();

            self.handle_frame(typ, flags, stream_id, payload, out)?;
        }

        Ok(())
    }

    fn on_write(&mut self, wb: &mut BytesMut, _out: &mut EventSink) -> Result<()> {
        self.drain_pending_data();
        if !self.outbox.is_empty() {
            wb.extend_from_slice(&self.outbox);
            self.outbox.clear();
        }

        Ok(())
    }

    fn max_concurrent_streams(&self) -> u32 {
        self.cfg.max_concurrent_streams
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        // GOAWAY, no error: we initiated the shutdown.
        frame_head(&mut self.outbox, 8, FRAME_GOAWAY, 0, 0);
        self.outbox.put_u32(0);
        self.outbox.put_u32(0);
    }

    fn is_closed(&self) -> bool {
        self.terminated && self.outbox.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::{cfg::Config, cmd::Cmd};

    fn session() -> Http2Session {
        let cmd = Cmd::try_parse_from(["volley", "http://localhost/"]).unwrap();
        Http2Session::new(Arc::new(Config::try_from(cmd).unwrap()))
    }

    fn flush(s: &mut Http2Session) -> BytesMut {
        let mut wb = BytesMut::new();
        let mut out = EventSink::new();
        s.on_write(&mut wb, &mut out).unwrap();
        wb
    }

    fn frames(mut buf: &[u8]) -> Vec<(u8, u8, u32, Vec<u8>)> {
        let mut out = Vec::new();
        while buf.len() >= FRAME_HEAD_LEN {
            let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
            let typ = buf[3];
            let flags = buf[4];
            let sid = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
            let payload = buf[9..9 + len].to_vec();
            out.push((typ, flags, sid, payload));
            buf = &buf[9 + len..];
        }
        out
    }

    fn server_headers_200(stream_id: u32, end_stream: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        let flags = FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 };
        // 0x88 = indexed static entry ":status 200".
        frame_head(&mut buf, 1, FRAME_HEADERS, flags, stream_id);
        buf.put_u8(0x88);
        buf
    }

    fn closes(out: &EventSink) -> Vec<(u32, bool)> {
        out.iter()
            .filter_map(|ev| match ev {
                SessionEvent::StreamClose { stream_id, success, .. } => Some((*stream_id, *success)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_emits_preface_settings_and_window() {
        let mut s = session();
        let mut out = EventSink::new();
        s.on_connect(&mut out);
        let wb = flush(&mut s);

        assert!(wb.starts_with(CONNECTION_PREFACE));
        let fr = frames(&wb[CONNECTION_PREFACE.len()..]);
        assert_eq!(fr[0].0, FRAME_SETTINGS);
        assert_eq!(fr[1].0, FRAME_WINDOW_UPDATE);
        assert_eq!(fr[1].2, 0);
    }

    #[test]
    fn submitted_request_becomes_headers_frame() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        assert!(matches!(out.pop_front(), Some(SessionEvent::Request { stream_id: 1 })));

        let wb = flush(&mut s);
        let fr = frames(&wb);
        assert_eq!(fr.len(), 1);
        let (typ, flags, sid, payload) = &fr[0];
        assert_eq!(*typ, FRAME_HEADERS);
        assert_eq!(*flags, FLAG_END_HEADERS | FLAG_END_STREAM);
        assert_eq!(*sid, 1);

        // The block decodes back to the request template.
        let mut dec = hpack::Decoder::new(4096);
        let fields = dec.decode(payload).unwrap();
        assert_eq!(&fields[0].0[..], b":path");
        assert!(fields.iter().any(|(n, v)| &n[..] == b":method" && &v[..] == b"GET"));
    }

    #[test]
    fn response_headers_close_the_stream() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        out.clear();

        s.on_read(&server_headers_200(1, true), &mut out).unwrap();
        assert!(out.iter().any(|ev| matches!(
            ev,
            SessionEvent::Header { stream_id: 1, name, value } if &name[..] == b":status" && &value[..] == b"200"
        )));
        assert_eq!(closes(&out), vec![(1, true)]);
    }

    #[test]
    fn data_end_stream_closes_and_updates_window() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        out.clear();

        s.on_read(&server_headers_200(1, false), &mut out).unwrap();
        assert!(closes(&out).is_empty());

        let mut data = BytesMut::new();
        frame_head(&mut data, 2, FRAME_DATA, FLAG_END_STREAM, 1);
        data.put_slice(b"ok");
        s.on_read(&data, &mut out).unwrap();
        assert_eq!(closes(&out), vec![(1, true)]);

        let wb = flush(&mut s);
        let fr = frames(&wb);
        assert!(fr.iter().any(|f| f.0 == FRAME_WINDOW_UPDATE && f.2 == 0));
    }

    #[test]
    fn rst_stream_fails_the_stream() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        out.clear();

        let mut rst = BytesMut::new();
        frame_head(&mut rst, 4, FRAME_RST_STREAM, 0, 1);
        rst.put_u32(0x8); // CANCEL
        s.on_read(&rst, &mut out).unwrap();
        assert_eq!(closes(&out), vec![(1, false)]);
    }

    #[test]
    fn settings_are_acked_and_ping_is_answered() {
        let mut s = session();
        let mut out = EventSink::new();

        let mut buf = BytesMut::new();
        frame_head(&mut buf, 6, FRAME_SETTINGS, 0, 0);
        buf.put_u16(SETTINGS_MAX_FRAME_SIZE);
        buf.put_u32(32_768);
        frame_head(&mut buf, 8, FRAME_PING, 0, 0);
        buf.put_u64(0xdead_beef);
        s.on_read(&buf, &mut out).unwrap();

        let wb = flush(&mut s);
        let fr = frames(&wb);
        assert!(fr.iter().any(|f| f.0 == FRAME_SETTINGS && f.1 == FLAG_ACK));
        assert!(fr
            .iter()
            .any(|f| f.0 == FRAME_PING && f.1 == FLAG_ACK && f.3 == 0xdead_beefu64.to_be_bytes()));
        assert_eq!(s.peer_max_frame_size, 32_768);
    }

    #[test]
    fn goaway_fails_streams_above_last_id() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap(); // stream 1
        s.submit_request(&mut out).unwrap(); // stream 3
        out.clear();

        let mut buf = BytesMut::new();
        frame_head(&mut buf, 8, FRAME_GOAWAY, 0, 0);
        buf.put_u32(1);
        buf.put_u32(0);
        s.on_read(&buf, &mut out).unwrap();
        assert_eq!(closes(&out), vec![(3, false)]);

        assert!(s.submit_request(&mut out).is_err());
    }

    #[test]
    fn terminate_sends_goaway_once() {
        let mut s = session();
        s.terminate();
        s.terminate();
        let wb = flush(&mut s);
        let fr = frames(&wb);
        assert_eq!(fr.len(), 1);
        assert_eq!(fr[0].0, FRAME_GOAWAY);
        assert!(s.is_closed());
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        out.clear();

        let full = server_headers_200(1, true);
        s.on_read(&full[..5], &mut out).unwrap();
        assert!(closes(&out).is_empty());
        s.on_read(&full[5..], &mut out).unwrap();
        assert_eq!(closes(&out), vec![(1, true)]);
    }
}
