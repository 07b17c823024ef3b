//! HTTP/1.1 session: prebuilt request heads out, `httparse` response
//! heads in, with content-length, chunked and read-until-close bodies.
//! Pipelining is permitted up to the configured stream cap; responses
//! complete in submission order.

use std::{collections::VecDeque, sync::Arc};

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

use super::{EventSink, Session, SessionEvent};
use crate::cfg::Config;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Chunk {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reading {
    Head,
    Body { framing: Framing, keep_alive: bool },
}

#[derive(Debug)]
pub struct Http1Session {
    cfg: Arc<Config>,
    next_stream_id: u32,
    reqidx: usize,
    outbox: BytesMut,
    rbuf: BytesMut,
    inflight: VecDeque<u32>,
    reading: Reading,
    saw_first_byte: bool,
    terminated: bool,
}

impl Http1Session {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            next_stream_id: 1,
            reqidx: 0,
            outbox: BytesMut::new(),
            rbuf: BytesMut::new(),
            inflight: VecDeque::new(),
            reading: Reading::Head,
            saw_first_byte: false,
            terminated: false,
        }
    }

    fn finish_stream(&mut self, keep_alive: bool, out: &mut EventSink) -> Result<()> {
        let Some(stream_id) = self.inflight.pop_front() else {
            bail!("response without a pending request");
        };
        if !keep_alive {
            out.push_back(SessionEvent::NewConnection);
        }
        out.push_back(SessionEvent::StreamClose {
            stream_id,
            success: true,
            last: !keep_alive,
        });
        self.reading = Reading::Head;

        Ok(())
    }

    fn parse_head(&mut self, out: &mut EventSink) -> Result<bool> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);
        let n = match resp.parse(&self.rbuf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(false),
            Err(e) => bail!("bad http/1.1 response: {e}"),
        };

        let status = resp.code.unwrap_or(0);
        if status == 100 {
            // Interim response; the real one follows on the same stream.
            self.rbuf.advance(n);
            return Ok(true);
        }

        let Some(&stream_id) = self.inflight.front() else {
            bail!("response without a pending request");
        };

        let mut keep_alive = resp.version != Some(0);
        let mut content_length = None;
        let mut chunked = false;
        for h in resp.headers.iter() {
            if h.name.eq_ignore_ascii_case("content-length") {
                let v = core::str::from_utf8(h.value).unwrap_or("");
                content_length = Some(v.trim().parse::<u64>().map_err(|_| {
                    anyhow::anyhow!("bad content-length: {v}")
                })?);
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                let v = core::str::from_utf8(h.value).unwrap_or("");
                chunked |= v.to_ascii_lowercase().contains("chunked");
            } else if h.name.eq_ignore_ascii_case("connection") {
                let v = core::str::from_utf8(h.value).unwrap_or("").to_ascii_lowercase();
                if v.contains("close") {
                    keep_alive = false;
                } else if v.contains("keep-alive") {
                    keep_alive = true;
                }
            }
        }

        out.push_back(SessionEvent::HeadBytes { wire: n as u64, decomp: n as u64 });
        out.push_back(SessionEvent::StatusCode { stream_id, status });

        self.rbuf.advance(n);

        let framing = if chunked {
            Framing::Chunked(Chunk::Size)
        } else if status == 204 || status == 304 {
            Framing::Length(0)
        } else if let Some(len) = content_length {
            Framing::Length(len)
        } else {
            keep_alive = false;
            Framing::UntilClose
        };
        self.reading = Reading::Body { framing, keep_alive };

        Ok(true)
    }

    /// Consumes body bytes per the current framing. Returns false when
    /// more input is needed.
    fn parse_body(&mut self, framing: Framing, keep_alive: bool, out: &mut EventSink) -> Result<bool> {
        match framing {
            Framing::Length(rem) => {
                let take = rem.min(self.rbuf.len() as u64);
                if take > 0 {
                    out.push_back(SessionEvent::BodyBytes { n: take });
                    self.rbuf.advance(take as usize);
                }
                if rem == take {
                    self.finish_stream(keep_alive, out)?;
                    return Ok(true);
                }
                self.reading = Reading::Body {
                    framing: Framing::Length(rem - take),
                    keep_alive,
                };
                Ok(false)
            }
            Framing::Chunked(chunk) => self.parse_chunk(chunk, keep_alive, out),
            Framing::UntilClose => {
                if !self.rbuf.is_empty() {
                    out.push_back(SessionEvent::BodyBytes { n: self.rbuf.len() as u64 });
                    self.rbuf.clear();
                }
                Ok(false)
            }
        }
    }

    fn parse_chunk(&mut self, chunk: Chunk, keep_alive: bool, out: &mut EventSink) -> Result<bool> {
        match chunk {
            Chunk::Size => {
                let Some(eol) = find_crlf(&self.rbuf) else {
                    return Ok(false);
                };
                let line = core::str::from_utf8(&self.rbuf[..eol]).unwrap_or("");
                let size_str = line.split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(size_str, 16)
                    .map_err(|_| anyhow::anyhow!("bad chunk size: {line}"))?;
                self.rbuf.advance(eol + 2);
                let next = if size == 0 { Chunk::Trailer } else { Chunk::Data(size) };
                self.reading = Reading::Body { framing: Framing::Chunked(next), keep_alive };
                Ok(true)
            }
            Chunk::Data(rem) => {
                let take = rem.min(self.rbuf.len() as u64);
                if take > 0 {
                    out.push_back(SessionEvent::BodyBytes { n: take });
                    self.rbuf.advance(take as usize);
                }
                let next = if rem == take { Chunk::DataCrlf } else { Chunk::Data(rem - take) };
                self.reading = Reading::Body { framing: Framing::Chunked(next), keep_alive };
                Ok(rem == take && !self.rbuf.is_empty())
            }
            Chunk::DataCrlf => {
                if self.rbuf.len() < 2 {
                    return Ok(false);
                }
                if &self.rbuf[..2] != b"\r\n" {
                    bail!("missing chunk delimiter");
                }
                self.rbuf.advance(2);
                self.reading = Reading::Body {
                    framing: Framing::Chunked(Chunk::Size),
                    keep_alive,
                };
                Ok(true)
            }
            Chunk::Trailer => {
                let Some(eol) = find_crlf(&self.rbuf) else {
                    return Ok(false);
                };
                let empty = eol == 0;
                self.rbuf.advance(eol + 2);
                if empty {
                    self.finish_stream(keep_alive, out)?;
                }
                Ok(true)
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl Session for Http1Session {
    fn on_connect(&mut self, _out: &mut EventSink) {}

    fn submit_request(&mut self, out: &mut EventSink) -> Result<()> {
        self.outbox.extend_from_slice(&self.cfg.h1reqs[self.reqidx]);
        self.reqidx = (self.reqidx + 1) % self.cfg.h1reqs.len();
        if let Some(data) = &self.cfg.data {
            self.outbox.extend_from_slice(data);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.inflight.push_back(stream_id);
        out.push_back(SessionEvent::Request { stream_id });

        Ok(())
    }

    fn on_read(&mut self, data: &[u8], out: &mut EventSink) -> Result<()> {
        if !self.saw_first_byte && !data.is_empty() {
            self.saw_first_byte = true;
            out.push_back(SessionEvent::FirstByte);
        }
        self.rbuf.extend_from_slice(data);

        loop {
            let progressed = match self.reading {
                Reading::Head => self.parse_head(out)?,
                Reading::Body { framing, keep_alive } => self.parse_body(framing, keep_alive, out)?,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn on_write(&mut self, wb: &mut BytesMut, _out: &mut EventSink) -> Result<()> {
        if !self.outbox.is_empty() {
            wb.extend_from_slice(&self.outbox);
            self.outbox.clear();
        }

        Ok(())
    }

    fn on_eof(&mut self, out: &mut EventSink) {
        if let Reading::Body { framing: Framing::UntilClose, keep_alive } = self.reading {
            let _ = self.finish_stream(keep_alive, out);
        }
    }

    fn max_concurrent_streams(&self) -> u32 {
        // A POST body serializes http/1.1 exchanges.
        if self.cfg.data.is_some() {
            1
        } else {
            self.cfg.max_concurrent_streams
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
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

    fn session() -> Http1Session {
        let cmd = Cmd::try_parse_from(["volley", "--h1", "http://localhost/"]).unwrap();
        Http1Session::new(Arc::new(Config::try_from(cmd).unwrap()))
    }

    fn close_events(out: &EventSink) -> Vec<(u32, bool, bool)> {
        out.iter()
            .filter_map(|ev| match ev {
                SessionEvent::StreamClose { stream_id, success, last } => {
                    Some((*stream_id, *success, *last))
                }
                _ => None,
            })
            .collect()
    }

    fn status_events(out: &EventSink) -> Vec<(u32, u16)> {
        out.iter()
            .filter_map(|ev| match ev {
                SessionEvent::StatusCode { stream_id, status } => Some((*stream_id, *status)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_response_with_content_length() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        s.on_read(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", &mut out).unwrap();
        assert_eq!(status_events(&out), vec![(1, 200)]);
        assert_eq!(close_events(&out), vec![(1, true, false)]);
    }

    #[test]
    fn response_split_across_reads() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        s.on_read(b"HTTP/1.1 404 Not", &mut out).unwrap();
        assert!(close_events(&out).is_empty());
        s.on_read(b" Found\r\nContent-Length: 3\r\n\r\nno", &mut out).unwrap();
        assert!(close_events(&out).is_empty());
        s.on_read(b"t", &mut out).unwrap();
        assert_eq!(status_events(&out), vec![(1, 404)]);
        assert_eq!(close_events(&out), vec![(1, true, false)]);
    }

    #[test]
    fn pipelined_responses_complete_in_order() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        s.submit_request(&mut out).unwrap();

        s.on_read(
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n\
              HTTP/1.1 500 Oops\r\nContent-Length: 0\r\n\r\n",
            &mut out,
        )
        .unwrap();
        assert_eq!(status_events(&out), vec![(1, 200), (3, 500)]);
        assert_eq!(close_events(&out), vec![(1, true, false), (3, true, false)]);
    }

    #[test]
    fn connection_close_requests_reconnect() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        s.on_read(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
            &mut out,
        )
        .unwrap();
        assert_eq!(close_events(&out), vec![(1, true, true)]);
        assert!(out.iter().any(|ev| matches!(ev, SessionEvent::NewConnection)));
    }

    #[test]
    fn chunked_body_is_framed() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        s.on_read(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
            &mut out,
        )
        .unwrap();
        assert_eq!(close_events(&out), vec![(1, true, false)]);
        let body: u64 = out
            .iter()
            .filter_map(|ev| match ev {
                SessionEvent::BodyBytes { n } => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(body, 9);
    }

    #[test]
    fn interim_100_is_skipped() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        s.on_read(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            &mut out,
        )
        .unwrap();
        assert_eq!(status_events(&out), vec![(1, 200)]);
    }

    #[test]
    fn read_until_close_finishes_at_eof() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        s.on_read(b"HTTP/1.1 200 OK\r\n\r\nsome body", &mut out).unwrap();
        assert!(close_events(&out).is_empty());
        s.on_eof(&mut out);
        assert_eq!(close_events(&out), vec![(1, true, true)]);
    }

    #[test]
    fn request_bytes_flow_through_on_write() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();

        let mut wb = BytesMut::new();
        s.on_write(&mut wb, &mut out).unwrap();
        let text = core::str::from_utf8(&wb).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!s.is_closed());

        s.terminate();
        assert!(s.is_closed());
    }
}
