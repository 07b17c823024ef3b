//! SOFARPC (bolt) session: prebuilt request frames with a monotonic
//! request id, 20 byte response heads with the status at offset 10.
//! Responses correlate by request id and may complete out of order.

use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

use super::{EventSink, Session, SessionEvent};
use crate::{bolt, cfg::Config};

#[derive(Debug, Clone, Copy)]
enum Reading {
    Head,
    Body { request_id: u32, remaining: usize },
}

#[derive(Debug)]
pub struct BoltSession {
    cfg: Arc<Config>,
    next_request_id: u32,
    reqidx: usize,
    outbox: BytesMut,
    rbuf: BytesMut,
    inflight: HashSet<u32>,
    reading: Reading,
    saw_first_byte: bool,
    terminated: bool,
}

impl BoltSession {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            next_request_id: 1,
            reqidx: 0,
            outbox: BytesMut::new(),
            rbuf: BytesMut::new(),
            inflight: HashSet::new(),
            reading: Reading::Head,
            saw_first_byte: false,
            terminated: false,
        }
    }

    fn finish_stream(&mut self, request_id: u32, out: &mut EventSink) {
        if self.inflight.remove(&request_id) {
            out.push_back(SessionEvent::StreamClose {
                stream_id: request_id,
                success: true,
                last: false,
            });
        }
        self.reading = Reading::Head;
    }
}

impl Session for BoltSession {
    fn on_connect(&mut self, _out: &mut EventSink) {}

    fn submit_request(&mut self, out: &mut EventSink) -> Result<()> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let template = &self.cfg.bolt_reqs[self.reqidx];
        self.reqidx = (self.reqidx + 1) % self.cfg.bolt_reqs.len();

        let at = self.outbox.len();
        self.outbox.extend_from_slice(template);
        bolt::set_request_id(&mut self.outbox[at..], request_id);

        self.inflight.insert(request_id);
        out.push_back(SessionEvent::Request { stream_id: request_id });

        Ok(())
    }

    fn on_read(&mut self, data: &[u8], out: &mut EventSink) -> Result<()> {
        if !self.saw_first_byte && !data.is_empty() {
            self.saw_first_byte = true;
            out.push_back(SessionEvent::FirstByte);
        }
        self.rbuf.extend_from_slice(data);

        loop {
            match self.reading {
                Reading::Head => {
                    if self.rbuf.len() < bolt::RESPONSE_HEAD_LEN {
                        return Ok(());
                    }
                    let head = bolt::decode_response_head(&self.rbuf)?;
                    self.rbuf.advance(bolt::RESPONSE_HEAD_LEN);

                    if !self.inflight.contains(&head.request_id) {
                        bail!("response for unknown request id {}", head.request_id);
                    }
                    out.push_back(SessionEvent::HeadBytes {
                        wire: bolt::RESPONSE_HEAD_LEN as u64,
                        decomp: bolt::RESPONSE_HEAD_LEN as u64,
                    });
                    out.push_back(SessionEvent::RpcStatus {
                        stream_id: head.request_id,
                        status: head.status,
                    });
                    self.reading = Reading::Body {
                        request_id: head.request_id,
                        remaining: head.body_len(),
                    };
                }
                Reading::Body { request_id, remaining } => {
                    let take = remaining.min(self.rbuf.len());
                    if take > 0 {
                        out.push_back(SessionEvent::BodyBytes { n: take as u64 });
                        self.rbuf.advance(take);
                    }
                    if take == remaining {
                        self.finish_stream(request_id, out);
                    } else {
                        self.reading = Reading::Body {
                            request_id,
                            remaining: remaining - take,
                        };
                        return Ok(());
                    }
                }
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

    fn max_concurrent_streams(&self) -> u32 {
        self.cfg.max_concurrent_streams
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
    use bytes::BufMut;
    use clap::Parser;

    use super::*;
    use crate::cmd::Cmd;

    fn session() -> BoltSession {
        let cmd = Cmd::try_parse_from(["volley", "-p", "sofarpc", "http://localhost/svc"]).unwrap();
        BoltSession::new(Arc::new(Config::try_from(cmd).unwrap()))
    }

    fn response(request_id: u32, status: u16, content: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(bolt::PROTOCOL_CODE_V1);
        buf.put_u8(bolt::TYPE_RESPONSE);
        buf.put_u16(2);
        buf.put_u8(1);
        buf.put_u32(request_id);
        buf.put_u8(bolt::CODEC_HESSIAN2);
        buf.put_u16(status);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u32(content.len() as u32);
        buf.put_slice(content);
        buf
    }

    #[test]
    fn request_frame_carries_fresh_id() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        s.submit_request(&mut out).unwrap();

        let mut wb = BytesMut::new();
        s.on_write(&mut wb, &mut out).unwrap();
        // Two identical frames except for the patched ids.
        let frame_len = wb.len() / 2;
        assert_eq!(&wb[5..9], &1u32.to_be_bytes());
        assert_eq!(&wb[frame_len + 5..frame_len + 9], &2u32.to_be_bytes());
    }

    #[test]
    fn success_response_completes_the_stream() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        out.clear();

        s.on_read(&response(1, bolt::RESPONSE_STATUS_SUCCESS, b"pong"), &mut out).unwrap();
        assert!(out.iter().any(|ev| matches!(
            ev,
            SessionEvent::RpcStatus { stream_id: 1, status: 0 }
        )));
        assert!(out.iter().any(|ev| matches!(
            ev,
            SessionEvent::StreamClose { stream_id: 1, success: true, .. }
        )));
    }

    #[test]
    fn responses_complete_out_of_order() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        s.submit_request(&mut out).unwrap();
        out.clear();

        let mut buf = response(2, bolt::RESPONSE_STATUS_SUCCESS, b"");
        buf.extend_from_slice(&response(1, bolt::RESPONSE_STATUS_TIMEOUT, b""));
        s.on_read(&buf, &mut out).unwrap();

        let ids: Vec<u32> = out
            .iter()
            .filter_map(|ev| match ev {
                SessionEvent::StreamClose { stream_id, .. } => Some(*stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn split_response_waits_for_body() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        out.clear();

        let full = response(1, bolt::RESPONSE_STATUS_SUCCESS, b"0123456789");
        s.on_read(&full[..25], &mut out).unwrap();
        assert!(!out.iter().any(|ev| matches!(ev, SessionEvent::StreamClose { .. })));
        s.on_read(&full[25..], &mut out).unwrap();
        assert!(out.iter().any(|ev| matches!(ev, SessionEvent::StreamClose { .. })));
    }

    #[test]
    fn unknown_request_id_is_a_decode_error() {
        let mut s = session();
        let mut out = EventSink::new();
        s.submit_request(&mut out).unwrap();
        assert!(s.on_read(&response(9, 0, b""), &mut out).is_err());
    }
}
