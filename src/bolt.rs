//! SOFARPC (bolt) wire format.
//!
//! Request frames carry a 22 byte header followed by the class name, the
//! serialized header map and the content bytes. Responses use a 20 byte
//! header with the status at offset 10. All multi-byte fields are big
//! endian.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};

pub const PROTOCOL_CODE_V1: u8 = 1;

pub const TYPE_REQUEST: u8 = 0;
pub const TYPE_RESPONSE: u8 = 1;

pub const CMD_RPC_REQUEST: u16 = 1;

pub const CODEC_HESSIAN2: u8 = 1;

pub const REQUEST_HEAD_LEN: usize = 22;
pub const RESPONSE_HEAD_LEN: usize = 20;

pub const RESPONSE_STATUS_SUCCESS: u16 = 0;
pub const RESPONSE_STATUS_ERROR: u16 = 1;
pub const RESPONSE_STATUS_SERVER_EXCEPTION: u16 = 2;
pub const RESPONSE_STATUS_UNKNOWN: u16 = 3;
pub const RESPONSE_STATUS_SERVER_THREADPOOL_BUSY: u16 = 4;
pub const RESPONSE_STATUS_ERROR_COMM: u16 = 5;
pub const RESPONSE_STATUS_NO_PROCESSOR: u16 = 6;
pub const RESPONSE_STATUS_TIMEOUT: u16 = 7;
pub const RESPONSE_STATUS_CLIENT_SEND_ERROR: u16 = 8;
pub const RESPONSE_STATUS_CODEC_EXCEPTION: u16 = 9;
pub const RESPONSE_STATUS_CONNECTION_CLOSED: u16 = 16;
pub const RESPONSE_STATUS_SERVER_SERIAL_EXCEPTION: u16 = 17;
pub const RESPONSE_STATUS_SERVER_DESERIAL_EXCEPTION: u16 = 18;

/// Number of response-status buckets tracked by the stats.
pub const STATUS_BUCKETS: usize = 19;

/// Default request content: a hessian2-serialized SofaRequest invoking
/// TestService.echoStr with a 1KiB string argument.
pub const DEFAULT_CONTENT: [u8; 1314] = [
    0x4f, 0xbc, 0x63, 0x6f, 0x6d, 0x2e, 0x61, 0x6c, 0x69, 0x70, 0x61, 0x79,
    0x2e, 0x73, 0x6f, 0x66, 0x61, 0x2e, 0x72, 0x70, 0x63, 0x2e, 0x63, 0x6f,
    0x72, 0x65, 0x2e, 0x72, 0x65, 0x71, 0x75, 0x65, 0x73, 0x74, 0x2e, 0x53,
    0x6f, 0x66, 0x61, 0x52, 0x65, 0x71, 0x75, 0x65, 0x73, 0x74, 0x95, 0x0d,
    0x74, 0x61, 0x72, 0x67, 0x65, 0x74, 0x41, 0x70, 0x70, 0x4e, 0x61, 0x6d,
    0x65, 0x0a, 0x6d, 0x65, 0x74, 0x68, 0x6f, 0x64, 0x4e, 0x61, 0x6d, 0x65,
    0x17, 0x74, 0x61, 0x72, 0x67, 0x65, 0x74, 0x53, 0x65, 0x72, 0x76, 0x69,
    0x63, 0x65, 0x55, 0x6e, 0x69, 0x71, 0x75, 0x65, 0x4e, 0x61, 0x6d, 0x65,
    0x0c, 0x72, 0x65, 0x71, 0x75, 0x65, 0x73, 0x74, 0x50, 0x72, 0x6f, 0x70,
    0x73, 0x0d, 0x6d, 0x65, 0x74, 0x68, 0x6f, 0x64, 0x41, 0x72, 0x67, 0x53,
    0x69, 0x67, 0x73, 0x6f, 0x90, 0x4e, 0x07, 0x65, 0x63, 0x68, 0x6f, 0x53,
    0x74, 0x72, 0x1f, 0x63, 0x6f, 0x6d, 0x2e, 0x61, 0x6c, 0x69, 0x70, 0x61,
    0x79, 0x2e, 0x74, 0x65, 0x73, 0x74, 0x2e, 0x54, 0x65, 0x73, 0x74, 0x53,
    0x65, 0x72, 0x76, 0x69, 0x63, 0x65, 0x3a, 0x31, 0x2e, 0x30, 0x4d, 0x08,
    0x70, 0x72, 0x6f, 0x74, 0x6f, 0x63, 0x6f, 0x6c, 0x04, 0x62, 0x6f, 0x6c,
    0x74, 0x7a, 0x56, 0x74, 0x00, 0x07, 0x5b, 0x73, 0x74, 0x72, 0x69, 0x6e,
    0x67, 0x6e, 0x01, 0x10, 0x6a, 0x61, 0x76, 0x61, 0x2e, 0x6c, 0x61, 0x6e,
    0x67, 0x2e, 0x53, 0x74, 0x72, 0x69, 0x6e, 0x67, 0x7a, 0x53, 0x04, 0x4a,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
    0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36,
    0x37, 0x38, 0x39, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x30, 0x31, 0x32, 0x33, 0x34,
];

/// Serializes a `k=v,k=v` string into the bolt header map wire format:
/// per entry a big-endian u32 key length, the key bytes, a big-endian u32
/// value length and the value bytes. Entries without a `=` are skipped.
pub fn encode_header_map(pairs: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in pairs.split(',') {
        let Some((k, v)) = entry.split_once('=') else {
            continue;
        };
        out.put_u32(k.len() as u32);
        out.put_slice(k.as_bytes());
        out.put_u32(v.len() as u32);
        out.put_slice(v.as_bytes());
    }

    out
}

/// Builds a request frame with the request id left zero. The id is patched
/// in by the session on each submission, see [`set_request_id`].
pub fn encode_request(class_name: &str, header: &[u8], content: &[u8], timeout_ms: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(REQUEST_HEAD_LEN + class_name.len() + header.len() + content.len());

    buf.put_u8(PROTOCOL_CODE_V1);
    buf.put_u8(TYPE_REQUEST);
    buf.put_u16(CMD_RPC_REQUEST);
    buf.put_u8(1); // version
    buf.put_u32(0); // request id, patched per submission
    buf.put_u8(CODEC_HESSIAN2);
    buf.put_u32(timeout_ms);
    buf.put_u16(class_name.len() as u16);
    buf.put_u16(header.len() as u16);
    buf.put_u32(content.len() as u32);
    buf.put_slice(class_name.as_bytes());
    buf.put_slice(header);
    buf.put_slice(content);

    buf
}

#[inline]
pub fn set_request_id(frame: &mut [u8], id: u32) {
    frame[5..9].copy_from_slice(&id.to_be_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub request_id: u32,
    pub status: u16,
    pub class_len: u16,
    pub header_len: u16,
    pub content_len: u32,
}

impl ResponseHead {
    #[inline]
    pub fn body_len(&self) -> usize {
        self.class_len as usize + self.header_len as usize + self.content_len as usize
    }
}

/// Decodes the fixed 20 byte response head. The caller guarantees at least
/// [`RESPONSE_HEAD_LEN`] readable bytes.
pub fn decode_response_head(mut buf: &[u8]) -> Result<ResponseHead> {
    debug_assert!(buf.len() >= RESPONSE_HEAD_LEN);

    let proto = buf.get_u8();
    if proto != PROTOCOL_CODE_V1 {
        bail!("unexpected bolt protocol code: {proto}");
    }
    let typ = buf.get_u8();
    if typ != TYPE_RESPONSE {
        bail!("unexpected bolt frame type: {typ}");
    }
    let _cmdcode = buf.get_u16();
    let _version = buf.get_u8();
    let request_id = buf.get_u32();
    let _codec = buf.get_u8();
    let status = buf.get_u16();
    let class_len = buf.get_u16();
    let header_len = buf.get_u16();
    let content_len = buf.get_u32();

    let m = ResponseHead {
        request_id,
        status,
        class_len,
        header_len,
        content_len,
    };

    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_request(frame: &[u8]) -> (u32, &[u8], &[u8], &[u8]) {
        let mut head = &frame[..REQUEST_HEAD_LEN];
        assert_eq!(head.get_u8(), PROTOCOL_CODE_V1);
        assert_eq!(head.get_u8(), TYPE_REQUEST);
        assert_eq!(head.get_u16(), CMD_RPC_REQUEST);
        assert_eq!(head.get_u8(), 1);
        let id = head.get_u32();
        assert_eq!(head.get_u8(), CODEC_HESSIAN2);
        let _timeout = head.get_u32();
        let class_len = head.get_u16() as usize;
        let header_len = head.get_u16() as usize;
        let content_len = head.get_u32() as usize;

        let class = &frame[REQUEST_HEAD_LEN..REQUEST_HEAD_LEN + class_len];
        let header = &frame[REQUEST_HEAD_LEN + class_len..REQUEST_HEAD_LEN + class_len + header_len];
        let content = &frame[REQUEST_HEAD_LEN + class_len + header_len..];
        assert_eq!(content.len(), content_len);

        (id, class, header, content)
    }

    #[test]
    fn request_round_trip() {
        let header = encode_header_map("service=echo,unit=GZ00A");
        let mut frame = encode_request("com.example.Ping", &header, b"hello", 3000);
        set_request_id(&mut frame, 77);

        let (id, class, hdr, content) = decode_request(&frame);
        assert_eq!(id, 77);
        assert_eq!(class, b"com.example.Ping");
        assert_eq!(hdr, &header[..]);
        assert_eq!(content, b"hello");
    }

    #[test]
    fn default_frame_matches_wire_size() {
        // Default class name plus default content, empty header map:
        // 22 byte head plus 1358 payload bytes on the wire.
        let header = encode_header_map(crate::cmd::DEFAULT_SOFARPC_HEADER);
        assert!(header.is_empty());

        let frame = encode_request(
            crate::cmd::DEFAULT_SOFARPC_CLASS_NAME,
            &header,
            &DEFAULT_CONTENT,
            5000,
        );
        assert_eq!(frame.len(), REQUEST_HEAD_LEN + 1358);
    }

    #[test]
    fn response_head_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_CODE_V1);
        buf.put_u8(TYPE_RESPONSE);
        buf.put_u16(2);
        buf.put_u8(1);
        buf.put_u32(42);
        buf.put_u8(CODEC_HESSIAN2);
        buf.put_u16(RESPONSE_STATUS_TIMEOUT);
        buf.put_u16(3);
        buf.put_u16(0);
        buf.put_u32(10);

        let head = decode_response_head(&buf).unwrap();
        assert_eq!(head.request_id, 42);
        assert_eq!(head.status, RESPONSE_STATUS_TIMEOUT);
        assert_eq!(head.body_len(), 13);
    }

    #[test]
    fn bad_frame_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_CODE_V1);
        buf.put_u8(TYPE_REQUEST);
        buf.put_slice(&[0u8; 18]);
        assert!(decode_response_head(&buf).is_err());
    }
}
