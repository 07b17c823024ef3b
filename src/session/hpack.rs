//! HPACK header compression (RFC 7541).
//!
//! Requests are encoded without the dynamic table; responses are decoded
//! with full static plus dynamic table support and Huffman-coded string
//! literals.

use std::{collections::VecDeque, sync::OnceLock};

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

// RFC 7541 Appendix B huffman code table: (code, bit length) per symbol,
// entry 256 is EOS.
const CODES: [(u32, u8); 257] = [
    (0x1ff8, 13),
    (0x7fffd8, 23),
    (0xfffffe2, 28),
    (0xfffffe3, 28),
    (0xfffffe4, 28),
    (0xfffffe5, 28),
    (0xfffffe6, 28),
    (0xfffffe7, 28),
    (0xfffffe8, 28),
    (0xffffea, 24),
    (0x3ffffffc, 30),
    (0xfffffe9, 28),
    (0xfffffea, 28),
    (0x3ffffffd, 30),
    (0xfffffeb, 28),
    (0xfffffec, 28),
    (0xfffffed, 28),
    (0xfffffee, 28),
    (0xfffffef, 28),
    (0xffffff0, 28),
    (0xffffff1, 28),
    (0xffffff2, 28),
    (0x3ffffffe, 30),
    (0xffffff3, 28),
    (0xffffff4, 28),
    (0xffffff5, 28),
    (0xffffff6, 28),
    (0xffffff7, 28),
    (0xffffff8, 28),
    (0xffffff9, 28),
    (0xffffffa, 28),
    (0xffffffb, 28),
    (0x14, 6),
    (0x3f8, 10),
    (0x3f9, 10),
    (0xffa, 12),
    (0x1ff9, 13),
    (0x15, 6),
    (0xf8, 8),
    (0x7fa, 11),
    (0x3fa, 10),
    (0x3fb, 10),
    (0xf9, 8),
    (0x7fb, 11),
    (0xfa, 8),
    (0x16, 6),
    (0x17, 6),
    (0x18, 6),
    (0x0, 5),
    (0x1, 5),
    (0x2, 5),
    (0x19, 6),
    (0x1a, 6),
    (0x1b, 6),
    (0x1c, 6),
    (0x1d, 6),
    (0x1e, 6),
    (0x1f, 6),
    (0x5c, 7),
    (0xfb, 8),
    (0x7ffc, 15),
    (0x20, 6),
    (0xffb, 12),
    (0x3fc, 10),
    (0x1ffa, 13),
    (0x21, 6),
    (0x5d, 7),
    (0x5e, 7),
    (0x5f, 7),
    (0x60, 7),
    (0x61, 7),
    (0x62, 7),
    (0x63, 7),
    (0x64, 7),
    (0x65, 7),
    (0x66, 7),
    (0x67, 7),
    (0x68, 7),
    (0x69, 7),
    (0x6a, 7),
    (0x6b, 7),
    (0x6c, 7),
    (0x6d, 7),
    (0x6e, 7),
    (0x6f, 7),
    (0x70, 7),
    (0x71, 7),
    (0x72, 7),
    (0xfc, 8),
    (0x73, 7),
    (0xfd, 8),
    (0x1ffb, 13),
    (0x7fff0, 19),
    (0x1ffc, 13),
    (0x3ffc, 14),
    (0x22, 6),
    (0x7ffd, 15),
    (0x3, 5),
    (0x23, 6),
    (0x4, 5),
    (0x24, 6),
    (0x5, 5),
    (0x25, 6),
    (0x26, 6),
    (0x27, 6),
    (0x6, 5),
    (0x74, 7),
    (0x75, 7),
    (0x28, 6),
    (0x29, 6),
    (0x2a, 6),
    (0x7, 5),
    (0x2b, 6),
    (0x76, 7),
    (0x2c, 6),
    (0x8, 5),
    (0x9, 5),
    (0x2d, 6),
    (0x77, 7),
    (0x78, 7),
    (0x79, 7),
    (0x7a, 7),
    (0x7b, 7),
    (0x7ffe, 15),
    (0x7fc, 11),
    (0x3ffd, 14),
    (0x1ffd, 13),
    (0xffffffc, 28),
    (0xfffe6, 20),
    (0x3fffd2, 22),
    (0xfffe7, 20),
    (0xfffe8, 20),
    (0x3fffd3, 22),
    (0x3fffd4, 22),
    (0x3fffd5, 22),
    (0x7fffd9, 23),
    (0x3fffd6, 22),
    (0x7fffda, 23),
    (0x7fffdb, 23),
    (0x7fffdc, 23),
    (0x7fffdd, 23),
    (0x7fffde, 23),
    (0xffffeb, 24),
    (0x7fffdf, 23),
    (0xffffec, 24),
    (0xffffed, 24),
    (0x3fffd7, 22),
    (0x7fffe0, 23),
    (0xffffee, 24),
    (0x7fffe1, 23),
    (0x7fffe2, 23),
    (0x7fffe3, 23),
    (0x7fffe4, 23),
    (0x1fffdc, 21),
    (0x3fffd8, 22),
    (0x7fffe5, 23),
    (0x3fffd9, 22),
    (0x7fffe6, 23),
    (0x7fffe7, 23),
    (0xffffef, 24),
    (0x3fffda, 22),
    (0x1fffdd, 21),
    (0xfffe9, 20),
    (0x3fffdb, 22),
    (0x3fffdc, 22),
    (0x7fffe8, 23),
    (0x7fffe9, 23),
    (0x1fffde, 21),
    (0x7fffea, 23),
    (0x3fffdd, 22),
    (0x3fffde, 22),
    (0xfffff0, 24),
    (0x1fffdf, 21),
    (0x3fffdf, 22),
    (0x7fffeb, 23),
    (0x7fffec, 23),
    (0x1fffe0, 21),
    (0x1fffe1, 21),
    (0x3fffe0, 22),
    (0x1fffe2, 21),
    (0x7fffed, 23),
    (0x3fffe1, 22),
    (0x7fffee, 23),
    (0x7fffef, 23),
    (0xfffea, 20),
    (0x3fffe2, 22),
    (0x3fffe3, 22),
    (0x3fffe4, 22),
    (0x7ffff0, 23),
    (0x3fffe5, 22),
    (0x3fffe6, 22),
    (0x7ffff1, 23),
    (0x3ffffe0, 26),
    (0x3ffffe1, 26),
    (0xfffeb, 20),
    (0x7fff1, 19),
    (0x3fffe7, 22),
    (0x7ffff2, 23),
    (0x3fffe8, 22),
    (0x1ffffec, 25),
    (0x3ffffe2, 26),
    (0x3ffffe3, 26),
    (0x3ffffe4, 26),
    (0x7ffffde, 27),
    (0x7ffffdf, 27),
    (0x3ffffe5, 26),
    (0xfffff1, 24),
    (0x1ffffed, 25),
    (0x7fff2, 19),
    (0x1fffe3, 21),
    (0x3ffffe6, 26),
    (0x7ffffe0, 27),
    (0x7ffffe1, 27),
    (0x3ffffe7, 26),
    (0x7ffffe2, 27),
    (0xfffff2, 24),
    (0x1fffe4, 21),
    (0x1fffe5, 21),
    (0x3ffffe8, 26),
    (0x3ffffe9, 26),
    (0xffffffd, 28),
    (0x7ffffe3, 27),
    (0x7ffffe4, 27),
    (0x7ffffe5, 27),
    (0xfffec, 20),
    (0xfffff3, 24),
    (0xfffed, 20),
    (0x1fffe6, 21),
    (0x3fffe9, 22),
    (0x1fffe7, 21),
    (0x1fffe8, 21),
    (0x7ffff3, 23),
    (0x3fffea, 22),
    (0x3fffeb, 22),
    (0x1ffffee, 25),
    (0x1ffffef, 25),
    (0xfffff4, 24),
    (0xfffff5, 24),
    (0x3ffffea, 26),
    (0x7ffff4, 23),
    (0x3ffffeb, 26),
    (0x7ffffe6, 27),
    (0x3ffffec, 26),
    (0x3ffffed, 26),
    (0x7ffffe7, 27),
    (0x7ffffe8, 27),
    (0x7ffffe9, 27),
    (0x7ffffea, 27),
    (0x7ffffeb, 27),
    (0xffffffe, 28),
    (0x7ffffec, 27),
    (0x7ffffed, 27),
    (0x7ffffee, 27),
    (0x7ffffef, 27),
    (0x7fffff0, 27),
    (0x3ffffee, 26),
    (0x3fffffff, 30),
];

const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

const EOS: u32 = 256;

/// Binary decode trie over the code table. Leaves are stored as
/// `-(symbol + 2)`, empty edges as `-1`.
fn tree() -> &'static Vec<[i32; 2]> {
    static TREE: OnceLock<Vec<[i32; 2]>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes: Vec<[i32; 2]> = vec![[-1, -1]];
        for (sym, &(code, len)) in CODES.iter().enumerate() {
            let mut node = 0usize;
            for i in (0..len).rev() {
                let bit = ((code >> i) & 1) as usize;
                if i == 0 {
                    nodes[node][bit] = -(sym as i32) - 2;
                    break;
                }
                let next = nodes[node][bit];
                if next < 0 {
                    nodes.push([-1, -1]);
                    let idx = (nodes.len() - 1) as i32;
                    nodes[node][bit] = idx;
                    node = idx as usize;
                } else {
                    node = next as usize;
                }
            }
        }
        nodes
    })
}

pub fn decode_huffman(data: &[u8]) -> Result<Vec<u8>> {
    let tree = tree();
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut node = 0usize;
    let mut bits_since_sym = 0u8;
    let mut ones_since_sym = true;

    for &byte in data {
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as usize;
            let next = tree[node][bit];
            bits_since_sym += 1;
            ones_since_sym &= bit == 1;
            if next == -1 {
                bail!("corrupt huffman sequence");
            }
            if next <= -2 {
                let sym = (-next - 2) as u32;
                if sym == EOS {
                    bail!("EOS in huffman sequence");
                }
                out.push(sym as u8);
                node = 0;
                bits_since_sym = 0;
                ones_since_sym = true;
            } else {
                node = next as usize;
            }
        }
    }

    // Unfinished bits must be a most-significant prefix of EOS, at most
    // seven of them.
    if bits_since_sym > 7 || !ones_since_sym {
        bail!("invalid huffman padding");
    }

    Ok(out)
}

/// Writes an HPACK integer with the given prefix size, or-ing `flags`
/// into the first byte.
pub fn encode_int(out: &mut BytesMut, mut value: u64, prefix: u8, flags: u8) {
    let max = (1u64 << prefix) - 1;
    if value < max {
        out.put_u8(flags | value as u8);
        return;
    }
    out.put_u8(flags | max as u8);
    value -= max;
    while value >= 128 {
        out.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn decode_int(buf: &[u8], pos: &mut usize, prefix: u8) -> Result<u64> {
    let max = (1u64 << prefix) - 1;
    if *pos >= buf.len() {
        bail!("truncated header block");
    }
    let mut value = u64::from(buf[*pos]) & max;
    *pos += 1;
    if value < max {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        if *pos >= buf.len() {
            bail!("truncated header block");
        }
        let b = buf[*pos];
        *pos += 1;
        value = value
            .checked_add(u64::from(b & 0x7f) << shift)
            .ok_or_else(|| anyhow::anyhow!("integer overflow in header block"))?;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 56 {
            bail!("integer overflow in header block");
        }
    }
}

fn decode_string(buf: &[u8], pos: &mut usize) -> Result<Bytes> {
    if *pos >= buf.len() {
        bail!("truncated header block");
    }
    let huffman = buf[*pos] & 0x80 != 0;
    let len = decode_int(buf, pos, 7)? as usize;
    if buf.len() - *pos < len {
        bail!("truncated string literal");
    }
    let raw = &buf[*pos..*pos + len];
    *pos += len;

    if huffman {
        Ok(Bytes::from(decode_huffman(raw)?))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

/// Response header block decoder with a dynamic table.
#[derive(Debug)]
pub struct Decoder {
    dynamic: VecDeque<(Bytes, Bytes)>,
    size: usize,
    max_size: usize,
}

impl Decoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            dynamic: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    fn lookup(&self, idx: u64) -> Result<(Bytes, Bytes)> {
        if idx == 0 {
            bail!("zero header index");
        }
        if idx as usize <= STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[idx as usize - 1];
            return Ok((
                Bytes::from_static(n.as_bytes()),
                Bytes::from_static(v.as_bytes()),
            ));
        }
        let didx = idx as usize - STATIC_TABLE.len() - 1;
        match self.dynamic.get(didx) {
            Some((n, v)) => Ok((n.clone(), v.clone())),
            None => bail!("header index {idx} out of range"),
        }
    }

    fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry = name.len() + value.len() + 32;
        while self.size + entry > self.max_size {
            let Some((n, v)) = self.dynamic.pop_back() else {
                break;
            };
            self.size -= n.len() + v.len() + 32;
        }
        if entry <= self.max_size {
            self.size += entry;
            self.dynamic.push_front((name, value));
        }
    }

    fn resize(&mut self, max: usize) {
        self.max_size = max;
        while self.size > self.max_size {
            let Some((n, v)) = self.dynamic.pop_back() else {
                break;
            };
            self.size -= n.len() + v.len() + 32;
        }
    }

    /// Decodes one complete header block.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            let b = buf[pos];
            if b & 0x80 != 0 {
                // Indexed header field.
                let idx = decode_int(buf, &mut pos, 7)?;
                out.push(self.lookup(idx)?);
            } else if b & 0x40 != 0 {
                // Literal with incremental indexing.
                let idx = decode_int(buf, &mut pos, 6)?;
                let name = if idx == 0 {
                    decode_string(buf, &mut pos)?
                } else {
                    self.lookup(idx)?.0
                };
                let value = decode_string(buf, &mut pos)?;
                self.insert(name.clone(), value.clone());
                out.push((name, value));
            } else if b & 0x20 != 0 {
                // Dynamic table size update.
                let max = decode_int(buf, &mut pos, 5)?;
                self.resize(max as usize);
            } else {
                // Literal without indexing / never indexed.
                let idx = decode_int(buf, &mut pos, 4)?;
                let name = if idx == 0 {
                    decode_string(buf, &mut pos)?
                } else {
                    self.lookup(idx)?.0
                };
                let value = decode_string(buf, &mut pos)?;
                out.push((name, value));
            }
        }

        Ok(out)
    }
}

fn static_exact(name: &str, value: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n == name && v == value)
        .map(|i| i as u64 + 1)
}

fn static_name(name: &str) -> Option<u64> {
    STATIC_TABLE
        .iter()
        .position(|&(n, _)| n == name)
        .map(|i| i as u64 + 1)
}

/// Encodes a request header list. Exact static matches become indexed
/// fields; everything else is emitted as a literal without indexing, so
/// no encoder-side dynamic table state is needed.
pub fn encode_block(headers: &[(String, String)], out: &mut BytesMut) {
    for (name, value) in headers {
        if let Some(idx) = static_exact(name, value) {
            encode_int(out, idx, 7, 0x80);
            continue;
        }
        match static_name(name) {
            Some(idx) => encode_int(out, idx, 4, 0x00),
            None => {
                out.put_u8(0x00);
                encode_int(out, name.len() as u64, 7, 0x00);
                out.put_slice(name.as_bytes());
            }
        }
        encode_int(out, value.len() as u64, 7, 0x00);
        out.put_slice(value.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use core::str;

    use super::*;

    #[test]
    fn huffman_rfc_vectors() {
        // RFC 7541 C.4.1 and C.6.1.
        let www = decode_huffman(&[0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]).unwrap();
        assert_eq!(www, b"www.example.com");

        let s307 = decode_huffman(&[0x64, 0x0e, 0xff]).unwrap();
        assert_eq!(s307, b"307");

        let nocache = decode_huffman(&[0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]).unwrap();
        assert_eq!(nocache, b"no-cache");
    }

    #[test]
    fn huffman_rejects_bad_padding() {
        // "0" (code 00000) followed by zero padding.
        assert!(decode_huffman(&[0x00]).is_err());
    }

    #[test]
    fn integer_prefix_round_trip() {
        for (value, prefix) in [(10u64, 5u8), (31, 5), (1337, 5), (0, 7), (126, 7), (127, 7), (300, 7)] {
            let mut buf = BytesMut::new();
            encode_int(&mut buf, value, prefix, 0);
            let mut pos = 0;
            assert_eq!(decode_int(&buf, &mut pos, prefix).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn decodes_static_indexed_fields() {
        let mut dec = Decoder::new(4096);
        // :method GET, :scheme http, :path /, :status 200
        let out = dec.decode(&[0x82, 0x86, 0x84, 0x88]).unwrap();
        let out: Vec<(&[u8], &[u8])> = out.iter().map(|(n, v)| (&n[..], &v[..])).collect();
        assert_eq!(
            out,
            vec![
                (&b":method"[..], &b"GET"[..]),
                (b":scheme", b"http"),
                (b":path", b"/"),
                (b":status", b"200"),
            ]
        );
    }

    #[test]
    fn dynamic_table_indexing_round_trip() {
        let mut dec = Decoder::new(4096);
        // Literal with incremental indexing: name ":status" via static
        // index 8, value "307" raw; then an indexed reference to it (62).
        let mut block = BytesMut::new();
        encode_int(&mut block, 8, 6, 0x40);
        encode_int(&mut block, 3, 7, 0x00);
        block.put_slice(b"307");
        let first = dec.decode(&block).unwrap();
        assert_eq!(&first[0].1[..], b"307");

        let second = dec.decode(&[0xbe]).unwrap();
        assert_eq!(&second[0].0[..], b":status");
        assert_eq!(&second[0].1[..], b"307");
    }

    #[test]
    fn eviction_keeps_table_within_budget() {
        let mut dec = Decoder::new(64);
        for i in 0..10 {
            let mut block = BytesMut::new();
            block.put_u8(0x40);
            let name = format!("x-f{i}");
            encode_int(&mut block, name.len() as u64, 7, 0);
            block.put_slice(name.as_bytes());
            encode_int(&mut block, 1, 7, 0);
            block.put_slice(b"v");
            dec.decode(&block).unwrap();
        }
        assert!(dec.size <= 64);
        assert!(dec.dynamic.len() <= 2);
    }

    #[test]
    fn encode_block_round_trips_through_decoder() {
        let headers = vec![
            (":path".to_string(), "/ping?x=1".to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":authority".to_string(), "localhost:8080".to_string()),
            (":method".to_string(), "GET".to_string()),
            ("user-agent".to_string(), "volley/0.3.1".to_string()),
            ("x-custom".to_string(), "probe".to_string()),
        ];
        let mut block = BytesMut::new();
        encode_block(&headers, &mut block);

        let mut dec = Decoder::new(4096);
        let out = dec.decode(&block).unwrap();
        let out: Vec<(String, String)> = out
            .iter()
            .map(|(n, v)| {
                (
                    str::from_utf8(n).unwrap().to_string(),
                    str::from_utf8(v).unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(out, headers);
    }
}
