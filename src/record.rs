//! The Record type - the unit that flows through peili
//!
//! A Record captures one ingress request: method, path-plus-query, and the
//! raw body. The body uses `Bytes` so that fanning a record out to several
//! endpoint pipelines only bumps a refcount, never copies the payload.
//!
//! # Wire format
//!
//! On disk a record is framed with fixed-width big-endian lengths:
//!
//! ```text
//! u32 method_len | method | u32 url_len | url | body
//! ```
//!
//! The segment log prepends one more `u32` with the total encoded length,
//! so decoding always starts from a complete frame. Any internal length
//! that does not add up is structural corruption, reported as an error and
//! never guessed around.

use crate::error::{PeiliError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One ingress request, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// HTTP method string as seen at ingress
    pub method: String,
    /// Path plus raw query; the upstream host is chosen at dispatch time
    pub url: String,
    /// Opaque payload - zero-copy via Bytes
    pub body: Bytes,
}

impl Record {
    pub fn new(method: impl Into<String>, url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            body,
        }
    }

    /// Encoded size on disk, excluding the segment log's own length header.
    pub fn encoded_len(&self) -> usize {
        4 + self.method.len() + 4 + self.url.len() + self.body.len()
    }

    /// Serialize into the length-framed wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.method.len() as u32);
        buf.put_slice(self.method.as_bytes());
        buf.put_u32(self.url.len() as u32);
        buf.put_slice(self.url.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a complete frame produced by [`encode`](Self::encode).
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let method = take_string(&mut buf, "method")?;
        let url = take_string(&mut buf, "url")?;
        Ok(Self {
            method,
            url,
            body: buf,
        })
    }
}

fn take_string(buf: &mut Bytes, field: &str) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(PeiliError::Codec(format!(
            "frame truncated before {field} length"
        )));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(PeiliError::Codec(format!(
            "{field} length {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| PeiliError::Codec(format!("{field} is not valid UTF-8")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let rec = Record::new("POST", "/ingest?src=web", Bytes::from_static(b"hello"));
        let encoded = rec.encode();
        assert_eq!(encoded.len(), rec.encoded_len());

        let decoded = Record::decode(encoded).expect("decode");
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_empty_body_round_trip() {
        let rec = Record::new("GET", "/", Bytes::new());
        let decoded = Record::decode(rec.encode()).expect("decode");
        assert_eq!(decoded.body.len(), 0);
        assert_eq!(decoded.url, "/");
    }

    #[test]
    fn test_binary_body_preserved() {
        let body = Bytes::from((0u8..=255).collect::<Vec<u8>>());
        let rec = Record::new("PUT", "/raw", body.clone());
        let decoded = Record::decode(rec.encode()).expect("decode");
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn test_decode_truncated_frame() {
        let rec = Record::new("POST", "/x", Bytes::from_static(b"abc"));
        let encoded = rec.encode();
        let truncated = encoded.slice(0..3);
        assert!(matches!(
            Record::decode(truncated),
            Err(PeiliError::Codec(_))
        ));
    }

    #[test]
    fn test_decode_length_overrun() {
        let mut buf = BytesMut::new();
        buf.put_u32(1000); // method length pointing past the end
        buf.put_slice(b"GET");
        assert!(matches!(
            Record::decode(buf.freeze()),
            Err(PeiliError::Codec(_))
        ));
    }

    #[test]
    fn test_fan_out_clone_shares_body() {
        let rec = Record::new("POST", "/big", Bytes::from(vec![0u8; 8192]));
        let copy = rec.clone();
        assert_eq!(rec.body.as_ptr(), copy.body.as_ptr());
    }
}
