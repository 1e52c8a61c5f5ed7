//! Connection header codec.
//!
//! Every TCPROS connection opens with each side sending a header: a u32 LE
//! total length followed by entries, each a u32 LE length plus a UTF-8
//! `key=value` string.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rosgraph_types::{RosError, RosResult};
use std::collections::BTreeMap;

pub const CALLER_ID: &str = "callerid";
pub const TOPIC: &str = "topic";
pub const SERVICE: &str = "service";
pub const TYPE: &str = "type";
pub const MD5_CHECKSUM: &str = "md5sum";
pub const LATCHING: &str = "latching";
pub const PERSISTENT: &str = "persistent";
pub const PROBE: &str = "probe";
pub const MESSAGE_DEFINITION: &str = "message_definition";
pub const ERROR: &str = "error";
pub const TCP_NODELAY: &str = "tcp_nodelay";

/// Wildcard accepted for `type` and `md5sum`.
pub const WILDCARD: &str = "*";

/// Flat string map exchanged at connection setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: BTreeMap<String, String>,
}

impl ConnectionHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A header carrying only an `error` entry.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new().with(ERROR, reason)
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Whether `key` is present and set to `1`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode with the leading total-length prefix.
    pub fn encode(&self) -> RosResult<Bytes> {
        let body_len: usize = self.fields.iter().map(|(k, v)| 4 + k.len() + 1 + v.len()).sum();
        let total = u32::try_from(body_len)
            .map_err(|_| RosError::MalformedHeader(format!("header of {body_len} bytes too large")))?;
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32_le(total);
        for (key, value) in &self.fields {
            // Bounded by `total` above.
            buf.put_u32_le((key.len() + 1 + value.len()) as u32);
            buf.put_slice(key.as_bytes());
            buf.put_u8(b'=');
            buf.put_slice(value.as_bytes());
        }
        Ok(buf.freeze())
    }

    /// Decode a buffer that starts with the total-length prefix.
    pub fn decode(bytes: &[u8]) -> RosResult<Self> {
        let mut cursor = bytes;
        if cursor.remaining() < 4 {
            return Err(RosError::MalformedHeader(
                "missing length prefix".to_string(),
            ));
        }
        let declared = cursor.get_u32_le() as usize;
        if declared != cursor.remaining() {
            return Err(RosError::MalformedHeader(format!(
                "declared length {declared} but {} bytes follow",
                cursor.remaining()
            )));
        }
        Self::decode_body(cursor)
    }

    /// Decode the entries of a header whose length prefix was already read.
    pub fn decode_body(body: &[u8]) -> RosResult<Self> {
        let mut cursor = body;
        let mut fields = BTreeMap::new();
        while cursor.has_remaining() {
            if cursor.remaining() < 4 {
                return Err(RosError::MalformedHeader(format!(
                    "{} stray bytes at end of header",
                    cursor.remaining()
                )));
            }
            let len = cursor.get_u32_le() as usize;
            if len > cursor.remaining() {
                return Err(RosError::MalformedHeader(format!(
                    "entry of {len} bytes overruns the {} remaining",
                    cursor.remaining()
                )));
            }
            let entry = std::str::from_utf8(&cursor[..len])
                .map_err(|e| RosError::MalformedHeader(format!("entry is not UTF-8: {e}")))?;
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| RosError::MalformedHeader(format!("entry {entry:?} lacks '='")))?;
            fields.insert(key.to_string(), value.to_string());
            cursor.advance(len);
        }
        Ok(Self { fields })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionHeader {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
