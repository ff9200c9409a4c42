// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol for mesh metadata frames.
//!
//! Five message kinds share the layout `<u8 code><payload>`:
//!
//! | Code | Kind | Payload |
//! |------|------|---------|
//! | `M` | metadata push | delta, change version |
//! | `F` | sync-from query | query id |
//! | `f` | sync-from reply | query id, version |
//! | `T` | sync-to query | query id, version |
//! | `t` | sync-to reply | query id |
//!
//! The leading byte is version-independent; every subsequent field is
//! encoded with the cluster's negotiated [`WireVersion`]. Frame boundaries
//! and integrity are the transport's responsibility, so [`Message::decode`]
//! is total (returns `None` on malformed input) and the live inbound path
//! escalates `None` to a fatal protocol violation.

use crate::lattice::GSet;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The negotiated encoding version for payload fields.
///
/// Version 1 encodes integers as fixed-width little-endian and collections
/// as a length-prefixed element sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireVersion(pub u16);

impl WireVersion {
    /// The initial wire version.
    pub const V1: WireVersion = WireVersion(1);
}

/// Types that can ride the versioned wire codec.
pub trait WireEncode: Sized {
    /// Append the encoded representation to `buf`.
    fn encode(&self, version: WireVersion, buf: &mut BytesMut);

    /// Decode one value from the front of `buf`, or `None` if the bytes
    /// do not form a valid encoding.
    fn decode(version: WireVersion, buf: &mut Bytes) -> Option<Self>;
}

impl WireEncode for u64 {
    fn encode(&self, _version: WireVersion, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }

    fn decode(_version: WireVersion, buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        Some(buf.get_u64_le())
    }
}

impl<T> WireEncode for GSet<T>
where
    T: WireEncode + Ord + Clone,
{
    fn encode(&self, version: WireVersion, buf: &mut BytesMut) {
        (self.len() as u64).encode(version, buf);
        for element in self.iter() {
            element.encode(version, buf);
        }
    }

    fn decode(version: WireVersion, buf: &mut Bytes) -> Option<Self> {
        let len = u64::decode(version, buf)?;
        // A count that cannot fit in the remaining bytes is malformed.
        if len > buf.remaining() as u64 {
            return None;
        }
        let mut set = GSet::new();
        for _ in 0..len {
            set.insert(T::decode(version, buf)?);
        }
        Some(set)
    }
}

const CODE_METADATA: u8 = b'M';
const CODE_SYNC_FROM_QUERY: u8 = b'F';
const CODE_SYNC_FROM_REPLY: u8 = b'f';
const CODE_SYNC_TO_QUERY: u8 = b'T';
const CODE_SYNC_TO_REPLY: u8 = b't';

/// A decoded mesh protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<M> {
    /// A metadata delta (or full state, on bootstrap) tagged with the
    /// sender's version after the change.
    Metadata { delta: M, version: u64 },
    /// "Tell me your current version" (sync-from, caller side).
    SyncFromQuery { query_id: u64 },
    /// The remote peer's version at the moment it answered.
    SyncFromReply { query_id: u64, version: u64 },
    /// "Wait until you have observed my version `v`" (sync-to, caller side).
    SyncToQuery { query_id: u64, version: u64 },
    /// The remote peer has observed the requested version.
    SyncToReply { query_id: u64 },
}

impl<M: WireEncode> Message<M> {
    /// Short kind label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Metadata { .. } => "metadata",
            Message::SyncFromQuery { .. } => "sync_from_query",
            Message::SyncFromReply { .. } => "sync_from_reply",
            Message::SyncToQuery { .. } => "sync_to_query",
            Message::SyncToReply { .. } => "sync_to_reply",
        }
    }

    /// Encode into a complete frame payload.
    pub fn encode(&self, version: WireVersion) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Metadata {
                delta,
                version: change_version,
            } => {
                buf.put_u8(CODE_METADATA);
                delta.encode(version, &mut buf);
                change_version.encode(version, &mut buf);
            }
            Message::SyncFromQuery { query_id } => {
                buf.put_u8(CODE_SYNC_FROM_QUERY);
                query_id.encode(version, &mut buf);
            }
            Message::SyncFromReply { query_id, version: v } => {
                buf.put_u8(CODE_SYNC_FROM_REPLY);
                query_id.encode(version, &mut buf);
                v.encode(version, &mut buf);
            }
            Message::SyncToQuery { query_id, version: v } => {
                buf.put_u8(CODE_SYNC_TO_QUERY);
                query_id.encode(version, &mut buf);
                v.encode(version, &mut buf);
            }
            Message::SyncToReply { query_id } => {
                buf.put_u8(CODE_SYNC_TO_REPLY);
                query_id.encode(version, &mut buf);
            }
        }
        buf.freeze()
    }

    /// Decode a complete frame payload.
    ///
    /// Returns `None` on an unknown leading byte, a truncated payload, or
    /// trailing bytes after the last field.
    pub fn decode(version: WireVersion, mut payload: Bytes) -> Option<Self> {
        if payload.remaining() < 1 {
            return None;
        }
        let code = payload.get_u8();
        let message = match code {
            CODE_METADATA => Message::Metadata {
                delta: M::decode(version, &mut payload)?,
                version: u64::decode(version, &mut payload)?,
            },
            CODE_SYNC_FROM_QUERY => Message::SyncFromQuery {
                query_id: u64::decode(version, &mut payload)?,
            },
            CODE_SYNC_FROM_REPLY => Message::SyncFromReply {
                query_id: u64::decode(version, &mut payload)?,
                version: u64::decode(version, &mut payload)?,
            },
            CODE_SYNC_TO_QUERY => Message::SyncToQuery {
                query_id: u64::decode(version, &mut payload)?,
                version: u64::decode(version, &mut payload)?,
            },
            CODE_SYNC_TO_REPLY => Message::SyncToReply {
                query_id: u64::decode(version, &mut payload)?,
            },
            _ => return None,
        };
        if payload.has_remaining() {
            return None;
        }
        Some(message)
    }
}
