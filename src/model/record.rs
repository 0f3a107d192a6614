//! Index records: the persisted metadata of one message.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::model::flags::{IndexFlags, MailFlags};

/// Tags of the cached, variable-length record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Offset of the message header in the mailbox, u64 little-endian.
    Location,
    /// 16-byte digest of the identity header fields.
    Md5,
    /// Serialized [`MessagePart`](crate::model::part::MessagePart).
    MessagePart,
}

/// Metadata for a single message, owned by [`MailIndex`](crate::index::store::MailIndex).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Unique, never reused identifier.
    pub uid: u32,
    pub msg_flags: MailFlags,
    pub index_flags: IndexFlags,
    /// Physical size of the header, terminating empty line included.
    pub header_size: u64,
    /// Physical size of the body. 0 means unknown.
    pub body_size: u64,
    fields: BTreeMap<FieldType, Vec<u8>>,
}

impl IndexRecord {
    /// A record with no cached fields. The uid is assigned on append.
    pub fn new(msg_flags: MailFlags, header_size: u64, body_size: u64) -> Self {
        Self {
            uid: 0,
            msg_flags,
            index_flags: IndexFlags::empty(),
            header_size,
            body_size,
            fields: BTreeMap::new(),
        }
    }

    /// Raw value of a cached field.
    pub fn field(&self, field: FieldType) -> Option<&[u8]> {
        self.fields.get(&field).map(Vec::as_slice)
    }

    pub fn has_field(&self, field: FieldType) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn set_field(&mut self, field: FieldType, data: Vec<u8>) {
        self.fields.insert(field, data);
    }

    /// Decoded [`FieldType::Location`]. `None` if missing or truncated.
    pub fn location(&self) -> Option<u64> {
        self.field(FieldType::Location)
            .filter(|data| data.len() >= 8)
            .map(LittleEndian::read_u64)
    }

    pub fn is_dirty(&self) -> bool {
        self.index_flags.contains(IndexFlags::DIRTY)
    }
}

/// Encode an offset for [`FieldType::Location`].
pub fn encode_location(offset: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    LittleEndian::write_u64(&mut buf, offset);
    buf
}
