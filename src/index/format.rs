//! Binary index file format.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER (128 bytes, fixed)            │
//! │  magic: [u8; 8] = b"MBOXIDX\0"       │
//! │  version: u32                        │
//! │  flags: u32                          │
//! │  messages_count: u32                 │
//! │  seen_messages_count: u32            │
//! │  deleted_messages_count: u32         │
//! │  next_uid: u32                       │
//! │  mbox_file_size: u64                 │
//! │  mbox_modified_time: i64             │
//! │  sha256_first_4kb: [u8; 32]          │
//! │  (padding to 128 bytes)              │
//! ├──────────────────────────────────────┤
//! │ RECORDS (variable)                   │
//! │  bincode-serialized Vec<IndexRecord> │
//! └──────────────────────────────────────┘
//! ```

use crate::model::flags::HeaderFlags;

/// Magic bytes identifying an mboxstore index file.
pub const MAGIC: &[u8; 8] = b"MBOXIDX\0";

/// Current index format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 128;

/// Size of the SHA-256 hash prefix used to detect mailbox changes.
pub const HASH_PREFIX_LEN: usize = 4096;

/// Serializable index header.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexHeader {
    /// Magic bytes (must equal [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version (must equal [`VERSION`]).
    pub version: u32,
    pub flags: HeaderFlags,
    pub messages_count: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,
    /// Uid given to the next appended record.
    pub next_uid: u32,
    /// Size of the MBOX file when the index was last synchronized.
    pub mbox_file_size: u64,
    /// Modification time of the MBOX file (Unix timestamp in seconds).
    pub mbox_modified_time: i64,
    /// SHA-256 of the first 4 KB of the MBOX file.
    pub sha256_first_4kb: [u8; 32],
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            flags: HeaderFlags::empty(),
            messages_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            next_uid: 1,
            mbox_file_size: 0,
            mbox_modified_time: 0,
            sha256_first_4kb: [0; 32],
        }
    }
}

impl IndexHeader {
    /// Validate that the header is well-formed and matches the current format.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        if self.next_uid == 0 {
            return Err("next_uid is zero".into());
        }
        Ok(())
    }
}
