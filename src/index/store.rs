//! In-memory index storage engine.
//!
//! Records are kept densely in arrival order, so a record's sequence number
//! is always its position + 1 and expunging renumbers everything after it.
//! Field changes go through a staged [`RecordUpdate`] that is applied
//! all-or-nothing by [`MailIndex::update_end`].

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{MboxError, Result};
use crate::index::format::IndexHeader;
use crate::model::flags::{HeaderFlags, IndexFlags, MailFlags};
use crate::model::record::{FieldType, IndexRecord};

/// Lock state of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Shared,
    Exclusive,
}

/// The index of one mailbox.
#[derive(Debug)]
pub struct MailIndex {
    mbox_path: PathBuf,
    header: IndexHeader,
    records: Vec<IndexRecord>,
    lock: LockMode,
}

/// Staged changes to one record.
///
/// Captures the record's uid at [`MailIndex::update_begin`]; the commit is
/// refused if the record at that sequence number changed in between.
#[derive(Debug)]
pub struct RecordUpdate {
    seq: u32,
    uid: u32,
    flags: Option<MailFlags>,
    clear_index_flags: IndexFlags,
    header_size: Option<u64>,
    fields: Vec<(FieldType, Vec<u8>)>,
}

impl RecordUpdate {
    /// Replace the message flags. Like any flag write this marks the record
    /// dirty unless the bit is cleared again with
    /// [`clear_index_flags`](Self::clear_index_flags).
    pub fn set_flags(&mut self, flags: MailFlags) {
        self.flags = Some(flags);
    }

    pub fn clear_index_flags(&mut self, flags: IndexFlags) {
        self.clear_index_flags |= flags;
    }

    pub fn set_header_size(&mut self, size: u64) {
        self.header_size = Some(size);
    }

    pub fn set_field(&mut self, field: FieldType, data: Vec<u8>) {
        self.fields.retain(|(f, _)| *f != field);
        self.fields.push((field, data));
    }
}

impl MailIndex {
    /// An empty index for the given mailbox.
    pub fn new(mbox_path: impl Into<PathBuf>) -> Self {
        Self::from_parts(mbox_path.into(), IndexHeader::default(), Vec::new())
    }

    pub(crate) fn from_parts(
        mbox_path: PathBuf,
        header: IndexHeader,
        records: Vec<IndexRecord>,
    ) -> Self {
        Self {
            mbox_path,
            header,
            records,
            lock: LockMode::Unlocked,
        }
    }

    pub fn mbox_path(&self) -> &Path {
        &self.mbox_path
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut IndexHeader {
        &mut self.header
    }

    pub fn set_header_flags(&mut self, flags: HeaderFlags) {
        self.header.flags |= flags;
    }

    pub fn clear_header_flags(&mut self, flags: HeaderFlags) {
        self.header.flags &= !flags;
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock
    }

    /// Change the lock state. Mutations require [`LockMode::Exclusive`].
    pub fn set_lock(&mut self, mode: LockMode) -> Result<()> {
        if self.lock != mode {
            debug!(from = ?self.lock, to = ?mode, "Index lock change");
            self.lock = mode;
        }
        Ok(())
    }

    fn require_exclusive(&self) -> Result<()> {
        if self.lock == LockMode::Exclusive {
            Ok(())
        } else {
            Err(MboxError::IndexNotLocked)
        }
    }

    fn position(&self, seq: u32) -> Option<usize> {
        let pos = (seq as usize).checked_sub(1)?;
        (pos < self.records.len()).then_some(pos)
    }

    /// Record with the given 1-based sequence number.
    pub fn lookup(&self, seq: u32) -> Option<&IndexRecord> {
        self.position(seq).map(|pos| &self.records[pos])
    }

    /// Sequence number of the record following `seq`, if any.
    pub fn next(&self, seq: u32) -> Option<u32> {
        let next = seq.checked_add(1)?;
        self.position(next).map(|_| next)
    }

    /// Start staging changes to the record at `seq`.
    pub fn update_begin(&self, seq: u32) -> Result<RecordUpdate> {
        let record = self.lookup(seq).ok_or(MboxError::RecordNotFound { seq })?;
        Ok(RecordUpdate {
            seq,
            uid: record.uid,
            flags: None,
            clear_index_flags: IndexFlags::empty(),
            header_size: None,
            fields: Vec::new(),
        })
    }

    /// Apply a staged update. Returns whether the record actually changed.
    pub fn update_end(&mut self, update: RecordUpdate) -> Result<bool> {
        self.require_exclusive()?;
        let seq = update.seq;
        let pos = self.position(seq).ok_or(MboxError::RecordNotFound { seq })?;
        if self.records[pos].uid != update.uid {
            return Err(MboxError::UpdateFailed {
                seq,
                reason: format!(
                    "record changed during update (uid {} -> {})",
                    update.uid, self.records[pos].uid
                ),
            });
        }

        let mut record = self.records[pos].clone();
        if let Some(flags) = update.flags {
            record.msg_flags = flags;
            record.index_flags |= IndexFlags::DIRTY;
        }
        record.index_flags &= !update.clear_index_flags;
        if let Some(size) = update.header_size {
            record.header_size = size;
        }
        for (field, data) in update.fields {
            record.set_field(field, data);
        }

        let (new_flags, dirty) = (record.msg_flags, record.is_dirty());
        let old = std::mem::replace(&mut self.records[pos], record);
        self.adjust_counters(old.msg_flags, new_flags);
        if dirty {
            self.header.flags |= HeaderFlags::DIRTY_MESSAGES;
        }
        Ok(old != self.records[pos])
    }

    /// Locally change the flags of a message. The record becomes dirty
    /// until the mailbox file is rewritten with the new flags.
    pub fn update_flags(&mut self, seq: u32, flags: MailFlags) -> Result<()> {
        let mut update = self.update_begin(seq)?;
        update.set_flags(flags);
        self.update_end(update)?;
        Ok(())
    }

    /// Remove the record at `seq`. Later records move down by one.
    pub fn expunge(&mut self, seq: u32) -> Result<IndexRecord> {
        self.require_exclusive()?;
        let pos = self.position(seq).ok_or(MboxError::RecordNotFound { seq })?;
        let record = self.records.remove(pos);
        self.adjust_counters(record.msg_flags, MailFlags::empty());
        self.header.messages_count = self.header.messages_count.saturating_sub(1);
        debug!(seq, uid = record.uid, "Expunged record");
        Ok(record)
    }

    /// Add a new record at the end, assigning it the next uid.
    /// Returns its sequence number.
    pub fn append_record(&mut self, mut record: IndexRecord) -> Result<u32> {
        self.require_exclusive()?;
        record.uid = self.header.next_uid;
        self.header.next_uid = self.header.next_uid.saturating_add(1);
        self.adjust_counters(MailFlags::empty(), record.msg_flags);
        self.header.messages_count += 1;
        if record.is_dirty() {
            self.header.flags |= HeaderFlags::DIRTY_MESSAGES;
        }
        self.records.push(record);
        Ok(self.records.len() as u32)
    }

    fn adjust_counters(&mut self, old: MailFlags, new: MailFlags) {
        let counters = [
            (MailFlags::SEEN, &mut self.header.seen_messages_count),
            (MailFlags::DELETED, &mut self.header.deleted_messages_count),
        ];
        for (flag, counter) in counters {
            match (old.contains(flag), new.contains(flag)) {
                (false, true) => *counter += 1,
                (true, false) => *counter = counter.saturating_sub(1),
                _ => {}
            }
        }
    }
}
