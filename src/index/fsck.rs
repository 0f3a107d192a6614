//! Index/mailbox reconciliation.
//!
//! Walks the index records and the mailbox messages side by side. A record
//! matches the next message when its stored header digest equals the digest
//! of the message's header and the message body ends exactly where the
//! record's body size says it does. Matching records get their flags,
//! location and header size refreshed; records that don't match are
//! expunged, and the same message is tried against the next record.
//!
//! Messages are assumed never to be reordered, only removed. Mailboxes that
//! were sorted by another tool still end up consistent, but most of their
//! messages are indexed again as new.

use std::io::{self, Read, Seek};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MboxError, Result};
use crate::index::append::append_messages;
use crate::index::check::check_header;
use crate::index::persist::stamp_mailbox;
use crate::index::store::{LockMode, MailIndex, RecordUpdate};
use crate::lock::MboxLock;
use crate::model::flags::{HeaderFlags, IndexFlags};
use crate::model::part::{self, MessageSize};
use crate::model::record::{encode_location, FieldType, IndexRecord};
use crate::parser::cursor::MboxCursor;
use crate::parser::header::{parse_message_header, DIGEST_LEN};
use crate::parser::mbox::{
    is_mbox_separator, skip_crlf, skip_empty_lines, skip_line, skip_message, FROM_PREFIX,
};

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    /// Records confirmed against a message.
    pub matched: usize,
    /// Matched records whose stored data had to change.
    pub updated: usize,
    pub relocated: usize,
    pub resized: usize,
    pub expunged: usize,
    /// Records created for messages the index didn't know.
    pub appended: usize,
    /// A dirty record's local flags differ from the flags in the mailbox.
    pub dirty: bool,
}

impl FsckReport {
    /// Whether the pass left the index exactly as it found it.
    pub fn is_noop(&self) -> bool {
        self.updated == 0 && self.expunged == 0 && self.appended == 0
    }
}

/// The stored digest must be present, full length and identical.
fn verify_header_md5sum(record: &IndexRecord, digest: &[u8; DIGEST_LEN]) -> bool {
    record
        .field(FieldType::Md5)
        .is_some_and(|old| old.len() >= DIGEST_LEN && old[..DIGEST_LEN] == digest[..])
}

/// Check that a body really ends at `end_offset`: either at end of file, or
/// right before `[\r]\n` followed by end of file or the next `From ` line.
fn verify_end_of_body<R: Read + Seek>(
    cursor: &mut MboxCursor<R>,
    end_offset: u64,
) -> io::Result<bool> {
    if end_offset > cursor.size() {
        return Ok(false);
    }
    cursor.seek(end_offset);
    if cursor.at_eof() {
        // End of file without the final line break.
        return Ok(true);
    }

    let data = cursor.read_data(1 + 1 + FROM_PREFIX.len())?;
    let data = data.strip_prefix(b"\r").unwrap_or(data);
    match data.strip_prefix(b"\n") {
        Some(rest) => Ok(rest.is_empty() || is_mbox_separator(rest)),
        // A lone `\r`, or anything else, isn't a line break.
        None => Ok(false),
    }
}

/// Stage a new header size, re-deriving the cached part data if present.
fn update_header_size(
    record: &IndexRecord,
    update: &mut RecordUpdate,
    hdr_size: &MessageSize,
) -> Result<()> {
    update.set_header_size(hdr_size.physical_size);

    let Some(part_data) = record.field(FieldType::MessagePart) else {
        return Ok(());
    };
    let part_data = part::update_header_size(part_data, hdr_size)?;
    update.set_field(FieldType::MessagePart, part_data);
    Ok(())
}

/// Consume the line break between a matched body and the next `From ` line.
///
/// The boundary was verified when the body matched, so a missing break
/// means the mailbox was changed by someone not holding the lock.
fn skip_separator_break<R: Read + Seek>(cursor: &mut MboxCursor<R>, path: &Path) -> Result<()> {
    let offset = cursor.offset();
    if skip_crlf(cursor).map_err(|e| MboxError::io(path, e))? {
        return Ok(());
    }
    warn!(offset, "Line break before From line vanished");
    Err(MboxError::ExternalChange { offset })
}

/// Match the message at the cursor against the record at `seq`.
///
/// The cursor is on the message's `From ` line. On a mismatch the record is
/// expunged and the same message is tried against the next one, without
/// parsing the header again. Returns the sequence number of the matching
/// record, or `None` once the records run out.
fn match_next_record<R: Read + Seek>(
    index: &mut MailIndex,
    seq: u32,
    cursor: &mut MboxCursor<R>,
    report: &mut FsckReport,
) -> Result<Option<u32>> {
    let path = index.mbox_path().to_path_buf();
    let io_err = |e| MboxError::io(&path, e);

    skip_line(cursor).map_err(io_err)?;
    let header_offset = cursor.offset();

    if index.lookup(seq).is_some_and(|rec| rec.body_size == 0) {
        // Possibly broken message: keep the header parser from running
        // into the next one.
        skip_message(cursor).map_err(io_err)?;
        cursor.set_read_limit(Some(cursor.offset()));
        cursor.seek(header_offset);
    }

    let parsed = parse_message_header(cursor);
    cursor.set_read_limit(None);
    let (hdr_size, summary) = parsed.map_err(io_err)?;
    let body_offset = cursor.offset();

    while let Some(record) = index.lookup(seq) {
        let verified = verify_header_md5sum(record, &summary.digest)
            && match body_offset.checked_add(record.body_size) {
                Some(end_offset) => verify_end_of_body(cursor, end_offset).map_err(io_err)?,
                // Corrupt size; can't end anywhere in the file.
                None => false,
            };
        if verified {
            let mut update = index.update_begin(seq)?;

            if !record.is_dirty() {
                // Flags just came from the file, so they aren't dirty.
                update.set_flags(summary.flags);
                update.clear_index_flags(IndexFlags::DIRTY);
            } else if record.msg_flags == summary.flags {
                // The mailbox already carries the local edit.
                update.clear_index_flags(IndexFlags::DIRTY);
            } else {
                report.dirty = true;
            }

            if record.location() != Some(header_offset) {
                debug!(
                    seq,
                    uid = record.uid,
                    old = ?record.location(),
                    new = header_offset,
                    "Message moved"
                );
                update.set_field(FieldType::Location, encode_location(header_offset));
                report.relocated += 1;
            }

            if record.header_size != hdr_size.physical_size {
                debug!(
                    seq,
                    uid = record.uid,
                    old = record.header_size,
                    new = hdr_size.physical_size,
                    "Header size changed"
                );
                update_header_size(record, &mut update, &hdr_size)?;
                report.resized += 1;
            }

            if index.update_end(update)? {
                report.updated += 1;
            }
            report.matched += 1;
            return Ok(Some(seq));
        }

        info!(
            seq,
            uid = record.uid,
            offset = header_offset,
            "Record doesn't match mailbox, expunging"
        );
        index.expunge(seq)?;
        report.expunged += 1;
    }

    Ok(None)
}

/// Reconcile `index` with the mailbox read through `cursor`.
///
/// The caller must hold the mailbox lock. Leaves the index exclusively
/// locked; [`fsck_mailbox`] takes care of unlocking.
pub fn fsck_buffer<R: Read + Seek>(
    index: &mut MailIndex,
    cursor: &mut MboxCursor<R>,
    config: &Config,
) -> Result<FsckReport> {
    let path = index.mbox_path().to_path_buf();
    let io_err = |e| MboxError::io(&path, e);

    index.set_lock(LockMode::Exclusive)?;
    // Stays set if the pass fails, so the next open retries.
    index.set_header_flags(HeaderFlags::FSCK);
    let mut report = FsckReport::default();

    skip_empty_lines(cursor).map_err(io_err)?;
    let head = cursor.read_data(FROM_PREFIX.len()).map_err(io_err)?;
    if head.len() >= FROM_PREFIX.len() {
        if !is_mbox_separator(head) {
            warn!(path = %path.display(), "File isn't in mbox format");
            return Err(MboxError::InvalidMbox(path.clone()));
        }
    } else if !head.is_empty() {
        debug!(
            path = %path.display(),
            size = cursor.size(),
            "Mailbox too small to hold a message, treating as empty"
        );
        cursor.seek(cursor.size());
    }

    // Records up to `confirmed` have been matched against the mailbox.
    let mut confirmed = 0u32;
    let mut next_seq = index.lookup(1).map(|_| 1u32);
    let mut first = true;
    while let Some(seq) = next_seq {
        let from_offset = cursor.offset();
        if !first {
            skip_separator_break(cursor, &path)?;
        }
        first = false;

        if cursor.at_eof() {
            break;
        }

        match match_next_record(index, seq, cursor, &mut report)? {
            Some(matched) => {
                confirmed = matched;
                next_seq = index.next(matched);
            }
            None => {
                cursor.seek(from_offset);
                break;
            }
        }
    }

    let seq = confirmed + 1;
    while index.lookup(seq).is_some() {
        let record = index.expunge(seq)?;
        info!(seq, uid = record.uid, "No message left for record, expunging");
        report.expunged += 1;
    }

    if !report.dirty && index.header().flags.contains(HeaderFlags::DIRTY_MESSAGES) {
        // Every flag in the index is in the mailbox too.
        index.clear_header_flags(HeaderFlags::DIRTY_MESSAGES);
    }

    if !cursor.at_eof() {
        report.appended = append_messages(index, cursor, &config.performance)?;
    }

    info!(
        path = %path.display(),
        matched = report.matched,
        updated = report.updated,
        expunged = report.expunged,
        appended = report.appended,
        dirty = report.dirty,
        "Index reconciled"
    );
    Ok(report)
}

/// Reconcile the index of a mailbox with the mailbox file.
///
/// Opens and exclusively locks the mailbox, runs the pass, and always
/// unlocks both the mailbox and the index before returning. On success the
/// index header is checked and the mailbox change hints are refreshed.
pub fn fsck_mailbox(index: &mut MailIndex, config: &Config) -> Result<FsckReport> {
    let path = index.mbox_path().to_path_buf();
    let mut cursor = MboxCursor::open(&path, config.performance.read_buffer_size)?;
    let lock = MboxLock::acquire(cursor.get_ref(), &path)?;

    let result = fsck_buffer(index, &mut cursor, config);
    let index_unlocked = index.set_lock(LockMode::Unlocked);
    let mbox_unlocked = lock.release();

    let report = result?;
    index_unlocked?;
    mbox_unlocked?;

    if check_header(index) {
        warn!(path = %path.display(), "Index header counters were corrected");
    }
    stamp_mailbox(index)?;
    Ok(report)
}
