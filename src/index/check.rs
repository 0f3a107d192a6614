//! Structural check of the index header against its records.

use tracing::warn;

use crate::index::store::MailIndex;
use crate::model::flags::{HeaderFlags, MailFlags};

/// Recompute the header counters from the records and fix any that drifted.
///
/// Also raises `next_uid` above every uid in use and clears the `FSCK`
/// flag. Returns whether anything other than the flag had to change.
pub fn check_header(index: &mut MailIndex) -> bool {
    let records = index.records();
    let messages = records.len() as u32;
    let seen = count_with(records.iter().map(|r| r.msg_flags), MailFlags::SEEN);
    let deleted = count_with(records.iter().map(|r| r.msg_flags), MailFlags::DELETED);
    let max_uid = records.iter().map(|r| r.uid).max().unwrap_or(0);
    let any_dirty = records.iter().any(|r| r.is_dirty());

    let header = index.header_mut();
    let mut corrected = false;
    corrected |= fix_counter("messages_count", &mut header.messages_count, messages);
    corrected |= fix_counter("seen_messages_count", &mut header.seen_messages_count, seen);
    corrected |= fix_counter(
        "deleted_messages_count",
        &mut header.deleted_messages_count,
        deleted,
    );

    if header.next_uid <= max_uid {
        warn!(
            next_uid = header.next_uid,
            max_uid, "Index header next_uid is behind the records"
        );
        header.next_uid = max_uid.saturating_add(1);
        corrected = true;
    }

    if any_dirty && !header.flags.contains(HeaderFlags::DIRTY_MESSAGES) {
        warn!("Dirty records without the index dirty flag");
        header.flags |= HeaderFlags::DIRTY_MESSAGES;
        corrected = true;
    }

    header.flags &= !HeaderFlags::FSCK;
    corrected
}

fn count_with(flags: impl Iterator<Item = MailFlags>, flag: MailFlags) -> u32 {
    flags.filter(|f| f.contains(flag)).count() as u32
}

fn fix_counter(name: &str, counter: &mut u32, actual: u32) -> bool {
    if *counter == actual {
        return false;
    }
    warn!(
        counter = name,
        stored = *counter,
        actual, "Index header counter is wrong"
    );
    *counter = actual;
    true
}
