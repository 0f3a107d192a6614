//! Integration tests for index/mailbox reconciliation.

use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use mboxstore::config::Config;
use mboxstore::error::MboxError;
use mboxstore::index::fsck::{fsck_buffer, fsck_mailbox, FsckReport};
use mboxstore::index::persist;
use mboxstore::index::store::{LockMode, MailIndex};
use mboxstore::lock::MboxLock;
use mboxstore::model::flags::{HeaderFlags, MailFlags};
use mboxstore::model::part::MessagePart;
use mboxstore::model::record::{encode_location, FieldType, IndexRecord};
use mboxstore::parser::cursor::MboxCursor;
use mboxstore::parser::header::parse_message_header;

// ─── Helpers ────────────────────────────────────────────────────────

/// One message in the usual layout: separator, header, blank line, body,
/// and the blank line that ends every message.
fn message(subject: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "From {subject}@example.com Mon Jan  1 00:00:00 2024\n\
         From: {subject}@example.com\n\
         Subject: {subject}\n\
         Message-ID: <{subject}@example.com>\n\
         {extra_headers}\n\
         {body}\n"
    )
}

fn m1() -> String {
    message("one", "Status: R\n", "body one\n")
}

fn m2() -> String {
    message("two", "", "body two\n")
}

fn m3() -> String {
    message("three", "", "body three\n")
}

fn m4() -> String {
    message("four", "", "body four\n")
}

/// Offsets of every message header: the byte after each `From ` line.
fn header_offsets(content: &str) -> Vec<u64> {
    let bytes = content.as_bytes();
    let mut offsets = Vec::new();
    let mut line_start = 0usize;
    while line_start < bytes.len() {
        let line_end = bytes[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| line_start + p + 1)
            .unwrap_or(bytes.len());
        if bytes[line_start..].starts_with(b"From ") {
            offsets.push(line_end as u64);
        }
        line_start = line_end;
    }
    offsets
}

fn write_mbox(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("inbox");
    std::fs::write(&path, content).unwrap();
    path
}

/// Write `content` and index it from scratch.
fn setup(content: &str) -> (tempfile::TempDir, PathBuf, MailIndex) {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_mbox(tmp.path(), content);
    let mut index = MailIndex::new(&path);
    let report = fsck_mailbox(&mut index, &Config::default()).unwrap();
    assert_eq!(report.appended, header_offsets(content).len());
    (tmp, path, index)
}

fn uids(index: &MailIndex) -> Vec<u32> {
    index.records().iter().map(|r| r.uid).collect()
}

/// Every record's digest, header size and location agree with `content`.
fn assert_records_verify(index: &MailIndex, content: &str) {
    let offsets = header_offsets(content);
    assert_eq!(index.len(), offsets.len());
    let mut cursor = MboxCursor::new(Cursor::new(content.as_bytes().to_vec()), 0).unwrap();
    for (rec, &offset) in index.records().iter().zip(&offsets) {
        assert_eq!(rec.location(), Some(offset), "uid {}", rec.uid);
        cursor.seek(offset);
        let (size, summary) = parse_message_header(&mut cursor).unwrap();
        assert_eq!(rec.header_size, size.physical_size, "uid {}", rec.uid);
        assert_eq!(
            rec.field(FieldType::Md5),
            Some(&summary.digest[..]),
            "uid {}",
            rec.uid
        );
        assert!(cursor.offset() + rec.body_size <= content.len() as u64);
    }
}

fn fsck(index: &mut MailIndex) -> FsckReport {
    fsck_mailbox(index, &Config::default()).unwrap()
}

// ─── Idempotence ────────────────────────────────────────────────────

#[test]
fn test_second_pass_changes_nothing() {
    let content = [m1(), m2(), m3()].concat();
    let (_tmp, _path, mut index) = setup(&content);
    assert_records_verify(&index, &content);
    let before = index.records().to_vec();

    let report = fsck(&mut index);
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(report.matched, 3);
    assert_eq!(report.relocated, 0);
    assert_eq!(report.resized, 0);
    assert!(!report.dirty);
    assert_eq!(index.records(), &before[..]);

    assert_eq!(index.lock_mode(), LockMode::Unlocked);
    assert!(!index.header().flags.contains(HeaderFlags::FSCK));
    assert_eq!(index.header().messages_count, 3);
    assert_eq!(index.header().seen_messages_count, 1);
}

// ─── Deletion ───────────────────────────────────────────────────────

#[test]
fn test_deleted_message_is_expunged_and_rest_renumbered() {
    let (tmp, path, mut index) = setup(&[m1(), m2(), m3()].concat());

    let content = [m1(), m3()].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    assert_eq!(report.expunged, 1);
    assert_eq!(report.matched, 2);
    assert_eq!(report.relocated, 1);
    assert_eq!(report.appended, 0);
    assert_eq!(uids(&index), vec![1, 3]);
    assert_records_verify(&index, &content);
    assert_eq!(index.header().next_uid, 4);

    assert!(fsck(&mut index).is_noop());
    assert_eq!(index.mbox_path(), path.as_path());
}

#[test]
fn test_first_message_deleted() {
    let (tmp, _path, mut index) = setup(&[m1(), m2()].concat());

    let content = m2();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    assert_eq!(report.expunged, 1);
    assert_eq!(report.matched, 1);
    assert_eq!(index.len(), 1);
    assert_eq!(index.lookup(1).unwrap().uid, 2);
    assert_records_verify(&index, &content);
    assert_eq!(index.header().seen_messages_count, 0);
}

#[test]
fn test_trailing_messages_deleted() {
    let (tmp, _path, mut index) = setup(&[m1(), m2(), m3()].concat());

    write_mbox(tmp.path(), &m1());
    let report = fsck(&mut index);
    assert_eq!(report.matched, 1);
    assert_eq!(report.expunged, 2);
    assert_eq!(uids(&index), vec![1]);
}

fn crlf(content: &str) -> String {
    content.replace('\n', "\r\n")
}

#[test]
fn test_crlf_mailbox_idempotence_and_deletion() {
    let (tmp, _path, mut index) = setup(&crlf(&[m1(), m2(), m3()].concat()));
    assert_eq!(index.lookup(1).unwrap().body_size, "body one\r\n".len() as u64);

    let report = fsck(&mut index);
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(report.matched, 3);

    let content = crlf(&[m1(), m3()].concat());
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);
    assert_eq!(report.matched, 2);
    assert_eq!(report.expunged, 1);
    assert_eq!(report.appended, 0);
    assert_eq!(uids(&index), vec![1, 3]);
    assert_records_verify(&index, &content);
    assert!(fsck(&mut index).is_noop());
}

#[test]
fn test_reordered_messages_are_reindexed() {
    let (tmp, _path, mut index) = setup(&[m1(), m2(), m3()].concat());

    let content = [m1(), m3(), m2()].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    // "three" is tried against "two" first, which is expunged; "two" then
    // finds no record left and comes back as a new message.
    assert_eq!(report.matched, 2);
    assert_eq!(report.relocated, 1);
    assert_eq!(report.expunged, 1);
    assert_eq!(report.appended, 1);
    assert_eq!(uids(&index), vec![1, 3, 4]);
    assert_records_verify(&index, &content);
}

// ─── Append ─────────────────────────────────────────────────────────

#[test]
fn test_new_message_at_end_is_appended() {
    let (tmp, _path, mut index) = setup(&[m1(), m2(), m3()].concat());
    let before = index.records().to_vec();

    let content = [m1(), m2(), m3(), m4()].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    assert_eq!(report.appended, 1);
    assert_eq!(report.matched, 3);
    assert_eq!(report.updated, 0);
    assert_eq!(report.expunged, 0);
    assert_eq!(&index.records()[..3], &before[..]);
    assert_eq!(index.lookup(4).unwrap().uid, 4);
    assert_records_verify(&index, &content);
}

// ─── Digest authority ───────────────────────────────────────────────

#[test]
fn test_changed_identity_header_is_reindexed() {
    let (tmp, _path, mut index) = setup(&[m1(), m2(), m3()].concat());

    let edited = message("two", "", "body two\n").replace("Subject: two", "Subject: 2");
    let content = [m1(), edited, m3()].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    // Messages are never assumed reordered, so everything after the
    // changed message is indexed again.
    assert_eq!(report.matched, 1);
    assert_eq!(report.expunged, 2);
    assert_eq!(report.appended, 2);
    assert_eq!(uids(&index), vec![1, 4, 5]);
    assert_records_verify(&index, &content);
}

#[test]
fn test_flag_header_rewrite_keeps_identity() {
    let (tmp, _path, mut index) = setup(&[m1(), m2(), m3()].concat());
    let uid_before = index.lookup(2).unwrap().uid;

    let content = [m1(), message("two", "Status: RO\n", "body two\n"), m3()].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    assert_eq!(report.expunged, 0);
    assert_eq!(report.matched, 3);
    assert_eq!(report.resized, 1);
    assert_eq!(report.relocated, 1);
    assert_eq!(report.updated, 2);

    let rec = index.lookup(2).unwrap();
    assert_eq!(rec.uid, uid_before);
    assert_eq!(rec.msg_flags, MailFlags::SEEN);
    assert!(!rec.is_dirty());
    assert_eq!(index.header().seen_messages_count, 2);
    assert_records_verify(&index, &content);

    // Cached part data follows the new header size.
    let part = MessagePart::deserialize(rec.field(FieldType::MessagePart).unwrap()).unwrap();
    assert_eq!(part.root().unwrap().header.physical_size, rec.header_size);
}

// ─── Boundary strictness ────────────────────────────────────────────

#[test]
fn test_changed_body_length_fails_boundary() {
    let (tmp, _path, mut index) = setup(&[m1(), m2(), m3()].concat());

    let content = [m1(), message("two", "", "body two!!\n"), m3()].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    assert_eq!(report.matched, 1);
    assert_eq!(report.expunged, 2);
    assert_eq!(report.appended, 2);
    assert_eq!(index.lookup(2).unwrap().body_size, "body two!!\n".len() as u64);
    assert_records_verify(&index, &content);
}

#[test]
fn test_body_followed_by_non_separator_fails() {
    let (tmp, _path, mut index) = setup(&m1());
    let body_size = index.lookup(1).unwrap().body_size;
    assert_eq!(body_size, "body one\n".len() as u64);

    // Same header and body, but "\nNotFrom " after the body.
    let content = format!("{}NotFrom here\n", m1());
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);

    assert_eq!(report.matched, 0);
    assert_eq!(report.expunged, 1);
    assert_eq!(report.appended, 1);
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[test]
fn test_empty_file() {
    let (tmp, _path, mut index) = setup("");
    let report = fsck(&mut index);
    assert_eq!(report, FsckReport::default());
    assert!(index.is_empty());

    // A few stray bytes can't hold a message either.
    write_mbox(tmp.path(), "\n\n");
    assert_eq!(fsck(&mut index), FsckReport::default());
}

#[test]
fn test_truncated_file_expunges_everything() {
    let (tmp, _path, mut index) = setup(&[m1(), m2()].concat());
    write_mbox(tmp.path(), "");
    let report = fsck(&mut index);
    assert_eq!(report.expunged, 2);
    assert!(index.is_empty());
    assert_eq!(index.header().messages_count, 0);
    assert_eq!(index.header().next_uid, 3);
}

#[test]
fn test_not_an_mbox() {
    let (tmp, _path, mut index) = setup(&[m1(), m2()].concat());
    let before = index.records().to_vec();

    write_mbox(tmp.path(), "Not an mbox\n");
    let err = fsck_mailbox(&mut index, &Config::default()).unwrap_err();
    assert!(matches!(err, MboxError::InvalidMbox(_)), "{err:?}");

    assert_eq!(index.records(), &before[..]);
    assert_eq!(index.lock_mode(), LockMode::Unlocked);
    // The next open retries.
    assert!(index.header().flags.contains(HeaderFlags::FSCK));
}

#[test]
fn test_body_running_to_end_of_file() {
    let data = b"From x\n\nHi there!\n";

    let mut hdr = MboxCursor::new(Cursor::new(b"\n".to_vec()), 0).unwrap();
    let (size, summary) = parse_message_header(&mut hdr).unwrap();

    let mut index = MailIndex::new("/tmp/eof.mbox");
    index.set_lock(LockMode::Exclusive).unwrap();
    let mut rec = IndexRecord::new(MailFlags::empty(), size.physical_size, 10);
    rec.set_field(FieldType::Md5, summary.digest.to_vec());
    rec.set_field(FieldType::Location, encode_location(7));
    index.append_record(rec).unwrap();
    index.set_lock(LockMode::Unlocked).unwrap();

    let mut cursor = MboxCursor::new(Cursor::new(data.to_vec()), 0).unwrap();
    let report = fsck_buffer(&mut index, &mut cursor, &Config::default()).unwrap();
    assert_eq!(report.matched, 1);
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(index.lookup(1).unwrap().uid, 1);
}

#[test]
fn test_body_ending_in_lone_cr() {
    let (tmp, _path, mut index) = setup("From x\nSubject: a\n\nbody\r\n");
    assert_eq!(index.lookup(1).unwrap().body_size, 4);

    write_mbox(tmp.path(), "From x\nSubject: a\n\nbody\r");
    let report = fsck(&mut index);
    assert_eq!(report.matched, 0);
    assert_eq!(report.expunged, 1);
    assert_eq!(report.appended, 1);
    assert_eq!(uids(&index), vec![2]);
}

#[test]
fn test_corrupt_body_size_is_a_mismatch() {
    let data = b"From x\n\nHi there!\n";

    let mut hdr = MboxCursor::new(Cursor::new(b"\n".to_vec()), 0).unwrap();
    let (size, summary) = parse_message_header(&mut hdr).unwrap();

    let mut index = MailIndex::new("/tmp/huge.mbox");
    index.set_lock(LockMode::Exclusive).unwrap();
    let mut rec = IndexRecord::new(MailFlags::empty(), size.physical_size, u64::MAX);
    rec.set_field(FieldType::Md5, summary.digest.to_vec());
    rec.set_field(FieldType::Location, encode_location(7));
    index.append_record(rec).unwrap();

    let mut cursor = MboxCursor::new(Cursor::new(data.to_vec()), 0).unwrap();
    let report = fsck_buffer(&mut index, &mut cursor, &Config::default()).unwrap();
    assert_eq!(report.matched, 0);
    assert_eq!(report.expunged, 1);
    assert_eq!(report.appended, 1);
    let rec = index.lookup(1).unwrap();
    assert_eq!(rec.uid, 2);
    assert_eq!(rec.body_size, "Hi there!".len() as u64);
}

#[test]
fn test_empty_body_message() {
    let content = [message("empty", "", ""), m2()].concat();
    let (tmp, _path, mut index) = setup(&content);
    assert_eq!(index.lookup(1).unwrap().body_size, 0);
    assert_records_verify(&index, &content);

    let report = fsck(&mut index);
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(report.matched, 2);

    let content = message("empty", "", "");
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);
    assert_eq!(report.matched, 1);
    assert_eq!(report.expunged, 1);
    assert_eq!(report.appended, 0);
    assert_eq!(uids(&index), vec![1]);
    assert_records_verify(&index, &content);
}

#[test]
fn test_header_without_blank_line_stays_in_its_message() {
    // The first message has no blank line, so its header would run into
    // the next message without a read limit.
    let content = format!("From a\nSubject: headless\n{}", m2());
    let (_tmp, _path, mut index) = setup(&content);
    let first = index.lookup(1).unwrap();
    assert_eq!(first.body_size, 0);
    assert_eq!(first.header_size, "Subject: headless".len() as u64);

    let report = fsck(&mut index);
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(report.matched, 2);
    assert_eq!(uids(&index), vec![1, 2]);
}

// ─── Local flag edits ───────────────────────────────────────────────

fn set_flags_locally(index: &mut MailIndex, seq: u32, flags: MailFlags) {
    index.set_lock(LockMode::Exclusive).unwrap();
    index.update_flags(seq, flags).unwrap();
    index.set_lock(LockMode::Unlocked).unwrap();
}

#[test]
fn test_local_flags_win_over_mailbox() {
    let (_tmp, _path, mut index) = setup(&[m1(), m2()].concat());
    set_flags_locally(&mut index, 1, MailFlags::SEEN | MailFlags::FLAGGED);

    let report = fsck(&mut index);
    assert!(report.dirty);
    let rec = index.lookup(1).unwrap();
    assert_eq!(rec.msg_flags, MailFlags::SEEN | MailFlags::FLAGGED);
    assert!(rec.is_dirty());
    assert!(index
        .header()
        .flags
        .contains(HeaderFlags::DIRTY_MESSAGES));
}

#[test]
fn test_local_flags_already_in_mailbox_are_clean() {
    let (_tmp, _path, mut index) = setup(&[m1(), m2()].concat());
    set_flags_locally(&mut index, 1, MailFlags::SEEN);
    assert!(index
        .header()
        .flags
        .contains(HeaderFlags::DIRTY_MESSAGES));

    let report = fsck(&mut index);
    assert!(!report.dirty);
    assert!(!index.lookup(1).unwrap().is_dirty());
    assert!(!index
        .header()
        .flags
        .contains(HeaderFlags::DIRTY_MESSAGES));
}

#[test]
fn test_mailbox_flags_refresh_clean_records() {
    let (tmp, _path, mut index) = setup(&[m1(), m2()].concat());

    let content = [m1(), message("two", "X-Status: AF\n", "body two\n")].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);
    assert!(!report.dirty);
    assert_eq!(
        index.lookup(2).unwrap().msg_flags,
        MailFlags::ANSWERED | MailFlags::FLAGGED
    );
}

// ─── Cached structure ───────────────────────────────────────────────

fn multipart(extra_headers: &str) -> String {
    message(
        "multi",
        &format!("{extra_headers}Content-Type: multipart/mixed; boundary=\"XX\"\n"),
        "--XX\nContent-Type: text/plain\n\npart one\n--XX\nContent-Type: text/plain\n\npart two\n--XX--\n",
    )
}

#[test]
fn test_header_growth_shifts_cached_parts() {
    let (tmp, _path, mut index) = setup(&[m1(), multipart("")].concat());
    let old = MessagePart::deserialize(
        index
            .lookup(2)
            .unwrap()
            .field(FieldType::MessagePart)
            .unwrap(),
    )
    .unwrap();
    assert_eq!(old.parts().len(), 3);

    let added = "X-Added: yes\n";
    let content = [m1(), multipart(added)].concat();
    write_mbox(tmp.path(), &content);
    let report = fsck(&mut index);
    assert_eq!(report.resized, 1);
    assert_eq!(report.expunged, 0);

    let new = MessagePart::deserialize(
        index
            .lookup(2)
            .unwrap()
            .field(FieldType::MessagePart)
            .unwrap(),
    )
    .unwrap();
    for (old_part, new_part) in old.parts().iter().zip(new.parts()).skip(1) {
        assert_eq!(
            new_part.physical_pos,
            old_part.physical_pos + added.len() as u64
        );
    }

    // Same result as indexing the edited mailbox from scratch.
    let (_tmp2, _path2, fresh) = setup(&content);
    assert_eq!(
        index.lookup(2).unwrap().field(FieldType::MessagePart),
        fresh.lookup(2).unwrap().field(FieldType::MessagePart)
    );
}

#[test]
fn test_bad_part_data_aborts_the_pass() {
    let (tmp, path, mut index) = setup(&[m1(), m2()].concat());
    index.set_lock(LockMode::Exclusive).unwrap();
    let mut update = index.update_begin(2).unwrap();
    update.set_field(FieldType::MessagePart, vec![0xff]);
    index.update_end(update).unwrap();
    index.set_lock(LockMode::Unlocked).unwrap();
    let before = index.records().to_vec();

    // A flag header changes the header size, so the parts must be redone.
    write_mbox(tmp.path(), &[m1(), message("two", "Status: RO\n", "body two\n")].concat());
    let err = fsck_mailbox(&mut index, &Config::default()).unwrap_err();
    assert!(matches!(err, MboxError::PartUpdate(_)), "{err:?}");

    assert_eq!(index.records(), &before[..]);
    assert_eq!(index.lock_mode(), LockMode::Unlocked);
    assert!(index.header().flags.contains(HeaderFlags::FSCK));
    // The mailbox lock was released.
    let file = File::open(&path).unwrap();
    MboxLock::acquire(&file, &path).unwrap().release().unwrap();
}

// ─── Locking and errors ─────────────────────────────────────────────

#[test]
fn test_locked_mailbox_fails() {
    let (_tmp, path, mut index) = setup(&m1());
    let file = File::open(&path).unwrap();
    let lock = MboxLock::acquire(&file, &path).unwrap();

    let err = fsck_mailbox(&mut index, &Config::default()).unwrap_err();
    assert!(matches!(err, MboxError::LockFailed { .. }), "{err:?}");
    assert_eq!(index.lock_mode(), LockMode::Unlocked);

    lock.release().unwrap();
    assert!(fsck(&mut index).is_noop());
}

#[test]
fn test_missing_mailbox() {
    let tmp = tempfile::tempdir().unwrap();
    let mut index = MailIndex::new(tmp.path().join("nope"));
    let err = fsck_mailbox(&mut index, &Config::default()).unwrap_err();
    assert!(matches!(err, MboxError::FileNotFound(_)), "{err:?}");
}

// ─── Persistence ────────────────────────────────────────────────────

#[test]
fn test_open_index_reconciles_changed_mailbox() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_mbox(tmp.path(), &[m1(), m2()].concat());
    let cfg = Config::default();

    let index = persist::open_index(&path, &cfg).unwrap();
    assert_eq!(index.len(), 2);
    persist::save_index(&index, &cfg).unwrap();

    let index = persist::open_index(&path, &cfg).unwrap();
    assert_eq!(uids(&index), vec![1, 2]);

    write_mbox(tmp.path(), &[m1(), m2(), m3()].concat());
    let mut lazy = cfg.clone();
    lazy.index.fsck_on_open = false;
    assert_eq!(persist::open_index(&path, &lazy).unwrap().len(), 2);

    let index = persist::open_index(&path, &cfg).unwrap();
    assert_eq!(uids(&index), vec![1, 2, 3]);
}
