//! Indexing of messages the index doesn't know about yet.

use std::io::{Read, Seek};

use tracing::{debug, warn};

use crate::config::PerformanceConfig;
use crate::error::{MboxError, Result};
use crate::index::store::MailIndex;
use crate::model::part::MessagePart;
use crate::model::record::{encode_location, FieldType, IndexRecord};
use crate::parser::cursor::MboxCursor;
use crate::parser::header::parse_message_header;
use crate::parser::mbox::{
    is_mbox_separator, skip_empty_lines, skip_line, skip_message, FROM_PREFIX,
};

/// Create records for every message from the cursor to the end of input.
///
/// The cursor may sit on a message's `From ` line or on the line terminator
/// in front of it. Returns the number of records created.
pub fn append_messages<R: Read + Seek>(
    index: &mut MailIndex,
    cursor: &mut MboxCursor<R>,
    perf: &PerformanceConfig,
) -> Result<usize> {
    let path = index.mbox_path().to_path_buf();
    let io_err = |e| MboxError::io(&path, e);
    let mut count = 0usize;

    loop {
        skip_empty_lines(cursor).map_err(io_err)?;
        if cursor.at_eof() {
            break;
        }

        let from_offset = cursor.offset();
        if !is_mbox_separator(cursor.read_data(FROM_PREFIX.len()).map_err(io_err)?) {
            warn!(offset = from_offset, "Expected a From line while appending");
            return Err(MboxError::InvalidMbox(path.clone()));
        }
        skip_line(cursor).map_err(io_err)?;
        let header_offset = cursor.offset();

        skip_message(cursor).map_err(io_err)?;
        let end_offset = cursor.offset();
        cursor.seek(header_offset);

        cursor.set_read_limit(Some(end_offset));
        let parsed = parse_message_header(cursor);
        cursor.set_read_limit(None);
        let (hdr_size, summary) = parsed.map_err(io_err)?;

        let body_offset = cursor.offset();
        let body_size = end_offset - body_offset;

        let mut record = IndexRecord::new(summary.flags, hdr_size.physical_size, body_size);
        record.set_field(FieldType::Md5, summary.digest.to_vec());
        record.set_field(FieldType::Location, encode_location(header_offset));
        if body_size <= perf.max_message_size as u64 {
            let message = cursor
                .read_range(header_offset, end_offset - header_offset)
                .map_err(io_err)?;
            let part = MessagePart::build(hdr_size, &message);
            record.set_field(FieldType::MessagePart, part.serialize()?);
        } else {
            debug!(
                offset = header_offset,
                body_size, "Body too large, not caching message parts"
            );
        }

        let seq = index.append_record(record)?;
        debug!(seq, offset = header_offset, body_size, "Appended message");
        count += 1;
        cursor.seek(end_offset);
    }

    Ok(count)
}
