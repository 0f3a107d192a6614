//! MBOX boundary scanning.
//!
//! Small forward-only primitives over an [`MboxCursor`] that recognise
//! separator lines, blank-line runs and line terminators. They never
//! interpret message content beyond the `From ` prefix.

use std::io::{self, Read, Seek};

use crate::parser::cursor::{memchr_newline, MboxCursor};

/// Every message starts with a line beginning with these five bytes.
pub const FROM_PREFIX: &[u8; 5] = b"From ";

/// Check whether a line is an MBOX separator (`From ` at the start).
pub fn is_mbox_separator(line: &[u8]) -> bool {
    line.starts_with(FROM_PREFIX)
}

/// Skip past the next `\n`, or to end of input if there is none.
pub fn skip_line<R: Read + Seek>(cursor: &mut MboxCursor<R>) -> io::Result<()> {
    loop {
        let data = cursor.read_data(1)?;
        if data.is_empty() {
            return Ok(());
        }
        match memchr_newline(data) {
            Some(pos) => {
                cursor.skip(pos + 1);
                return Ok(());
            }
            None => {
                let n = data.len();
                cursor.skip(n);
            }
        }
    }
}

/// Skip a run of zero or more empty lines (`\n` or `\r\n`).
pub fn skip_empty_lines<R: Read + Seek>(cursor: &mut MboxCursor<R>) -> io::Result<()> {
    loop {
        let data = cursor.read_data(2)?;
        if data.first() == Some(&b'\n') {
            cursor.skip(1);
        } else if data.starts_with(b"\r\n") {
            cursor.skip(2);
        } else {
            return Ok(());
        }
    }
}

/// Consume exactly one line terminator (`\n` or `\r\n`).
///
/// Returns `false` if something other than a terminator follows and the
/// cursor is not at end of input.
pub fn skip_crlf<R: Read + Seek>(cursor: &mut MboxCursor<R>) -> io::Result<bool> {
    let data = cursor.read_data(2)?;
    if data.is_empty() {
        return Ok(true);
    }
    if data[0] == b'\n' {
        cursor.skip(1);
        Ok(true)
    } else if data.starts_with(b"\r\n") {
        cursor.skip(2);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Move to the end of the current message.
///
/// Stops at the `[\r]\n` that precedes the next `From ` line; that terminator
/// belongs to the separator, not to the message. Without a following
/// separator, stops at end of input minus one trailing line terminator.
/// The line the cursor starts on is never treated as a separator.
pub fn skip_message<R: Read + Seek>(cursor: &mut MboxCursor<R>) -> io::Result<()> {
    let origin = cursor.offset();
    let mut prev_cr = false;

    loop {
        let data = cursor.read_data(1)?;
        if data.is_empty() {
            break;
        }
        let Some(pos) = memchr_newline(data) else {
            prev_cr = data.last() == Some(&b'\r');
            let n = data.len();
            cursor.skip(n);
            continue;
        };
        let cr_before = if pos > 0 { data[pos - 1] == b'\r' } else { prev_cr };
        cursor.skip(pos);

        let newline_offset = cursor.offset();
        let ahead = cursor.read_data(1 + FROM_PREFIX.len())?;
        if ahead.len() > FROM_PREFIX.len() && is_mbox_separator(&ahead[1..]) {
            let boundary = if cr_before && newline_offset > origin {
                newline_offset - 1
            } else {
                newline_offset
            };
            cursor.seek(boundary);
            return Ok(());
        }
        prev_cr = false;
        cursor.skip(1);
    }

    // No further separator: drop one trailing terminator.
    let end = cursor.offset();
    let tail_start = end.saturating_sub(2).max(origin);
    cursor.seek(tail_start);
    let tail = cursor.read_data(2)?;
    let tail = &tail[..tail.len().min((end - tail_start) as usize)];
    let trim = if tail.ends_with(b"\r\n") {
        2
    } else if tail.ends_with(b"\n") {
        1
    } else {
        0
    };
    cursor.seek(end - trim);
    Ok(())
}
