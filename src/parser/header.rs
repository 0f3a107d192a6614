//! Message header tokenizer and the per-message header context.
//!
//! The tokenizer streams unfolded header fields to a callback and measures
//! the physical size of the header block. [`HeaderContext`] is the callback
//! used by the index: it digests the identity fields and picks up the
//! flags stored in `Status:` / `X-Status:`.

use std::io::{self, Read, Seek};

use crate::model::flags::MailFlags;
use crate::model::part::MessageSize;
use crate::parser::cursor::MboxCursor;

/// Length of the header identity digest.
pub const DIGEST_LEN: usize = 16;

/// Fields whose values identify a message. Everything else, notably the
/// flag-bearing fields rewritten by mail clients, is left out of the digest.
const IDENTITY_FIELDS: &[&str] = &[
    "received",
    "date",
    "message-id",
    "from",
    "to",
    "cc",
    "subject",
];

/// One unfolded header field.
#[derive(Debug)]
pub struct HeaderField<'a> {
    /// Field name as it appears in the message (case preserved).
    pub name: &'a [u8],
    /// Raw value after the colon. Continuation lines are joined with `\n`.
    pub value: &'a [u8],
}

impl HeaderField<'_> {
    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

/// Parse a header block starting at the cursor.
///
/// Stops after the empty line that ends the header, or at end of input
/// (including the read limit). The returned size covers every consumed
/// byte, the terminating empty line included.
pub fn parse_header<R: Read + Seek>(
    cursor: &mut MboxCursor<R>,
    on_field: &mut dyn FnMut(&HeaderField<'_>),
) -> io::Result<MessageSize> {
    let mut size = MessageSize::default();
    let mut line: Vec<u8> = Vec::with_capacity(256);
    let mut name: Vec<u8> = Vec::new();
    let mut value: Vec<u8> = Vec::new();
    let mut have_field = false;

    loop {
        line.clear();
        if !cursor.read_line_into(&mut line)? {
            break;
        }
        size.add_line(&line);

        let content = strip_eol(&line);
        if content.is_empty() && line.ends_with(b"\n") {
            break;
        }

        if matches!(content.first(), Some(b' ' | b'\t')) {
            if have_field {
                value.push(b'\n');
                value.extend_from_slice(content);
            }
            continue;
        }

        if have_field {
            on_field(&HeaderField {
                name: &name,
                value: &value,
            });
        }

        match content.iter().position(|&b| b == b':') {
            Some(colon) => {
                name.clear();
                name.extend_from_slice(content[..colon].trim_ascii());
                value.clear();
                value.extend_from_slice(&content[colon + 1..]);
                have_field = true;
            }
            // Garbage line without a colon: measured, otherwise ignored.
            None => have_field = false,
        }
    }

    if have_field {
        on_field(&HeaderField {
            name: &name,
            value: &value,
        });
    }

    Ok(size)
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Collapse folding and runs of whitespace into single spaces.
fn canonical_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for word in value
        .split(|b| b.is_ascii_whitespace())
        .filter(|w| !w.is_empty())
    {
        if !out.is_empty() {
            out.push(b' ');
        }
        out.extend_from_slice(word);
    }
    out
}

/// Accumulates the identity digest and the mbox flags of one message.
pub struct HeaderContext {
    md5: md5::Context,
    flags: MailFlags,
}

/// What a header pass produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSummary {
    pub digest: [u8; DIGEST_LEN],
    pub flags: MailFlags,
}

impl Default for HeaderContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderContext {
    pub fn new() -> Self {
        Self {
            md5: md5::Context::new(),
            flags: MailFlags::empty(),
        }
    }

    /// Feed one header field.
    pub fn field(&mut self, field: &HeaderField<'_>) {
        if field.is("status") {
            self.flags |= MailFlags::from_status(field.value);
        } else if field.is("x-status") {
            self.flags |= MailFlags::from_x_status(field.value);
        }

        if IDENTITY_FIELDS.iter().any(|name| field.is(name)) {
            self.md5.consume(field.name.to_ascii_lowercase());
            self.md5.consume(b":");
            self.md5.consume(canonical_value(field.value));
            self.md5.consume(b"\n");
        }
    }

    pub fn finish(self) -> HeaderSummary {
        HeaderSummary {
            digest: self.md5.compute().0,
            flags: self.flags,
        }
    }
}

/// Parse the header at the cursor through a fresh [`HeaderContext`].
pub fn parse_message_header<R: Read + Seek>(
    cursor: &mut MboxCursor<R>,
) -> io::Result<(MessageSize, HeaderSummary)> {
    let mut ctx = HeaderContext::new();
    let size = parse_header(cursor, &mut |field| ctx.field(field))?;
    Ok((size, ctx.finish()))
}
