//! Cached structural breakdown of a message.
//!
//! A [`MessagePart`] lists the parts of a message in pre-order, root first,
//! with positions relative to the start of the message header. It is
//! cached in the index so that content parsers don't need to re-scan the
//! mailbox, which also means it must be re-derived whenever the header of
//! the message changes size.

use mail_parser::{MessageParser, MessagePart as MimePart, PartType};
use serde::{Deserialize, Serialize};

use crate::error::{MboxError, Result};

/// Size of a header or body block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSize {
    /// Bytes as stored in the file.
    pub physical_size: u64,
    /// Bytes with every bare `\n` counted as `\r\n`.
    pub virtual_size: u64,
    /// Number of line terminators.
    pub lines: u32,
}

impl MessageSize {
    /// Account for one line (with or without its terminator).
    pub fn add_line(&mut self, line: &[u8]) {
        let len = line.len() as u64;
        self.physical_size += len;
        self.virtual_size += len;
        if line.ends_with(b"\n") {
            self.lines += 1;
            if !line.ends_with(b"\r\n") {
                self.virtual_size += 1;
            }
        }
    }

    /// Measure a whole block.
    pub fn measure(data: &[u8]) -> Self {
        let mut size = Self::default();
        for line in data.split_inclusive(|&b| b == b'\n') {
            size.add_line(line);
        }
        size
    }
}

/// One entry of the part list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    /// Offset of the part's header, relative to the message header start.
    pub physical_pos: u64,
    pub header: MessageSize,
    pub body: MessageSize,
    /// Number of direct children following this entry.
    pub children: u32,
}

/// Flattened part tree, root first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePart {
    parts: Vec<PartEntry>,
}

impl MessagePart {
    /// A message with no sub-parts.
    pub fn single(header: MessageSize, body: MessageSize) -> Self {
        Self {
            parts: vec![PartEntry {
                physical_pos: 0,
                header,
                body,
                children: 0,
            }],
        }
    }

    /// Build the part list of a raw message: header and body, without the
    /// `From ` line.
    ///
    /// The root keeps `header` as measured by the header tokenizer. The
    /// top-level parts of a multipart body are located by the MIME parser.
    pub fn build(header: MessageSize, message: &[u8]) -> Self {
        let body_start = (header.physical_size as usize).min(message.len());
        let mut part = Self::single(header, MessageSize::measure(&message[body_start..]));

        let Some(parsed) = MessageParser::default().parse(message) else {
            return part;
        };
        let Some(PartType::Multipart(ids)) = parsed.parts.first().map(|root| &root.body) else {
            return part;
        };
        let children: Vec<PartEntry> = ids
            .iter()
            .filter_map(|&id| parsed.parts.get(id))
            .filter_map(|child| child_entry(message, child))
            .collect();
        part.parts[0].children = children.len() as u32;
        part.parts.extend(children);
        part
    }

    pub fn root(&self) -> Option<&PartEntry> {
        self.parts.first()
    }

    pub fn parts(&self) -> &[PartEntry] {
        &self.parts
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MboxError::PartUpdate(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let part: Self =
            bincode::deserialize(data).map_err(|e| MboxError::PartUpdate(e.to_string()))?;
        if part.parts.is_empty() {
            return Err(MboxError::PartUpdate("no root part".into()));
        }
        Ok(part)
    }
}

/// Re-derive serialized part data for a new root header size.
///
/// Works on a copy: the input buffer is left untouched. Every non-root
/// part is shifted by the header size difference; a shift that would move
/// a part in front of the root's body fails the whole update.
pub fn update_header_size(data: &[u8], hdr_size: &MessageSize) -> Result<Vec<u8>> {
    let mut part = MessagePart::deserialize(data)?;

    let old_header = part.parts[0].header.physical_size;
    let first_pos = part.parts[0].physical_pos;
    let new_body_start = first_pos
        .checked_add(hdr_size.physical_size)
        .ok_or_else(|| {
            MboxError::PartUpdate(format!(
                "header size {} overflows the root part",
                hdr_size.physical_size
            ))
        })?;
    part.parts[0].header = *hdr_size;

    if hdr_size.physical_size != old_header {
        for entry in part.parts.iter_mut().skip(1) {
            let shifted = entry
                .physical_pos
                .checked_add(hdr_size.physical_size)
                .and_then(|pos| pos.checked_sub(old_header))
                .filter(|&pos| entry.physical_pos >= first_pos && pos >= new_body_start)
                .ok_or_else(|| {
                    MboxError::PartUpdate(format!(
                        "part at {} can't move by header size change {} -> {}",
                        entry.physical_pos, old_header, hdr_size.physical_size
                    ))
                })?;
            entry.physical_pos = shifted;
        }
    }

    part.serialize()
}

fn child_entry(message: &[u8], part: &MimePart<'_>) -> Option<PartEntry> {
    let start = part.offset_header as usize;
    let body = part.offset_body as usize;
    let end = part.offset_end as usize;
    Some(PartEntry {
        physical_pos: start as u64,
        header: MessageSize::measure(message.get(start..body)?),
        body: MessageSize::measure(message.get(body..end)?),
        children: 0,
    })
}
