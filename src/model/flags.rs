//! Message, record and index-header flag sets.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// IMAP system flags of a message, as mirrored in `Status:`/`X-Status:`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MailFlags: u32 {
        const SEEN = 1;
        const ANSWERED = 1 << 1;
        const FLAGGED = 1 << 2;
        const DELETED = 1 << 3;
        const DRAFT = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Per-record bookkeeping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct IndexFlags: u32 {
        /// Flags were changed locally and not yet written back to the mailbox.
        const DIRTY = 1;
    }
}

bitflags::bitflags! {
    /// Index-wide flags stored in the index header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HeaderFlags: u32 {
        /// Some record carries flags the mailbox file doesn't reflect yet.
        const DIRTY_MESSAGES = 1;
        /// The index must be reconciled with the mailbox before use.
        const FSCK = 1 << 1;
    }
}

/// Letter used for each flag in `Status:`-style fields and on the CLI.
const FLAG_LETTERS: &[(u8, MailFlags)] = &[
    (b'R', MailFlags::SEEN),
    (b'A', MailFlags::ANSWERED),
    (b'F', MailFlags::FLAGGED),
    (b'D', MailFlags::DELETED),
    (b'T', MailFlags::DRAFT),
];

impl MailFlags {
    /// Flags carried by a `Status:` value. `O` (old) carries no flag.
    pub fn from_status(value: &[u8]) -> Self {
        Self::from_letters(value) & !Self::DRAFT
    }

    /// Flags carried by an `X-Status:` value.
    pub fn from_x_status(value: &[u8]) -> Self {
        Self::from_letters(value)
    }

    /// Parse any combination of `RAFDT`; unknown letters are ignored.
    pub fn from_letters(value: &[u8]) -> Self {
        let mut flags = Self::empty();
        for &b in value {
            if let Some((_, flag)) = FLAG_LETTERS
                .iter()
                .find(|(letter, _)| *letter == b.to_ascii_uppercase())
            {
                flags |= *flag;
            }
        }
        flags
    }

    /// Render as letters, in `RAFDT` order.
    pub fn to_letters(self) -> String {
        FLAG_LETTERS
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(letter, _)| *letter as char)
            .collect()
    }
}
