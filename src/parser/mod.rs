//! Mailbox scanning: byte cursor, boundary primitives, and header tokenizer.

pub mod cursor;
pub mod header;
pub mod mbox;
