//! `mboxstore`: a mail store that keeps a flat MBOX file and a binary
//! secondary index in agreement.
//!
//! The index caches per-message offsets, sizes, flags and parse results.
//! When the mailbox is modified behind the index's back, [`index::fsck`]
//! re-derives a correct index from the file without touching the file.

pub mod config;
pub mod error;
pub mod index;
pub mod lock;
pub mod model;
pub mod parser;
