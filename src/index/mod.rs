//! Secondary index: storage engine, persistence, append and reconciliation.

pub mod append;
pub mod check;
pub mod format;
pub mod fsck;
pub mod persist;
pub mod store;
