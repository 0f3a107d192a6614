//! Index data model: flags, records, and cached message structure.

pub mod flags;
pub mod part;
pub mod record;
