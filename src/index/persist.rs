//! Index persistence and mailbox change detection.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{self, Config};
use crate::error::{MboxError, Result};
use crate::index::format::{IndexHeader, HASH_PREFIX_LEN, HEADER_SIZE};
use crate::index::fsck::fsck_mailbox;
use crate::index::store::MailIndex;
use crate::model::flags::HeaderFlags;
use crate::model::record::IndexRecord;

/// Load the index of a mailbox, reconciling it first when needed.
///
/// A missing or unreadable index yields a fresh one flagged for fsck, so the
/// first reconciliation indexes every message. Reconciliation runs when the
/// index is flagged, or when `fsck_on_open` is set and the mailbox changed
/// since the index was last synchronized.
pub fn open_index(mbox_path: &Path, config: &Config) -> anyhow::Result<MailIndex> {
    let mut index = match load_index(mbox_path, config)? {
        Some(index) => index,
        None => {
            debug!(path = %mbox_path.display(), "No usable index, starting empty");
            let mut index = MailIndex::new(mbox_path);
            index.set_header_flags(HeaderFlags::FSCK);
            index
        }
    };

    let flagged = index.header().flags.contains(HeaderFlags::FSCK);
    if flagged || (config.index.fsck_on_open && mailbox_changed(&index)?) {
        info!(path = %mbox_path.display(), flagged, "Reconciling index with mailbox");
        fsck_mailbox(&mut index, config)?;
    }
    Ok(index)
}

/// Attempt to load an existing index. Returns `None` if the index is missing or invalid.
pub fn load_index(mbox_path: &Path, config: &Config) -> anyhow::Result<Option<MailIndex>> {
    let idx_path = index_path_for(mbox_path, config);
    if !idx_path.exists() {
        let cache_path = cache_index_path_for(mbox_path, config);
        if cache_path.exists() {
            return load_index_from_file(&cache_path, mbox_path);
        }
        return Ok(None);
    }
    load_index_from_file(&idx_path, mbox_path)
}

/// Load and validate an index from a specific file.
fn load_index_from_file(idx_path: &Path, mbox_path: &Path) -> anyhow::Result<Option<MailIndex>> {
    let data = std::fs::read(idx_path).map_err(|e| MboxError::io(idx_path, e))?;

    if data.len() < HEADER_SIZE {
        debug!("Index file too small");
        return Ok(None);
    }

    let header: IndexHeader =
        bincode::deserialize(&data[..HEADER_SIZE]).map_err(|e| MboxError::InvalidIndex {
            path: idx_path.to_path_buf(),
            reason: format!("Header deserialization failed: {e}"),
        })?;

    if let Err(reason) = header.validate() {
        debug!(reason = %reason, "Index header invalid");
        return Ok(None);
    }

    let records: Vec<IndexRecord> =
        bincode::deserialize(&data[HEADER_SIZE..]).map_err(|e| MboxError::InvalidIndex {
            path: idx_path.to_path_buf(),
            reason: format!("Record deserialization failed: {e}"),
        })?;

    let mut index = MailIndex::from_parts(mbox_path.to_path_buf(), header, records);
    if index.header().messages_count as usize != index.len() {
        debug!("Message count mismatch, index needs fsck");
        index.set_header_flags(HeaderFlags::FSCK);
    }
    Ok(Some(index))
}

/// Write the index to disk. Returns the path written.
pub fn save_index(index: &MailIndex, config: &Config) -> anyhow::Result<PathBuf> {
    let header_bytes = bincode::serialize(index.header())?;
    let records_bytes = bincode::serialize(index.records())?;

    // Pad header to HEADER_SIZE
    let mut padded_header = vec![0u8; HEADER_SIZE];
    let copy_len = header_bytes.len().min(HEADER_SIZE);
    padded_header[..copy_len].copy_from_slice(&header_bytes[..copy_len]);

    // Try writing next to the MBOX file first
    let idx_path = index_path_for(index.mbox_path(), config);
    match write_index_to_file(&idx_path, &padded_header, &records_bytes) {
        Ok(()) => {
            info!(path = %idx_path.display(), "Index written");
            return Ok(idx_path);
        }
        Err(e) => {
            debug!(error = %e, "Cannot write index next to MBOX, trying cache dir");
        }
    }

    // Fallback: write to cache directory
    let cache_path = cache_index_path_for(index.mbox_path(), config);
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_index_to_file(&cache_path, &padded_header, &records_bytes)?;
    info!(path = %cache_path.display(), "Index written to cache");
    Ok(cache_path)
}

/// Write header + records to a file.
fn write_index_to_file(path: &Path, header: &[u8], records: &[u8]) -> anyhow::Result<()> {
    let mut file = File::create(path).map_err(|e| MboxError::io(path, e))?;
    file.write_all(header).map_err(|e| MboxError::io(path, e))?;
    file.write_all(records)
        .map_err(|e| MboxError::io(path, e))?;
    file.flush().map_err(|e| MboxError::io(path, e))?;
    Ok(())
}

/// Size, modification time and leading-bytes hash of the mailbox.
fn mailbox_fingerprint(mbox_path: &Path) -> Result<(u64, i64, [u8; 32])> {
    let meta = std::fs::metadata(mbox_path).map_err(|e| MboxError::io(mbox_path, e))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let hash = sha256_first_n(mbox_path, HASH_PREFIX_LEN)?;
    Ok((meta.len(), mtime, hash))
}

/// Record the current state of the mailbox in the index header.
pub fn stamp_mailbox(index: &mut MailIndex) -> Result<()> {
    let (size, mtime, hash) = mailbox_fingerprint(index.mbox_path())?;
    let header = index.header_mut();
    header.mbox_file_size = size;
    header.mbox_modified_time = mtime;
    header.sha256_first_4kb = hash;
    Ok(())
}

/// Whether the mailbox differs from the state recorded by [`stamp_mailbox`].
pub fn mailbox_changed(index: &MailIndex) -> Result<bool> {
    let (size, mtime, hash) = mailbox_fingerprint(index.mbox_path())?;
    let header = index.header();
    let changed = header.mbox_file_size != size
        || header.mbox_modified_time != mtime
        || header.sha256_first_4kb != hash;
    if changed {
        debug!(path = %index.mbox_path().display(), "MBOX changed since last sync");
    }
    Ok(changed)
}

/// Compute SHA-256 of the first `n` bytes of a file.
fn sha256_first_n(path: &Path, n: usize) -> Result<[u8; 32]> {
    let file = File::open(path).map_err(|e| MboxError::io(path, e))?;
    let mut buf = Vec::with_capacity(n);
    file.take(n as u64)
        .read_to_end(&mut buf)
        .map_err(|e| MboxError::io(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    Ok(hasher.finalize().into())
}

/// Primary index path: hidden file next to the MBOX, or inside
/// `index.index_dir` when configured.
///
/// Example: `/data/mail.mbox` → `/data/.mail.mbox.mboxstore.idx`
pub fn index_path_for(mbox_path: &Path, config: &Config) -> PathBuf {
    let filename = mbox_path.file_name().unwrap_or_default().to_string_lossy();
    let idx_name = format!(".{filename}.mboxstore.idx");
    match config.index.index_dir {
        Some(ref dir) => dir.join(idx_name),
        None => mbox_path.with_file_name(idx_name),
    }
}

/// Fallback index path inside the cache directory.
///
/// Example: `~/.cache/mboxstore/<sha256_of_path>.idx`
pub fn cache_index_path_for(mbox_path: &Path, config: &Config) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(mbox_path.to_string_lossy().as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    config::cache_dir(config).join(format!("{hash}.idx"))
}

/// Return the size in bytes of the index file for the given MBOX (0 if missing).
pub fn index_file_size(mbox_path: &Path, config: &Config) -> u64 {
    let idx_path = index_path_for(mbox_path, config);
    std::fs::metadata(&idx_path)
        .or_else(|_| std::fs::metadata(cache_index_path_for(mbox_path, config)))
        .map(|m| m.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::store::LockMode;
    use crate::model::flags::MailFlags;

    #[test]
    fn test_index_path_for() {
        let cfg = Config::default();
        assert_eq!(
            index_path_for(Path::new("/data/mail.mbox"), &cfg),
            PathBuf::from("/data/.mail.mbox.mboxstore.idx")
        );
        let mut cfg = Config::default();
        cfg.index.index_dir = Some(PathBuf::from("/var/idx"));
        assert_eq!(
            index_path_for(Path::new("/data/mail.mbox"), &cfg),
            PathBuf::from("/var/idx/.mail.mbox.mboxstore.idx")
        );
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let mbox = tmp.path().join("inbox");
        std::fs::write(&mbox, b"From a\n\nbody\n").unwrap();
        let cfg = Config::default();

        let mut index = MailIndex::new(&mbox);
        index.set_lock(LockMode::Exclusive).unwrap();
        index
            .append_record(IndexRecord::new(MailFlags::SEEN, 1, 4))
            .unwrap();
        stamp_mailbox(&mut index).unwrap();
        let written = save_index(&index, &cfg).unwrap();
        assert_eq!(written, index_path_for(&mbox, &cfg));

        let loaded = load_index(&mbox, &cfg).unwrap().expect("index loads");
        assert_eq!(loaded.records(), index.records());
        assert_eq!(loaded.header(), index.header());
        assert!(!mailbox_changed(&loaded).unwrap());

        std::fs::write(&mbox, b"From a\n\nbody changed\n").unwrap();
        assert!(mailbox_changed(&loaded).unwrap());
    }

    #[test]
    fn test_load_rejects_foreign_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mbox = tmp.path().join("inbox");
        std::fs::write(&mbox, b"").unwrap();
        let cfg = Config::default();
        std::fs::write(index_path_for(&mbox, &cfg), vec![0u8; HEADER_SIZE + 8]).unwrap();
        assert!(load_index(&mbox, &cfg).unwrap().is_none());
    }
}
