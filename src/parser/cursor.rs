//! Buffered byte cursor over an MBOX file.
//!
//! Unlike [`std::io::BufReader`], the cursor keeps an absolute offset that
//! can be moved backwards and forwards freely, and supports a temporary read
//! limit so that a parser can be fenced in front of a known boundary.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{MboxError, Result};

/// Smallest read chunk accepted, regardless of configuration.
const MIN_CHUNK_SIZE: usize = 4096;

/// Random-access byte cursor with read-ahead and an optional read limit.
pub struct MboxCursor<R> {
    inner: R,
    size: u64,
    buf: Vec<u8>,
    /// File offset of `buf[0]`.
    buf_start: u64,
    offset: u64,
    limit: Option<u64>,
    chunk_size: usize,
}

impl MboxCursor<File> {
    /// Open an MBOX file for scanning.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                MboxError::FileNotFound(path.to_path_buf())
            } else {
                MboxError::io(path, e)
            }
        })?;
        Self::new(file, chunk_size).map_err(|e| MboxError::io(path, e))
    }
}

impl<R: Read + Seek> MboxCursor<R> {
    /// Wrap a reader. The total size is captured once, here.
    pub fn new(mut inner: R, chunk_size: usize) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            size,
            buf: Vec::new(),
            buf_start: 0,
            offset: 0,
            limit: None,
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
        })
    }

    /// Underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Current absolute offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total size of the input in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Effective end of input: the read limit if one is set, else the size.
    fn end(&self) -> u64 {
        self.limit.map_or(self.size, |limit| limit.min(self.size))
    }

    /// Whether the cursor has reached the end of input (or the read limit).
    pub fn at_eof(&self) -> bool {
        self.offset >= self.end()
    }

    /// Move to an absolute offset, clamped to the input size.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset.min(self.size);
    }

    /// Advance by `n` bytes, never past the end of input.
    pub fn skip(&mut self, n: usize) {
        self.offset = (self.offset + n as u64).min(self.end());
    }

    /// Set or clear the read limit. Bytes at or beyond the limit are hidden
    /// from [`read_data`](Self::read_data) while it is set.
    pub fn set_read_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    /// Return the bytes available from the current offset.
    ///
    /// Blocks until at least `min` bytes are buffered or the end of input is
    /// reached. More than `min` bytes may be returned. The cursor does not
    /// move; call [`skip`](Self::skip) to consume.
    pub fn read_data(&mut self, min: usize) -> io::Result<&[u8]> {
        let end = self.end();
        let wanted = (self.offset + min.max(1) as u64).min(end);

        let buf_end = self.buf_start + self.buf.len() as u64;
        if self.offset < self.buf_start || self.offset > buf_end {
            self.buf.clear();
            self.buf_start = self.offset;
        } else if (self.offset - self.buf_start) as usize >= self.chunk_size {
            // Drop consumed bytes so the buffer doesn't grow without bound.
            let consumed = (self.offset - self.buf_start) as usize;
            self.buf.drain(..consumed);
            self.buf_start = self.offset;
        }

        while self.buf_start + (self.buf.len() as u64) < wanted {
            let read_from = self.buf_start + self.buf.len() as u64;
            self.inner.seek(SeekFrom::Start(read_from))?;
            let old_len = self.buf.len();
            self.buf.resize(old_len + self.chunk_size, 0);
            let n = loop {
                match self.inner.read(&mut self.buf[old_len..]) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.buf.truncate(old_len);
                        return Err(e);
                    }
                }
            };
            self.buf.truncate(old_len + n);
            if n == 0 {
                // File shrank since open; treat as end of input.
                break;
            }
        }

        let start = (self.offset - self.buf_start) as usize;
        let available = (self.buf_start + self.buf.len() as u64).min(end);
        let stop = (available.saturating_sub(self.buf_start) as usize).max(start);
        Ok(&self.buf[start..stop])
    }

    /// Append one line (including its `\n`, if any) to `line`.
    ///
    /// Returns `false` when nothing was left to read.
    pub fn read_line_into(&mut self, line: &mut Vec<u8>) -> io::Result<bool> {
        let mut read_any = false;
        loop {
            let data = self.read_data(1)?;
            if data.is_empty() {
                return Ok(read_any);
            }
            read_any = true;
            match memchr_newline(data) {
                Some(pos) => {
                    line.extend_from_slice(&data[..=pos]);
                    self.skip(pos + 1);
                    return Ok(true);
                }
                None => {
                    let n = data.len();
                    line.extend_from_slice(data);
                    self.skip(n);
                }
            }
        }
    }

    /// Read `len` bytes starting at `start` without moving the cursor.
    ///
    /// Fewer bytes are returned if the input ends early.
    pub fn read_range(&mut self, start: u64, len: u64) -> io::Result<Vec<u8>> {
        let saved_offset = self.offset;
        let saved_limit = self.limit.take();
        self.seek(start);

        let mut out = Vec::with_capacity(len as usize);
        while (out.len() as u64) < len {
            let data = self.read_data(1)?;
            if data.is_empty() {
                break;
            }
            let take = data.len().min((len - out.len() as u64) as usize);
            out.extend_from_slice(&data[..take]);
            self.skip(take);
        }

        self.limit = saved_limit;
        self.offset = saved_offset;
        Ok(out)
    }
}

/// Fast newline search (equivalent to memchr for `\n`).
#[inline]
pub(crate) fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}
