//! Growable byte buffer with a reserved prefix for in-place header
//! prepending (C3), plus big-endian integer helpers.
//!
//! Layout: `[0, read_idx)` reserved prefix, `[read_idx, write_idx)`
//! readable window, `[write_idx, len)` writable window. The reserved
//! prefix starts at [`crate::config::IO_BUFFER_RESERVED_PREFIX`] bytes so a
//! length header up to 8 bytes can be prepended without a copy.

use std::os::unix::io::RawFd;

use crate::config::{IO_BUFFER_INITIAL_LEN, IO_BUFFER_RESERVED_PREFIX, SCATTER_READ_SCRATCH_LEN};

/// A contiguous growable byte buffer used for both the read and write side
/// of a [`crate::connection::Connection`].
#[derive(Debug)]
pub struct IoBuffer {
    data: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for IoBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::with_capacity(IO_BUFFER_INITIAL_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(IO_BUFFER_RESERVED_PREFIX);
        IoBuffer {
            data: vec![0u8; capacity],
            read_idx: IO_BUFFER_RESERVED_PREFIX,
            write_idx: IO_BUFFER_RESERVED_PREFIX,
        }
    }

    /// Bytes available for reading: `[read_idx, write_idx)`.
    pub fn readable_view(&self) -> &[u8] {
        &self.data[self.read_idx..self.write_idx]
    }

    /// Bytes available for writing into: `[write_idx, len)`.
    pub fn writable_view(&mut self) -> &mut [u8] {
        &mut self.data[self.write_idx..]
    }

    /// Unused prefix bytes still available for `prepend`.
    pub fn reserved_len(&self) -> usize {
        self.read_idx
    }

    pub fn readable_len(&self) -> usize {
        self.write_idx - self.read_idx
    }

    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_idx
    }

    pub fn is_empty(&self) -> bool {
        self.read_idx == self.write_idx
    }

    /// Resets both indexes to the start of the readable window, discarding
    /// any unread bytes (used by handlers that have fully consumed a
    /// message and want to reclaim the reserved prefix for the next one).
    pub fn rewind(&mut self) {
        self.read_idx = IO_BUFFER_RESERVED_PREFIX;
        self.write_idx = IO_BUFFER_RESERVED_PREFIX;
    }

    /// Ensures at least `n` writable bytes are available, compacting the
    /// buffer (sliding the readable window back to the reserved offset)
    /// before growing it.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_len() >= n {
            return;
        }
        // Compacting reclaims read_idx - RESERVED bytes of dead space in
        // front of the readable window.
        let reclaimable = self.read_idx - IO_BUFFER_RESERVED_PREFIX;
        if reclaimable > 0 && self.writable_len() + reclaimable >= n {
            self.data
                .copy_within(self.read_idx..self.write_idx, IO_BUFFER_RESERVED_PREFIX);
            self.write_idx -= reclaimable;
            self.read_idx = IO_BUFFER_RESERVED_PREFIX;
            if self.writable_len() >= n {
                return;
            }
        }
        let additional = n - self.writable_len();
        self.data.resize(self.data.len() + additional, 0);
    }

    /// Appends `bytes` to the writable window, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let end = self.write_idx + bytes.len();
        self.data[self.write_idx..end].copy_from_slice(bytes);
        self.write_idx = end;
    }

    /// Writes `bytes` into the reserved prefix, immediately before the
    /// current readable window. `bytes.len()` must not exceed
    /// [`reserved_len`](Self::reserved_len).
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.reserved_len(),
            "prepend of {} bytes exceeds reserved prefix of {}",
            bytes.len(),
            self.reserved_len()
        );
        let start = self.read_idx - bytes.len();
        self.data[start..self.read_idx].copy_from_slice(bytes);
        self.read_idx = start;
    }

    /// Removes and returns the first `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_len());
        let out = self.data[self.read_idx..self.read_idx + n].to_vec();
        self.read_idx += n;
        if self.read_idx == self.write_idx {
            self.rewind();
        }
        out
    }

    /// Drops the first `n` readable bytes without copying them out.
    pub fn retrieve_discard(&mut self, n: usize) {
        self.read_idx = (self.read_idx + n).min(self.write_idx);
        if self.read_idx == self.write_idx {
            self.rewind();
        }
    }

    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }
    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }
    pub fn append_u64(&mut self, v: u64) {
        self.append(&v.to_be_bytes());
    }

    pub fn peek_u16(&self) -> Option<u16> {
        self.peek_be(2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
    }
    pub fn peek_u32(&self) -> Option<u32> {
        self.peek_be(4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    }
    pub fn peek_u64(&self) -> Option<u64> {
        self.peek_be(8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn peek_be(&self, width: usize) -> Option<Vec<u8>> {
        if self.readable_len() < width {
            return None;
        }
        Some(self.data[self.read_idx..self.read_idx + width].to_vec())
    }

    pub fn retrieve_u16(&mut self) -> Option<u16> {
        let v = self.peek_u16()?;
        self.retrieve_discard(2);
        Some(v)
    }
    pub fn retrieve_u32(&mut self) -> Option<u32> {
        let v = self.peek_u32()?;
        self.retrieve_discard(4);
        Some(v)
    }
    pub fn retrieve_u64(&mut self) -> Option<u64> {
        let v = self.peek_u64()?;
        self.retrieve_discard(8);
        Some(v)
    }

    /// Reads from `fd` into the writable window, spilling any overflow
    /// past it into a stack scratch buffer and appending that overflow.
    /// Returns the number of bytes read, `0` on peer EOF, or an
    /// `io::Error` (including `WouldBlock`/`Interrupted`, which the caller
    /// treats as "try again").
    pub fn scatter_read(&mut self, fd: RawFd) -> std::io::Result<usize> {
        self.ensure_writable(1);
        let mut scratch = [0u8; SCATTER_READ_SCRATCH_LEN];
        let writable_len = self.writable_len();

        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.write_idx..].as_mut_ptr().cast(),
                iov_len: writable_len,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr().cast(),
                iov_len: scratch.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as i32) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable_len {
            self.write_idx += n;
        } else {
            self.write_idx += writable_len;
            let overflow = n - writable_len;
            self.append(&scratch[..overflow]);
        }
        Ok(n)
    }

    /// A single `send(2)` of the readable window with `MSG_NOSIGNAL`.
    /// Advances `read_idx` by the amount actually sent.
    pub fn write_to(&mut self, fd: RawFd) -> std::io::Result<usize> {
        let view = self.readable_view();
        if view.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            libc::send(
                fd,
                view.as_ptr().cast(),
                view.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.retrieve_discard(n as usize);
        Ok(n as usize)
    }
}
