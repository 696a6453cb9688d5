//! Event handle (C5): the per-fd interest/readiness record the poller arms.
//! Mirrors the role mio's `event::Source` + `Token` pair plays, collapsed
//! into one object because here the poller owns completion-based I/O
//! directly instead of routing through a `Registry`.

use std::os::fd::RawFd;

/// Bitmask of interests an [`EventHandle`] can be armed for.
pub mod interest {
    pub const READ: u32 = libc::POLLIN as u32 | libc::POLLPRI as u32;
    pub const WRITE: u32 = libc::POLLOUT as u32;
}

/// The poller's view of one fd: its armed interest mask and the mask
/// observed on the most recent completion. [`crate::connection::Connection`]
/// owns the actual read/write/close/error callbacks and reads `last_mask`
/// to decide which of its own handlers to run; this handle only tracks
/// *what the poller should be watching for*.
pub struct EventHandle {
    fd: RawFd,
    interest: u32,
    last_mask: u32,
    dirty: bool,
}

impl EventHandle {
    pub fn new(fd: RawFd) -> Self {
        EventHandle {
            fd,
            interest: 0,
            last_mask: 0,
            dirty: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> u32 {
        self.interest
    }

    fn set_interest(&mut self, mask: u32) {
        if mask != self.interest {
            self.interest = mask;
            self.dirty = true;
        }
    }

    pub fn enable_read(&mut self) {
        self.set_interest(self.interest | interest::READ);
    }

    pub fn disable_read(&mut self) {
        self.set_interest(self.interest & !interest::READ);
    }

    pub fn enable_write(&mut self) {
        self.set_interest(self.interest | interest::WRITE);
    }

    pub fn disable_write(&mut self) {
        self.set_interest(self.interest & !interest::WRITE);
    }

    pub fn disable_all(&mut self) {
        self.set_interest(0);
    }

    /// Sets the interest mask directly from raw `POLLIN`/`POLLOUT`-style
    /// bits, for callers (system fds) that don't go through the
    /// enable/disable read/write pair.
    pub fn interest_set(&mut self, mask: u32) {
        self.set_interest(mask);
    }

    pub fn is_armed(&self) -> bool {
        self.interest != 0
    }

    /// Records the mask the poller observed on its most recent completion
    /// for this handle, ready for [`crate::connection::Connection::dispatch`].
    pub fn set_last_mask(&mut self, mask: u32) {
        self.last_mask = mask;
    }

    pub fn last_mask(&self) -> u32 {
        self.last_mask
    }

    /// Returns `true` exactly once per interest-mask change, clearing the
    /// flag. The owning [`crate::event_manager::EventManager`] polls this
    /// each tick to know which handles need a fresh
    /// [`crate::poller::Poller::modify`] call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_transitions() {
        let mut h = EventHandle::new(3);
        assert!(!h.is_armed());
        h.enable_read();
        assert!(h.is_armed());
        h.enable_write();
        assert_eq!(h.interest() & interest::WRITE, interest::WRITE);
        h.disable_write();
        assert_eq!(h.interest() & interest::WRITE, 0);
        h.disable_all();
        assert!(!h.is_armed());
    }

    #[test]
    fn dirty_flag_set_once_per_change_and_cleared_by_take() {
        let mut h = EventHandle::new(3);
        assert!(!h.take_dirty(), "freshly constructed handle has nothing to sync");

        h.enable_read();
        assert!(h.take_dirty());
        assert!(!h.take_dirty(), "take_dirty must clear the flag");

        // Enabling a bit that's already set doesn't change the mask, so it
        // shouldn't mark the handle dirty again.
        h.enable_read();
        assert!(!h.take_dirty());

        h.disable_all();
        assert!(h.take_dirty());
    }
}
