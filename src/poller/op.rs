//! Operation records tracked by the poller's `key -> op` table.

use std::os::fd::RawFd;

use crate::event::EventHandle;

pub type Key = u64;

/// What a completion should do once its result arrives. `Cancelled` ops
/// stay in the table (so a late completion doesn't touch freed memory)
/// until their own completion is observed, at which point the table entry
/// is dropped for good.
pub enum Op {
    /// A level-triggered readiness poll on behalf of an [`EventHandle`]'s
    /// current interest mask. Re-armed by the poller itself on completion.
    Poll { fd: RawFd, mask: u32 },
    Read {
        completion: Box<dyn FnOnce(i32) + Send>,
    },
    Write {
        completion: Box<dyn FnOnce(i32) + Send>,
    },
    Accept {
        completion: Box<dyn FnOnce(i32) + Send>,
    },
    /// Marks a previously-live op inert; its slot is freed once the
    /// corresponding `ASYNC_CANCEL` completion (or the original op's own
    /// late completion) is observed.
    Cancelled,
}

/// Per-fd poll-interest bookkeeping the poller keeps outside the op table,
/// so `modify`/`remove` can find the live key for a given fd without a
/// linear scan.
pub struct Registration {
    pub handle: *mut EventHandle,
    pub poll_key: Option<Key>,
}

// SAFETY: `handle` is only ever dereferenced on the event manager's own
// thread, which is also the only thread that calls into the poller.
unsafe impl Send for Registration {}
