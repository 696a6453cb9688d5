//! Poller (C7): the completion-queue-backed event source. One [`Poller`]
//! belongs to exactly one [`crate::event_manager::EventManager`] and is
//! only ever touched from that manager's own thread.
//!
//! Grounded on the io_uring event loops in the wider example corpus
//! (buffer-pool token tables, re-armed accept/read/write submissions,
//! `ASYNC_CANCEL` via `register_sync_cancel`) but organized as long-lived
//! registrations keyed by fd (for poll-interest) plus one-shot operations
//! keyed by a monotonic submission id, matching the split the rest of this
//! crate's event handle / connection model expects.

mod op;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use io_uring::{opcode, types, IoUring};

use crate::config::PollerConfig;
use crate::event::EventHandle;
use crate::{log_error, log_warn};

pub use op::Key;
use op::{Op, Registration};

/// Reserved key meaning "no-op / ignore this completion"; real ops always
/// get a key starting at 1 from [`Poller::next_key`].
const IGNORED_KEY: Key = 0;

pub struct Poller {
    ring: IoUring,
    ops: Mutex<HashMap<Key, Op>>,
    registrations: HashMap<RawFd, Registration>,
    next_key: AtomicU64,
    config: PollerConfig,
}

impl Poller {
    /// Builds the completion ring, probing the entry count down from
    /// `config.entries_default` to `config.entries_min` on `-ENOMEM`, and
    /// retrying without SQ polling if the kernel refuses it
    /// (`-EPERM`/`-EINVAL`) — typically because the process lacks
    /// `CAP_SYS_ADMIN` or SQPOLL isn't supported here.
    pub fn new(config: PollerConfig) -> std::io::Result<Self> {
        let ring = Self::build_ring(&config)?;
        Ok(Poller {
            ring,
            ops: Mutex::new(HashMap::new()),
            registrations: HashMap::new(),
            next_key: AtomicU64::new(1),
            config,
        })
    }

    fn build_ring(config: &PollerConfig) -> std::io::Result<IoUring> {
        let mut entries = config.entries_default;
        loop {
            match IoUring::builder().build(entries) {
                Ok(ring) => return Ok(ring),
                Err(e) if e.raw_os_error() == Some(libc::ENOMEM) && entries > config.entries_min => {
                    entries = (entries / 2).max(config.entries_min);
                    log_warn!("poller: io_uring entry count too large, retrying with {entries}");
                }
                Err(e)
                    if matches!(e.raw_os_error(), Some(libc::EPERM) | Some(libc::EINVAL))
                        && entries != config.entries_min =>
                {
                    // Most likely SQPOLL-related; one more attempt at the
                    // floor before giving up entirely.
                    entries = config.entries_min;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn alloc_key(&self) -> Key {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&mut self, entry: &io_uring::squeue::Entry) -> std::io::Result<()> {
        unsafe {
            if self.ring.submission().push(entry).is_err() {
                // Give the kernel a chance to reclaim space, then retry once.
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(entry)
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "submission queue full"))?;
            }
        }
        Ok(())
    }

    /// Registers `handle`'s fd for interest bookkeeping. Does not arm a
    /// poll submission by itself; call [`Self::modify`] once the handle's
    /// interest mask is non-zero.
    pub fn add(&mut self, handle: &mut EventHandle) {
        self.registrations.insert(
            handle.fd(),
            Registration {
                handle: handle as *mut EventHandle,
                poll_key: None,
            },
        );
    }

    /// Syncs the live poll submission for `handle`'s fd with its current
    /// interest mask: cancels it if the mask became zero, (re-)submits a
    /// one-shot `PollAdd` otherwise.
    pub fn modify(&mut self, handle: &mut EventHandle) -> std::io::Result<()> {
        let fd = handle.fd();
        let mask = handle.interest();

        let existing_key = self.registrations.get(&fd).and_then(|r| r.poll_key);
        if let Some(key) = existing_key {
            self.cancel(key);
        }

        if mask == 0 {
            if let Some(reg) = self.registrations.get_mut(&fd) {
                reg.poll_key = None;
            }
            return Ok(());
        }

        let key = self.alloc_key();
        let flags = Self::poll_flags(mask);
        let entry = opcode::PollAdd::new(types::Fd(fd), flags)
            .build()
            .user_data(key);
        self.push(&entry)?;
        self.ops.lock().unwrap().insert(key, Op::Poll { fd, mask });
        if let Some(reg) = self.registrations.get_mut(&fd) {
            reg.poll_key = Some(key);
        }
        Ok(())
    }

    /// Cancels any pending poll submission for `fd` and forgets it.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(reg) = self.registrations.remove(&fd) {
            if let Some(key) = reg.poll_key {
                self.cancel(key);
            }
        }
    }

    fn poll_flags(mask: u32) -> u32 {
        mask
    }

    /// Submits a one-shot read of up to `len` bytes at `ptr` for `fd`.
    /// `completion(result)` runs from within [`Self::poll`] with the raw
    /// `read(2)`-style return value (negative errno, `0` for EOF, or the
    /// byte count).
    ///
    /// # Safety
    /// `ptr` must stay valid and exclusively borrowed until `completion`
    /// runs or the op is cancelled and its cancellation completes.
    pub unsafe fn submit_read(
        &mut self,
        fd: RawFd,
        ptr: *mut u8,
        len: u32,
        completion: Box<dyn FnOnce(i32) + Send>,
    ) -> std::io::Result<Key> {
        let key = self.alloc_key();
        let entry = opcode::Read::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(key);
        self.push(&entry)?;
        self.ops.lock().unwrap().insert(key, Op::Read { completion });
        Ok(key)
    }

    /// Submits a one-shot write of `len` bytes at `ptr` for `fd`.
    ///
    /// # Safety
    /// `ptr` must stay valid and point at `len` readable bytes until
    /// `completion` runs or the op is cancelled and its cancellation
    /// completes.
    pub unsafe fn submit_write(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: u32,
        completion: Box<dyn FnOnce(i32) + Send>,
    ) -> std::io::Result<Key> {
        let key = self.alloc_key();
        let entry = opcode::Write::new(types::Fd(fd), ptr, len)
            .build()
            .user_data(key);
        self.push(&entry)?;
        self.ops.lock().unwrap().insert(key, Op::Write { completion });
        Ok(key)
    }

    /// Submits an accept on the listening socket `fd`. `completion(result)`
    /// receives the accepted fd, or a negative errno.
    pub fn submit_accept(
        &mut self,
        fd: RawFd,
        completion: Box<dyn FnOnce(i32) + Send>,
    ) -> std::io::Result<Key> {
        let key = self.alloc_key();
        let entry = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
            .build()
            .user_data(key);
        self.push(&entry)?;
        self.ops.lock().unwrap().insert(key, Op::Accept { completion });
        Ok(key)
    }

    /// Marks `key` inert and asks the kernel to cancel it. The op's table
    /// slot is only freed once a completion bearing `key` (the original or
    /// the `ASYNC_CANCEL`'s own) arrives — see [`Self::drain_completions`].
    pub fn cancel(&mut self, key: Key) {
        {
            let mut ops = self.ops.lock().unwrap();
            if let Some(slot) = ops.get_mut(&key) {
                *slot = Op::Cancelled;
            } else {
                return;
            }
        }
        let builder = types::CancelBuilder::user_data(key);
        if let Err(e) = self.ring.submitter().register_sync_cancel(None, builder) {
            // ENOENT means it already completed naturally; anything else
            // is logged but left for the normal completion path to clean up.
            if e.raw_os_error() != Some(libc::ENOENT) {
                log_warn!("poller: async cancel for key {key} failed: {e}");
            }
        }
    }

    /// Blocks for up to `timeout_ms` (or indefinitely if `None`) until at
    /// least one completion is available, then drains up to
    /// `config.batch_limit` completions or until `config.time_budget_us`
    /// has elapsed, whichever comes first. Dispatches Poll completions by
    /// updating the owning handle's mask and appending its fd to
    /// `active_out`; Read/Write/Accept completions run their stored
    /// closure directly.
    pub fn poll(
        &mut self,
        timeout_ms: Option<u64>,
        active_out: &mut Vec<RawFd>,
    ) -> std::io::Result<()> {
        active_out.clear();

        // Kept alive until `submit_and_wait` below: the kernel reads this
        // `Timespec` through the SQE's raw pointer during that syscall, so
        // it must still be live then, not just at `push` time.
        let ts;
        if let Some(ms) = timeout_ms {
            ts = types::Timespec::new()
                .sec(ms / 1000)
                .nsec(((ms % 1000) * 1_000_000) as u32);
            let entry = opcode::Timeout::new(&ts as *const _)
                .build()
                .user_data(IGNORED_KEY);
            self.push(&entry)?;
        }

        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + std::time::Duration::from_micros(self.config.time_budget_us);
        let mut drained = 0u32;
        loop {
            let cqe = match self.ring.completion().next() {
                Some(c) => c,
                None => break,
            };
            self.handle_completion(cqe, active_out);
            drained += 1;
            if drained >= self.config.batch_limit || Instant::now() >= deadline {
                break;
            }
        }
        Ok(())
    }

    fn handle_completion(&mut self, cqe: io_uring::cqueue::Entry, active_out: &mut Vec<RawFd>) {
        let key = cqe.user_data();
        if key == IGNORED_KEY {
            return;
        }
        let result = cqe.result();

        // None of the opcodes this poller issues are multishot, so every
        // completion frees its table slot unconditionally.
        let op = self.ops.lock().unwrap().remove(&key);

        match op {
            Some(Op::Poll { fd, .. }) => {
                if result < 0 {
                    log_error!("poller: poll completion for fd {fd} failed: {result}");
                    return;
                }
                let current_interest = self.registrations.get(&fd).map(|reg| {
                    // SAFETY: `reg.handle` outlives the poller's use of it
                    // because remove() is always called before the handle
                    // (owned by the connection) is dropped.
                    let handle = unsafe { &mut *reg.handle };
                    handle.set_last_mask(result as u32);
                    handle.interest()
                });
                if let Some(reg) = self.registrations.get_mut(&fd) {
                    reg.poll_key = None;
                }
                active_out.push(fd);
                if let Some(mask) = current_interest {
                    if mask != 0 {
                        let _ = self.rearm(fd, mask);
                    }
                }
            }
            Some(Op::Read { completion }) | Some(Op::Write { completion }) | Some(Op::Accept { completion }) => {
                completion(result);
            }
            Some(Op::Cancelled) | None => {}
        }
    }

    fn rearm(&mut self, fd: RawFd, mask: u32) -> std::io::Result<()> {
        let key = self.alloc_key();
        let entry = opcode::PollAdd::new(types::Fd(fd), mask)
            .build()
            .user_data(key);
        self.push(&entry)?;
        self.ops.lock().unwrap().insert(key, Op::Poll { fd, mask });
        if let Some(reg) = self.registrations.get_mut(&fd) {
            reg.poll_key = Some(key);
        }
        Ok(())
    }

    /// Number of outstanding ops (live or pending-cancellation).
    pub fn outstanding(&self) -> usize {
        self.ops.lock().unwrap().len()
    }
}
