//! Process-wide logger (C2): single-writer sink fed by a lock-free MPSC
//! ring (`ring`), rotating dual-file output (`sink`).
//!
//! `start`/`end` form an idempotent, thread-safe singleton lifecycle.
//! Records queued after `end()` has run are dropped. Call sites use the
//! [`log_error!`], [`log_warn!`], [`log_info!`] etc. macros rather than
//! reaching for [`Logger::global`] directly.

mod record;
mod ring;
mod sink;

pub use record::Level;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use record::Record;
use ring::Ring;
use sink::RotatingSink;

const RING_CAPACITY: usize = 8192;
const CONSUMER_POLL: Duration = Duration::from_millis(200);

struct Inner {
    ring: Ring,
    running: AtomicBool,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

/// The process-wide singleton handle. Obtained via [`start`]; most callers
/// never touch this type directly and use the logging macros instead.
pub struct Logger {
    inner: std::sync::Arc<Inner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();
static STARTED: AtomicBool = AtomicBool::new(false);

/// Starts the global logger, writing to `n0_<base>`/`n1_<base>` in the
/// current directory. Idempotent: subsequent calls are no-ops.
pub fn start(base_file_name: &str) {
    if STARTED.swap(true, Ordering::AcqRel) {
        return;
    }
    let inner = std::sync::Arc::new(Inner {
        ring: Ring::new(RING_CAPACITY),
        running: AtomicBool::new(true),
        shutdown: Mutex::new(false),
        shutdown_cv: Condvar::new(),
    });

    let writer_inner = std::sync::Arc::clone(&inner);
    let base = base_file_name.to_string();
    let handle = std::thread::Builder::new()
        .name("ringloop-logger".into())
        .spawn(move || run_consumer(writer_inner, base))
        .expect("failed to spawn logger thread");

    let _ = LOGGER.set(Logger {
        inner,
        writer: Mutex::new(Some(handle)),
    });
}

/// Stops the global logger: flushes pending records, joins the writer
/// thread, then closes its files. Idempotent; records enqueued afterward
/// (from `log()`) are silently dropped because `running` is cleared first.
pub fn end() {
    let Some(logger) = LOGGER.get() else { return };
    if !logger.inner.running.swap(false, Ordering::AcqRel) {
        return;
    }
    {
        let mut done = logger.inner.shutdown.lock().unwrap();
        *done = true;
    }
    logger.inner.shutdown_cv.notify_all();
    logger.inner.ring.wake_all();

    if let Some(handle) = logger.writer.lock().unwrap().take() {
        let _ = handle.join();
    }
}

/// Enqueues a record. Dropped silently if the logger hasn't been started,
/// has already been stopped, or the ring is momentarily full.
pub fn log(level: Level, payload: String) {
    let Some(logger) = LOGGER.get() else { return };
    if !logger.inner.running.load(Ordering::Acquire) {
        return;
    }
    logger.inner.ring.enqueue(Record { level, payload });
}

pub fn dropped_count() -> usize {
    LOGGER.get().map(|l| l.inner.ring.dropped()).unwrap_or(0)
}

pub fn pending_count() -> usize {
    LOGGER.get().map(|l| l.inner.ring.pending()).unwrap_or(0)
}

fn run_consumer(inner: std::sync::Arc<Inner>, base: String) {
    let mut sink = match RotatingSink::new(&base) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut time_str = format_local_time();
    let mut last_stamped_second = crate::time::unix_seconds();

    loop {
        inner.ring.wait_for_pending(CONSUMER_POLL);

        let now_second = crate::time::unix_seconds();
        if now_second != last_stamped_second {
            time_str = format_local_time();
            last_stamped_second = now_second;
        }

        let mut drained_any = false;
        while let Some(record) = inner.ring.try_dequeue() {
            drained_any = true;
            let line = format!("[ {} ] Log({}): {}\n", time_str, record.level, record.payload);
            sink.write_line(&line);
        }

        let shutting_down = *inner.shutdown.lock().unwrap();
        if shutting_down && !drained_any {
            // Drain any records enqueued in the narrow window between the
            // shutdown flag flip and our last dequeue pass.
            let mut final_pass_found = false;
            while let Some(record) = inner.ring.try_dequeue() {
                final_pass_found = true;
                let line =
                    format!("[ {} ] Log({}): {}\n", time_str, record.level, record.payload);
                sink.write_line(&line);
            }
            if !final_pass_found {
                break;
            }
        }
    }
}

fn format_local_time() -> String {
    // No chrono dependency: render the UTC calendar fields by hand from a
    // Unix timestamp. Good enough for a log line; not meant for display to
    // end users who need full timezone support.
    let secs = crate::time::unix_seconds() as i64;
    let days = secs.div_euclid(86_400);
    let day_secs = secs.rem_euclid(86_400);
    let (h, m, s) = (day_secs / 3600, (day_secs % 3600) / 60, day_secs % 60);
    let (y, mo, d) = civil_from_days(days);
    format!("{y:04}-{mo:02}-{d:02} {h:02}:{m:02}:{s:02}")
}

/// Howard Hinnant's civil_from_days algorithm: days-since-epoch -> (y, m, d).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[macro_export]
macro_rules! log_emerg {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Emerg, format!($($arg)*)) };
}
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Error, format!($($arg)*)) };
}
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Warn, format!($($arg)*)) };
}
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Info, format!($($arg)*)) };
}
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::logger::log($crate::logger::Level::Debug, format!($($arg)*)) };
}
