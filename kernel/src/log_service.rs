//! Structured kernel log service
//!
//! A fixed-size, heap-free circular buffer of recent log entries behind a
//! [`spin::Mutex`], installable as the sink for the `log` facade. Kernel
//! code traces through the ordinary `log::trace!`-family macros; the ring
//! keeps the most recent entries for post-mortem inspection and for test
//! assertions.
//!
//! ```ignore
//! log_service::init();
//! log::info!(target: "sched", "scheduler initialized");
//! assert!(log_service::contains("scheduler initialized"));
//! ```

use core::fmt::Write as _;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Maximum number of entries the circular buffer can hold.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum length (in bytes) of a stored message.
const LOG_MESSAGE_MAX_LEN: usize = 128;

/// Maximum length (in bytes) of a stored target tag.
const LOG_TARGET_MAX_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A single structured log entry.
///
/// All fields are inline fixed-size arrays so the entry can live in a
/// static circular buffer without heap allocation.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Monotone sequence number assigned at insertion.
    pub sequence: u64,
    /// Severity of the message.
    pub level: Level,
    target_buf: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            sequence: 0,
            level: Level::Trace,
            target_buf: [0; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message_buf: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    /// The subsystem tag (the `log` target).
    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        core::str::from_utf8(&self.target_buf[..len]).unwrap_or("")
    }

    /// The message text, truncated to [`LOG_MESSAGE_MAX_LEN`] bytes.
    pub fn message(&self) -> &str {
        let len = self.message_len as usize;
        core::str::from_utf8(&self.message_buf[..len]).unwrap_or("")
    }
}

/// Circular buffer of recent entries.
struct LogRing {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    /// Index of the slot the next entry is written to.
    head: usize,
    /// Number of valid entries (saturates at capacity).
    len: usize,
    next_sequence: u64,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            head: 0,
            len: 0,
            next_sequence: 1,
        }
    }

    fn push(&mut self, level: Level, target: &str, args: core::fmt::Arguments<'_>) {
        let entry = &mut self.entries[self.head];
        entry.sequence = self.next_sequence;
        entry.level = level;

        let tlen = target.len().min(LOG_TARGET_MAX_LEN);
        entry.target_buf[..tlen].copy_from_slice(&target.as_bytes()[..tlen]);
        entry.target_len = tlen as u8;

        let mut sink = FixedWriter {
            buf: &mut entry.message_buf,
            len: 0,
        };
        // Truncation is fine; FixedWriter drops the overflow.
        let _ = write!(sink, "{}", args);
        entry.message_len = sink.len as u8;

        self.next_sequence += 1;
        self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        self.len = (self.len + 1).min(LOG_BUFFER_CAPACITY);
    }

    fn for_each(&self, mut f: impl FnMut(&LogEntry)) {
        let start = (self.head + LOG_BUFFER_CAPACITY - self.len) % LOG_BUFFER_CAPACITY;
        for i in 0..self.len {
            f(&self.entries[(start + i) % LOG_BUFFER_CAPACITY]);
        }
    }
}

/// `core::fmt::Write` sink into a fixed byte buffer, discarding overflow.
struct FixedWriter<'a> {
    buf: &'a mut [u8; LOG_MESSAGE_MAX_LEN],
    len: usize,
}

impl core::fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let space = LOG_MESSAGE_MAX_LEN - self.len;
        let n = s.len().min(space);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

static LOG_RING: Mutex<LogRing> = Mutex::new(LogRing::new());

// ---------------------------------------------------------------------------
// log facade plumbing
// ---------------------------------------------------------------------------

struct RingLogger;

impl Log for RingLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        LOG_RING
            .lock()
            .push(record.level(), record.target(), *record.args());
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger;

/// Install the ring as the `log` sink. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Number of entries currently retained.
pub fn count() -> usize {
    LOG_RING.lock().len
}

/// Whether any retained entry's message contains `needle`.
pub fn contains(needle: &str) -> bool {
    let ring = LOG_RING.lock();
    let mut found = false;
    ring.for_each(|e| {
        if !found && e.message().contains(needle) {
            found = true;
        }
    });
    found
}

/// Visit every retained entry, oldest first.
pub fn for_each_entry(f: impl FnMut(&LogEntry)) {
    LOG_RING.lock().for_each(f);
}
