//! Kernel logger.
//!
//! Every record is formatted into a fixed-size ring buffer so diagnostics
//! survive even when no console is attached. A console sink can be registered
//! once at boot; until then (and on the host) records only land in the ring.

use core::fmt::{self, Write};

use conquer_once::spin::OnceCell;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::config::LOG_BUFFER_SIZE;

/// Console output hook, e.g. a serial port writer.
pub type ConsoleSink = fn(fmt::Arguments<'_>);

/// Byte ring that drops the oldest data when full.
struct LogRing {
    buffer: [u8; LOG_BUFFER_SIZE],
    head: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buffer: [0; LOG_BUFFER_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        let tail = (self.head + self.len) % LOG_BUFFER_SIZE;
        self.buffer[tail] = byte;
        if self.len == LOG_BUFFER_SIZE {
            // Buffer full - advance head to drop oldest byte
            self.head = (self.head + 1) % LOG_BUFFER_SIZE;
        } else {
            self.len += 1;
        }
    }

    fn read_all(&self) -> alloc::string::String {
        let mut bytes = alloc::vec::Vec::with_capacity(self.len);
        for i in 0..self.len {
            bytes.push(self.buffer[(self.head + i) % LOG_BUFFER_SIZE]);
        }
        alloc::string::String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.push(byte);
        }
        Ok(())
    }
}

pub struct KernelLogger {
    ring: Mutex<LogRing>,
    console: OnceCell<ConsoleSink>,
}

impl KernelLogger {
    const fn new() -> Self {
        KernelLogger {
            ring: Mutex::new(LogRing::new()),
            console: OnceCell::uninit(),
        }
    }

    /// Attach a console. Only the first call has any effect.
    pub fn attach_console(&self, sink: ConsoleSink) {
        if self.console.try_init_once(|| sink).is_err() {
            log::warn!("console sink already attached");
        }
    }

    /// Non-destructive copy of everything currently in the ring.
    pub fn read_all(&self) -> alloc::string::String {
        self.ring.lock().read_all()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Use try_lock so a record emitted while the ring is held (an
        // interrupt during logging) is dropped instead of deadlocking.
        if let Some(mut ring) = self.ring.try_lock() {
            let _ = writeln!(
                &mut *ring,
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }

        if let Some(sink) = self.console.get() {
            sink(format_args!(
                "[{:>5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

pub static LOGGER: KernelLogger = KernelLogger::new();

/// Install the kernel logger as the `log` backend.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: LevelFilter) {
    // set_logger fails if a logger is already installed, which is fine here
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
