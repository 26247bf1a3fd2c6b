// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Kernel logging over the first serial port, with the `print` and
//! `println` macros.
//!
//! Output written before [`init`] has run does not touch the hardware;
//! it accumulates in a fixed ring buffer instead and is replayed to the
//! UART once `init` brings it up. The same buffering serves the
//! `set_log_port` syscall, which drains the buffer to a user port, and
//! it is what makes logging harmless in hosted test builds, where
//! `init` is never called.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::fmt;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{lock, Mutex};
use uart_16550::SerialPort;

/// The first serial port device, which receives the kernel log.
///
pub static COM1: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x3f8)) };

static INITIALISED: AtomicBool = AtomicBool::new(false);

const EARLY_BUFFER_SIZE: usize = 8192;

struct EarlyBuffer {
    bytes: [u8; EARLY_BUFFER_SIZE],
    // Index of the oldest byte.
    head: usize,
    len: usize,
}

impl EarlyBuffer {
    const fn new() -> Self {
        EarlyBuffer {
            bytes: [0; EARLY_BUFFER_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.len < EARLY_BUFFER_SIZE {
            self.bytes[(self.head + self.len) % EARLY_BUFFER_SIZE] = byte;
            self.len += 1;
        } else {
            // Full: overwrite the oldest byte.
            self.bytes[self.head] = byte;
            self.head = (self.head + 1) % EARLY_BUFFER_SIZE;
        }
    }
}

static EARLY: Mutex<EarlyBuffer> = Mutex::new(EarlyBuffer::new());

/// Brings up the UART and replays any buffered early output.
///
pub fn init() {
    let mut port = lock!(COM1);
    port.init();
    INITIALISED.store(true, Ordering::SeqCst);

    let mut early = lock!(EARLY);
    for i in 0..early.len {
        let byte = early.bytes[(early.head + i) % EARLY_BUFFER_SIZE];
        port.send(byte);
    }

    early.len = 0;
}

/// Returns whether [`init`] has run and output is reaching the
/// hardware.
///
pub fn initialised() -> bool {
    INITIALISED.load(Ordering::Relaxed)
}

/// Drains the early log buffer through `f`, in chunks of up to
/// 256 bytes.
///
pub fn drain_early_log<F>(mut f: F)
where
    F: FnMut(&[u8]),
{
    let mut early = lock!(EARLY);
    let mut chunk = [0u8; 256];
    while early.len > 0 {
        let take = core::cmp::min(early.len, chunk.len());
        for slot in chunk.iter_mut().take(take) {
            *slot = early.bytes[early.head];
            early.head = (early.head + 1) % EARLY_BUFFER_SIZE;
            early.len -= 1;
        }

        f(&chunk[..take]);
    }
}

/// Writes the string to the kernel log.
///
pub fn write_str(s: &str) -> fmt::Result {
    if initialised() {
        lock!(COM1).write_str(s)
    } else {
        let mut early = lock!(EARLY);
        for byte in s.bytes() {
            early.push(byte);
        }

        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    struct Sink;

    impl Write for Sink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            write_str(s)
        }
    }

    // Ignore write errors: there is nowhere to report them.
    let _ = Sink.write_fmt(args);
}

/// Prints to the kernel log.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Prints to the kernel log, with a trailing newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn early_output_is_buffered() {
        assert!(!initialised());
        write_str("early message\n").unwrap();

        let mut drained = Vec::new();
        drain_early_log(|chunk| drained.extend_from_slice(chunk));
        assert!(drained.ends_with(b"early message\n"));

        // The buffer is empty once drained.
        let mut second = Vec::new();
        drain_early_log(|chunk| second.extend_from_slice(chunk));
        assert!(second.is_empty());
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut buffer = EarlyBuffer::new();
        for i in 0..(EARLY_BUFFER_SIZE + 10) {
            buffer.push((i % 251) as u8);
        }

        assert_eq!(buffer.len, EARLY_BUFFER_SIZE);
        // The oldest surviving byte is number 10.
        assert_eq!(buffer.bytes[buffer.head], (10 % 251) as u8);
    }
}
