// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Human-readable formatting of byte quantities for debug output.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

use core::fmt;

/// A quantity of bytes, formatted with binary units.
///
/// Quantities that are an exact multiple of a unit are printed in
/// that unit (`"4 KiB"`, `"2 MiB"`); everything else falls back to
/// plain bytes (`"4097 B"`), which keeps the output lossless.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bytes(u64);

const UNITS: [(u64, &str); 4] = [
    (1 << 40, "TiB"),
    (1 << 30, "GiB"),
    (1 << 20, "MiB"),
    (1 << 10, "KiB"),
];

impl Bytes {
    /// Wraps the given number of bytes.
    ///
    pub const fn from_u64(bytes: u64) -> Self {
        Bytes(bytes)
    }

    /// Wraps the given number of bytes.
    ///
    pub const fn from_usize(bytes: usize) -> Self {
        Bytes(bytes as u64)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (size, name) in UNITS.iter() {
            if self.0 >= *size && self.0 % size == 0 {
                return write!(f, "{} {}", self.0 / size, name);
            }
        }

        write!(f, "{} B", self.0)
    }
}
