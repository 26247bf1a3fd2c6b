// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains constants describing the virtual memory layout.
//!
//! The layout is summarised below:
//!
//! | Region            |           Start address |            Last address |      Size |
//! | ----------------- | ----------------------: | ----------------------: | --------: |
//! | [`NULL_PAGE`]     |                   `0x0` |             `0x1f_ffff` |     2 MiB |
//! | [`USERSPACE`]     |             `0x20_0000` | `0x7fff_ffff_ffff`      | < 128 TiB |
//! | [`KERNEL_BINARY`] | `0xffff_8000_0000_0000` | `0xffff_8000_3fff_ffff` |     1 GiB |
//! | [`KERNEL_VMEM`]   | `0xffff_8000_4000_0000` | `0xffff_8000_ffff_ffff` |     3 GiB |
//! | [`TEMP_MAP`]      | `0xffff_8001_0000_0000` | `0xffff_8001_001f_ffff` |     2 MiB |
//! | [`KERNEL_STACKS`] | `0xffff_8002_0000_0000` | `0xffff_8002_07ff_ffff` |   128 MiB |
//!
//! The higher-half direct map sits wherever the bootloader placed it;
//! its offset is installed at boot with [`set_hhdm_offset`](crate::set_hhdm_offset).

use crate::{VirtAddr, VirtAddrRange};
use align::PAGE_SIZE;

/// The largest number of CPUs the kernel supports.
///
pub const MAX_CPUS: usize = 32;

/// The number of pages in each CPU's temporary mapping window.
///
pub const TEMP_MAP_SLOTS: usize = 16;

/// The first virtual page, which is kept unmapped to ensure null
/// pointer dereferences cause a page fault.
///
pub const NULL_PAGE: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::zero(),
    VirtAddr::new(0x1f_ffff),
);

/// The lower half of virtual memory, used by userspace.
///
pub const USERSPACE: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0x20_0000),
    VirtAddr::new(0x7fff_ffff_ffff),
);

/// The kernel binary is mapped within this range.
///
pub const KERNEL_BINARY: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0xffff_8000_0000_0000),
    VirtAddr::new(0xffff_8000_3fff_ffff),
);

/// The arena managed by the kernel virtual memory allocator. The
/// kernel heap and all transient kernel mappings are carved out
/// of this range.
///
pub const KERNEL_VMEM: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0xffff_8000_4000_0000),
    VirtAddr::new(0xffff_8000_ffff_ffff),
);

/// The per-CPU temporary mapping windows. CPU `n` owns the
/// [`TEMP_MAP_SLOTS`] pages starting at
/// `TEMP_MAP.start() + n * TEMP_MAP_SLOTS * PAGE_SIZE`.
///
pub const TEMP_MAP: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0xffff_8001_0000_0000),
    VirtAddr::new(0xffff_8001_001f_ffff),
);

/// The region used for kernel stacks.
///
pub const KERNEL_STACKS: VirtAddrRange = VirtAddrRange::new(
    VirtAddr::new(0xffff_8002_0000_0000),
    VirtAddr::new(0xffff_8002_07ff_ffff),
);

/// Returns the temporary mapping window owned by the given CPU.
///
/// # Panics
///
/// `temp_map_window` panics if `cpu` is not below [`MAX_CPUS`].
///
pub fn temp_map_window(cpu: usize) -> VirtAddrRange {
    assert!(cpu < MAX_CPUS, "CPU id out of range");
    let size = TEMP_MAP_SLOTS * PAGE_SIZE;
    let start = TEMP_MAP.start() + cpu * size;
    VirtAddrRange::new(start, start + (size - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_do_not_overlap() {
        let regions = [
            (NULL_PAGE, "null page"),
            (USERSPACE, "userspace"),
            (KERNEL_BINARY, "kernel binary"),
            (KERNEL_VMEM, "kernel vmem"),
            (TEMP_MAP, "temp map"),
            (KERNEL_STACKS, "kernel stacks"),
        ];

        // n is small, so a quadratic check is fine and gives
        // extra peace of mind.
        for (i, first) in regions.iter().enumerate() {
            for (j, second) in regions.iter().enumerate() {
                if i == j {
                    continue;
                }

                assert!(
                    !first.0.contains_addr(second.0.start()),
                    "{} overlaps with {}",
                    first.1,
                    second.1
                );
                assert!(
                    !first.0.contains_addr(second.0.end()),
                    "{} overlaps with {}",
                    first.1,
                    second.1
                );
            }
        }
    }

    #[test]
    fn temp_windows_are_disjoint() {
        let window0 = temp_map_window(0);
        let window1 = temp_map_window(1);
        assert_eq!(window0.size(), TEMP_MAP_SLOTS * PAGE_SIZE);
        assert!(!window0.contains_addr(window1.start()));
        assert!(TEMP_MAP.contains_range(window0.start(), window0.end()));
        assert!(TEMP_MAP.contains_range(
            temp_map_window(MAX_CPUS - 1).start(),
            temp_map_window(MAX_CPUS - 1).end()
        ));
    }
}
