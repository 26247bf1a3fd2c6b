// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The thin layer of architecture-specific operations, installed
//! into the generic subsystems as hooks at boot.
//!
//! Everything here is the mechanism behind a generic interface:
//! interrupt masking for the spinlocks, root-table loads and TLB
//! flushes for the page tables, and the preemption-timer and IPI
//! callouts for the scheduler. Inter-processor interrupts and the
//! hardware timer themselves belong to external drivers, which
//! register their senders with [`set_ipi_sender`] and
//! [`set_preemption_timer`]; until they do, the corresponding
//! signals are recorded but not delivered, which single-CPU bring-up
//! and hosted tests rely on.

use core::mem;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// An IPI kind: ask the target CPU to reschedule.
pub const IPI_RESCHEDULE: u8 = 1;

/// An IPI kind: ask the target CPU to flush its TLB.
pub const IPI_TLB_SHOOTDOWN: u8 = 2;

static CURRENT_CPU: AtomicUsize = AtomicUsize::new(0);
static IPI_SENDER: AtomicUsize = AtomicUsize::new(0);
static TIMER_SETTER: AtomicUsize = AtomicUsize::new(0);

// Pending TLB shootdowns, one bit per CPU.
static SHOOTDOWN_PENDING: AtomicU32 = AtomicU32::new(0);

/// The signature of an external IPI sender: target CPU and IPI
/// kind.
///
pub type IpiSenderFn = fn(usize, u8);

/// The signature of the external preemption-timer programmer:
/// milliseconds until the next scheduling interrupt.
///
pub type TimerFn = fn(u32);

/// Records which CPU is executing; called by each CPU's
/// bring-up, mirrored into the scheduler.
///
pub fn set_executing_cpu(id: usize) {
    CURRENT_CPU.store(id, Ordering::SeqCst);
    multitasking::cpu::set_current_cpu(id);
}

/// Registers the interrupt controller driver's IPI sender.
///
pub fn set_ipi_sender(sender: IpiSenderFn) {
    IPI_SENDER.store(sender as usize, Ordering::SeqCst);
}

/// Registers the timer driver's preemption-timer programmer.
///
pub fn set_preemption_timer(setter: TimerFn) {
    TIMER_SETTER.store(setter as usize, Ordering::SeqCst);
}

fn current_cpu() -> usize {
    CURRENT_CPU.load(Ordering::Relaxed)
}

fn send_ipi(cpu: usize, kind: u8) {
    let sender = IPI_SENDER.load(Ordering::Relaxed);
    if sender != 0 {
        let sender: IpiSenderFn = unsafe { mem::transmute(sender) };
        sender(cpu, kind);
    }
}

fn reschedule_ipi(cpu: usize) {
    send_ipi(cpu, IPI_RESCHEDULE);
}

fn signal_shootdown(cpu: usize) {
    SHOOTDOWN_PENDING.fetch_or(1 << cpu, Ordering::SeqCst);
    send_ipi(cpu, IPI_TLB_SHOOTDOWN);
}

fn set_timer(milliseconds: u32) {
    let setter = TIMER_SETTER.load(Ordering::Relaxed);
    if setter != 0 {
        let setter: TimerFn = unsafe { mem::transmute(setter) };
        setter(milliseconds);
    }
}

/// Services a pending TLB shootdown on the executing CPU.
/// Called by the exception shim on every interrupt.
///
pub fn service_shootdown() {
    let bit = 1u32 << current_cpu();
    if SHOOTDOWN_PENDING.fetch_and(!bit, Ordering::SeqCst) & bit != 0 {
        imp::flush_all();
    }
}

/// Installs the architecture hooks into the spinlock, paging
/// and scheduler layers.
///
pub fn install_hooks() {
    spin::set_irq_hooks(imp::irq_disable, imp::irq_restore);
    paging::set_arch_hooks(paging::ArchHooks {
        current_cpu,
        load_root: imp::load_root,
        flush_page: imp::flush_page,
        flush_all: imp::flush_all,
        signal_shootdown,
    });
    multitasking::set_sched_hooks(reschedule_ipi, set_timer);
}

pub use imp::{adopt_boot_page_table, new_page_table, window_mapper};

#[cfg(target_arch = "x86_64")]
mod imp {
    use alloc::boxed::Box;
    use memory::{PhysAddr, PhysFrame, VirtAddr};
    use paging::{ArchPageTable, MapError, X86PageTable};
    use tempmap::WindowMapper;
    use x86_64::instructions::{interrupts, tlb};
    use x86_64::registers::control::{Cr3, Cr3Flags};

    pub fn irq_disable() -> bool {
        let was_enabled = interrupts::are_enabled();
        if was_enabled {
            interrupts::disable();
        }

        was_enabled
    }

    pub fn irq_restore(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }

    pub fn load_root(frame: PhysFrame) {
        let addr = x86_64::PhysAddr::new(frame.start_address().as_u64());
        let frame = x86_64::structures::paging::PhysFrame::from_start_address(addr)
            .expect("root frames are page-aligned");
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    pub fn flush_page(addr: VirtAddr) {
        tlb::flush(x86_64::VirtAddr::new(addr.as_u64()));
    }

    pub fn flush_all() {
        tlb::flush_all();
    }

    /// Adopts the page table the bootloader left in CR3.
    ///
    pub fn adopt_boot_page_table() -> X86PageTable {
        let (frame, _) = Cr3::read();
        let root = PhysFrame::from_start_address(PhysAddr::new(
            frame.start_address().as_u64() as usize,
        ))
        .expect("CR3 holds a page-aligned frame");
        unsafe { X86PageTable::adopt(root) }
    }

    /// Creates an empty page table, its kernel half copied from
    /// the template.
    ///
    pub fn new_page_table(
        template: Option<PhysFrame>,
        frames: &mut dyn memory::FrameAllocator,
    ) -> Result<Box<dyn ArchPageTable>, MapError> {
        Ok(Box::new(X86PageTable::create_empty(frames, template)?))
    }

    /// Builds the window mapper for a CPU's scratch window.
    ///
    pub fn window_mapper(window: VirtAddr, table: PhysFrame) -> WindowMapper {
        WindowMapper::new(window, table, tempmap::x86_window_entry, flush_page)
    }
}

#[cfg(target_arch = "riscv64")]
mod imp {
    use alloc::boxed::Box;
    use core::arch::asm;
    use memory::{PhysFrame, VirtAddr};
    use paging::{ArchPageTable, MapError, RiscvMode, RiscvPageTable};
    use tempmap::WindowMapper;

    // sstatus.SIE: supervisor interrupt enable.
    const SSTATUS_SIE: usize = 1 << 1;

    // satp mode field for sv48.
    const SATP_MODE_SV48: usize = 9 << 60;

    pub fn irq_disable() -> bool {
        let previous: usize;
        unsafe { asm!("csrrc {}, sstatus, {}", out(reg) previous, in(reg) SSTATUS_SIE) };
        previous & SSTATUS_SIE != 0
    }

    pub fn irq_restore(was_enabled: bool) {
        if was_enabled {
            unsafe { asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE) };
        }
    }

    pub fn load_root(frame: PhysFrame) {
        let satp = SATP_MODE_SV48 | frame.page_number();
        unsafe {
            asm!("csrw satp, {}", in(reg) satp);
            asm!("sfence.vma");
        }
    }

    pub fn flush_page(addr: VirtAddr) {
        unsafe { asm!("sfence.vma {}, zero", in(reg) addr.as_usize()) };
    }

    pub fn flush_all() {
        unsafe { asm!("sfence.vma") };
    }

    /// Adopts the page table the bootloader left in `satp`.
    ///
    pub fn adopt_boot_page_table() -> RiscvPageTable {
        let satp: usize;
        unsafe { asm!("csrr {}, satp", out(reg) satp) };
        let root = PhysFrame::from_page_number(satp & 0xfff_ffff_ffff);
        unsafe { RiscvPageTable::adopt(root, RiscvMode::Sv48) }
    }

    /// Creates an empty page table, its kernel half copied from
    /// the template.
    ///
    pub fn new_page_table(
        template: Option<PhysFrame>,
        frames: &mut dyn memory::FrameAllocator,
    ) -> Result<Box<dyn ArchPageTable>, MapError> {
        Ok(Box::new(RiscvPageTable::create_empty(
            frames,
            template,
            RiscvMode::Sv48,
        )?))
    }

    /// Builds the window mapper for a CPU's scratch window.
    ///
    pub fn window_mapper(window: VirtAddr, table: PhysFrame) -> WindowMapper {
        WindowMapper::new(window, table, tempmap::riscv_window_entry, flush_page)
    }
}
