// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! One-shot timers that fire as messages on ports.
//!
//! A timer is armed on the CPU that requests it and lives in that
//! CPU's ordered timer queue, keyed by the absolute tick it fires
//! at. Each scheduling tick, [`service_timer_ports`] pops every due
//! entry and sends a timer-reply message to its port. A port that
//! has meanwhile disappeared is skipped: the timer quietly dies with
//! it.

use crate::port::{self, PortId};
use crate::cpu;
use abi::TimerReply;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::lock;

fn next_timer_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Arms a one-shot timer that sends a [`TimerReply`] to `port`
/// after `milliseconds`. Returns the timer's id, which is
/// carried in the reply.
///
pub fn request_timer(port: PortId, milliseconds: u64) -> u64 {
    let id = next_timer_id();
    let fire_at = time::ticks() + milliseconds;

    let cpu = cpu::current();
    let mut timers = lock!(cpu.timers);
    timers.entry(fire_at).or_default().push((id, port));
    id
}

/// Delivers a reply to every timer on this CPU whose deadline
/// has passed. Called from the scheduling tick.
///
pub fn service_timer_ports() {
    let now = time::ticks();
    let cpu = cpu::current();
    let mut timers = lock!(cpu.timers);

    loop {
        let due = match timers.iter().next() {
            Some((&fire_at, _)) if fire_at <= now => fire_at,
            _ => break,
        };

        let fired = timers.remove(&due).expect("key taken from the map");
        // Deliver with the timer queue unlocked; the port layer
        // takes its own locks and may wake the port's owner.
        drop(timers);

        for (id, port_id) in fired {
            let reply = TimerReply {
                status: 0,
                timer_id: id,
                extra: [0; 3],
            };
            let _ = port::send_kernel_message(port_id, &reply.encode());
        }

        timers = lock!(cpu.timers);
    }
}
