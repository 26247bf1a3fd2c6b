// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Wire-stable layouts of the messages the kernel sends to user ports.
//!
//! Every kernel message starts with a little-endian 32-bit type tag.
//! The layouts are encoded field by field, so the wire format does not
//! depend on the compiler's struct layout.

/// Type tag of [`TimerReply`].
pub const MSG_TYPE_TIMER_REPLY: u32 = 0x05;

/// Type tag of [`KernelInterrupt`].
pub const MSG_TYPE_INTERRUPT: u32 = 0x20;

/// Type tag of [`NamedPortNotification`].
pub const MSG_TYPE_NAMED_PORT: u32 = 0x21;

/// Type tag of [`KernelRequestPage`].
pub const MSG_TYPE_REQUEST_PAGE: u32 = 0x23;

/// Type tag of [`GroupDestroyed`].
pub const MSG_TYPE_GROUP_DESTROYED: u32 = 0x24;

/// Type tag of [`GroupTaskChanged`].
pub const MSG_TYPE_GROUP_TASK_CHANGED: u32 = 0x25;

/// [`GroupTaskChanged`] event: a task was added to the group.
pub const GROUP_EVENT_TASK_ADDED: u16 = 0x02;

/// [`GroupTaskChanged`] event: a task was removed from the group.
pub const GROUP_EVENT_TASK_REMOVED: u16 = 0x01;

/// [`MessageDescriptor`] flag: the message carries a reply right.
pub const MESSAGE_FLAG_REPLY_RIGHT: u32 = 0x01;

/// [`MessageDescriptor`] flag: the carried reply right is send-many.
pub const MESSAGE_FLAG_REPLY_SEND_MANY: u32 = 0x02;

struct Encoder<const N: usize> {
    buf: [u8; N],
    at: usize,
}

impl<const N: usize> Encoder<N> {
    fn new() -> Self {
        Encoder { buf: [0; N], at: 0 }
    }

    fn u16(&mut self, value: u16) {
        self.buf[self.at..self.at + 2].copy_from_slice(&value.to_le_bytes());
        self.at += 2;
    }

    fn u32(&mut self, value: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&value.to_le_bytes());
        self.at += 4;
    }

    fn i32(&mut self, value: i32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&value.to_le_bytes());
        self.at += 4;
    }

    fn u64(&mut self, value: u64) {
        self.buf[self.at..self.at + 8].copy_from_slice(&value.to_le_bytes());
        self.at += 8;
    }

    fn finish(self) -> [u8; N] {
        debug_assert!(self.at == N);
        self.buf
    }
}

/// Reply sent to a port when a one-shot timer armed with
/// `request_timer` fires.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerReply {
    pub status: i32,
    pub timer_id: u64,
    pub extra: [u64; 3],
}

impl TimerReply {
    /// The encoded size in bytes.
    pub const SIZE: usize = 40;

    /// Encodes the message as little-endian bytes.
    ///
    pub fn encode(&self) -> [u8; 40] {
        let mut enc = Encoder::<40>::new();
        enc.u32(MSG_TYPE_TIMER_REPLY);
        enc.i32(self.status);
        enc.u64(self.timer_id);
        enc.u64(self.extra[0]);
        enc.u64(self.extra[1]);
        enc.u64(self.extra[2]);
        enc.finish()
    }
}

/// Notification of a hardware interrupt delivered to the task
/// that bound it.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelInterrupt {
    pub intno: u32,
    pub cpu_id: u32,
}

impl KernelInterrupt {
    /// The encoded size in bytes.
    pub const SIZE: usize = 12;

    /// Encodes the message as little-endian bytes.
    ///
    pub fn encode(&self) -> [u8; 12] {
        let mut enc = Encoder::<12>::new();
        enc.u32(MSG_TYPE_INTERRUPT);
        enc.u32(self.intno);
        enc.u32(self.cpu_id);
        enc.finish()
    }
}

/// Notification that a named port a task was waiting for has
/// been published. The port's name follows the fixed header on
/// the wire.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedPortNotification {
    pub port: u64,
}

impl NamedPortNotification {
    /// The encoded size of the fixed header in bytes.
    pub const SIZE: usize = 16;

    /// Encodes the fixed header as little-endian bytes. The
    /// port name is appended separately by the sender.
    ///
    pub fn encode(&self) -> [u8; 16] {
        let mut enc = Encoder::<16>::new();
        enc.u32(MSG_TYPE_NAMED_PORT);
        enc.u32(0); // reserved
        enc.u64(self.port);
        enc.finish()
    }
}

/// Request sent to a memory object's pager when a task faults
/// on a page the object does not yet hold.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelRequestPage {
    pub mem_object_id: u64,
    pub page_offset: u64,
}

impl KernelRequestPage {
    /// The encoded size in bytes.
    pub const SIZE: usize = 24;

    /// Encodes the message as little-endian bytes.
    ///
    pub fn encode(&self) -> [u8; 24] {
        let mut enc = Encoder::<24>::new();
        enc.u32(MSG_TYPE_REQUEST_PAGE);
        enc.u32(0); // flags
        enc.u64(self.mem_object_id);
        enc.u64(self.page_offset);
        enc.finish()
    }
}

/// Notification that a watched task group has been destroyed.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupDestroyed {
    pub task_group_id: u64,
}

impl GroupDestroyed {
    /// The encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Encodes the message as little-endian bytes.
    ///
    pub fn encode(&self) -> [u8; 16] {
        let mut enc = Encoder::<16>::new();
        enc.u32(MSG_TYPE_GROUP_DESTROYED);
        enc.u32(0); // flags
        enc.u64(self.task_group_id);
        enc.finish()
    }
}

/// Notification that a watched task group gained or lost a task.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupTaskChanged {
    pub event: u16,
    pub task_group_id: u64,
    pub task_id: u64,
}

impl GroupTaskChanged {
    /// The encoded size in bytes.
    pub const SIZE: usize = 24;

    /// Encodes the message as little-endian bytes.
    ///
    pub fn encode(&self) -> [u8; 24] {
        let mut enc = Encoder::<24>::new();
        enc.u32(MSG_TYPE_GROUP_TASK_CHANGED);
        enc.u16(0); // flags
        enc.u16(self.event);
        enc.u64(self.task_group_id);
        enc.u64(self.task_id);
        enc.finish()
    }
}

/// Description of the front message of a port, as returned by
/// `get_message_info`.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub sender: u64,
    pub mem_object: u64,
    pub size: u64,
    pub sent_with_right: u64,
    pub other_rights_count: u32,
    pub flags: u32,
}

impl MessageDescriptor {
    /// The encoded size in bytes.
    pub const SIZE: usize = 40;

    /// Encodes the descriptor as little-endian bytes.
    ///
    pub fn encode(&self) -> [u8; 40] {
        let mut enc = Encoder::<40>::new();
        enc.u64(self.sender);
        enc.u64(self.mem_object);
        enc.u64(self.size);
        enc.u64(self.sent_with_right);
        enc.u32(self.other_rights_count);
        enc.u32(self.flags);
        enc.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_type_tags() {
        assert_eq!(
            &TimerReply {
                status: 0,
                timer_id: 7,
                extra: [1, 2, 3]
            }
            .encode()[..4],
            &MSG_TYPE_TIMER_REPLY.to_le_bytes()
        );
        assert_eq!(
            &KernelInterrupt { intno: 3, cpu_id: 1 }.encode()[..4],
            &MSG_TYPE_INTERRUPT.to_le_bytes()
        );
        assert_eq!(
            &NamedPortNotification { port: 9 }.encode()[..4],
            &MSG_TYPE_NAMED_PORT.to_le_bytes()
        );
        assert_eq!(
            &KernelRequestPage {
                mem_object_id: 1,
                page_offset: 0x3000
            }
            .encode()[..4],
            &MSG_TYPE_REQUEST_PAGE.to_le_bytes()
        );
        assert_eq!(
            &GroupDestroyed { task_group_id: 4 }.encode()[..4],
            &MSG_TYPE_GROUP_DESTROYED.to_le_bytes()
        );
        assert_eq!(
            &GroupTaskChanged {
                event: GROUP_EVENT_TASK_ADDED,
                task_group_id: 4,
                task_id: 2
            }
            .encode()[..4],
            &MSG_TYPE_GROUP_TASK_CHANGED.to_le_bytes()
        );
    }

    #[test]
    fn request_page_layout() {
        let bytes = KernelRequestPage {
            mem_object_id: 0x1122_3344_5566_7788,
            page_offset: 0x4000,
        }
        .encode();

        assert_eq!(bytes.len(), KernelRequestPage::SIZE);
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x4000u64.to_le_bytes());
    }

    #[test]
    fn group_task_changed_layout() {
        let bytes = GroupTaskChanged {
            event: GROUP_EVENT_TASK_REMOVED,
            task_group_id: 11,
            task_id: 22,
        }
        .encode();

        assert_eq!(&bytes[6..8], &GROUP_EVENT_TASK_REMOVED.to_le_bytes());
        assert_eq!(&bytes[8..16], &11u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &22u64.to_le_bytes());
    }
}
