// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Ports, send rights, and messages.
//!
//! A [`Port`] is an owner-bound FIFO of messages: any holder of a
//! send right can append, only the owning task may peek or pop.
//! Rights are named by per-group ids and live in the rights table of
//! a task group (the sender's *rights namespace*); a right travelling
//! inside a message belongs to no namespace until the receiver
//! accepts it, at which point it appears in the receiver's namespace
//! under a fresh id.
//!
//! [`send_message_right`] is the subsystem's atomic operation: the
//! sending right, the optional reply right and up to four auxiliary
//! rights either all move with the message, or nothing is observable
//! at all.
//!
//! Ports can also be published under a global name; tasks looking a
//! name up may block until it appears.

use crate::group::TaskGroup;
use crate::task::{Task, TaskId};
use abi::{Error, MessageDescriptor, MESSAGE_FLAG_REPLY_RIGHT, MESSAGE_FLAG_REPLY_SEND_MANY};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::{lock, Mutex};

/// Uniquely identifies a port throughout the kernel.
///
pub type PortId = u64;

/// Identifies a right within one rights namespace.
///
pub type RightId = u64;

lazy_static! {
    /// The global port index.
    ///
    pub static ref PORTS: Mutex<BTreeMap<PortId, Arc<Port>>> = Mutex::new(BTreeMap::new());

    // The published port names, and the tasks blocked waiting
    // for names to appear.
    static ref NAMED_PORTS: Mutex<BTreeMap<Vec<u8>, PortId>> = Mutex::new(BTreeMap::new());
    static ref NAME_WAITERS: Mutex<Vec<TaskId>> = Mutex::new(Vec::new());
}

fn next_port_id() -> PortId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Whether a right survives being used.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RightKind {
    /// Consumed by its first send.
    SendOnce,

    /// Usable until explicitly deleted.
    SendMany,
}

/// A send right, resident in some group's rights table.
///
#[derive(Clone, Copy, Debug)]
pub struct Right {
    /// The right's id within its namespace.
    pub id: RightId,

    /// Whether the right survives being used.
    pub kind: RightKind,

    /// The port the right sends to.
    pub port: PortId,
}

/// A right in flight inside a message, not yet bound to any
/// namespace.
///
#[derive(Clone, Copy, Debug)]
pub struct PendingRight {
    /// Whether the right survives being used.
    pub kind: RightKind,

    /// The port the right sends to.
    pub port: PortId,
}

/// A message queued on a port.
///
#[derive(Debug)]
pub struct Message {
    /// The sending task, or zero for the kernel.
    pub sender: TaskId,

    /// The sender's id of the right the message was sent with,
    /// or zero.
    pub sent_with_right: RightId,

    /// A memory object attached to the message, or zero.
    pub mem_object_id: u64,

    /// The message bytes.
    pub payload: Vec<u8>,

    /// A right to reply to the sender, if one was attached.
    pub reply_right: Option<PendingRight>,

    /// Auxiliary rights travelling with the message,
    /// unaccepted.
    pub aux_rights: [Option<PendingRight>; 4],
}

impl Message {
    fn from_kernel(payload: Vec<u8>) -> Message {
        Message {
            sender: 0,
            sent_with_right: 0,
            mem_object_id: 0,
            payload,
            reply_right: None,
            aux_rights: [None; 4],
        }
    }

    fn descriptor(&self) -> MessageDescriptor {
        let mut flags = 0;
        if let Some(reply) = &self.reply_right {
            flags |= MESSAGE_FLAG_REPLY_RIGHT;
            if reply.kind == RightKind::SendMany {
                flags |= MESSAGE_FLAG_REPLY_SEND_MANY;
            }
        }

        MessageDescriptor {
            sender: self.sender,
            mem_object: self.mem_object_id,
            size: self.payload.len() as u64,
            sent_with_right: self.sent_with_right,
            other_rights_count: self.aux_rights.iter().flatten().count() as u32,
            flags,
        }
    }
}

/// An owner-bound FIFO message queue.
///
pub struct Port {
    id: PortId,
    owner: TaskId,
    queue: Mutex<VecDeque<Message>>,
}

impl Port {
    /// Creates a port owned by the given task and registers it.
    ///
    pub fn create(owner: TaskId) -> Arc<Port> {
        let port = Arc::new(Port {
            id: next_port_id(),
            owner,
            queue: Mutex::new(VecDeque::new()),
        });

        lock!(PORTS).insert(port.id, port.clone());
        if let Some(task) = Task::get(owner) {
            task.add_owned_port(port.id);
        }

        port
    }

    /// Returns the port with the given id, or `None`.
    ///
    pub fn get(id: PortId) -> Option<Arc<Port>> {
        lock!(PORTS).get(&id).cloned()
    }

    /// Returns the port's unique id.
    ///
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Returns the owning task's id.
    ///
    pub fn owner(&self) -> TaskId {
        self.owner
    }

    /// Returns the number of queued messages.
    ///
    pub fn queue_len(&self) -> usize {
        lock!(self.queue).len()
    }

    // Appends a message and wakes the owner if it is blocked on
    // this port.
    fn enqueue(&self, message: Message) {
        lock!(self.queue).push_back(message);

        if let Some(owner) = Task::get(self.owner) {
            owner.atomic_unblock_if_blocked_on(self.id);
        }
    }

    /// Describes the front message without popping it. Only the
    /// owner may look.
    ///
    pub fn peek_info(&self, caller: TaskId) -> Result<MessageDescriptor, Error> {
        if caller != self.owner {
            return Err(Error::NotPermitted);
        }

        let queue = lock!(self.queue);
        queue.front().map(|m| m.descriptor()).ok_or(Error::NoMessages)
    }

    /// Returns a copy of the front message's payload. Only the
    /// owner may look.
    ///
    pub fn peek_payload(&self, caller: TaskId) -> Result<Vec<u8>, Error> {
        if caller != self.owner {
            return Err(Error::NotPermitted);
        }

        let queue = lock!(self.queue);
        queue.front().map(|m| m.payload.clone()).ok_or(Error::NoMessages)
    }

    /// Pops and returns the front message, rights and all. Only
    /// the owner may pop.
    ///
    pub fn pop_message(&self, caller: TaskId) -> Result<Message, Error> {
        if caller != self.owner {
            return Err(Error::NotPermitted);
        }

        lock!(self.queue).pop_front().ok_or(Error::NoMessages)
    }
}

/// Sends a kernel-originated message (sender id zero) to the
/// port.
///
pub fn send_kernel_message(port: PortId, payload: &[u8]) -> Result<(), Error> {
    let port = Port::get(port).ok_or(Error::NoSuchObject)?;
    port.enqueue(Message::from_kernel(payload.to_vec()));
    Ok(())
}

/// Destroys a port: removes it from the index and from the name
/// registry, drops its queued messages (and the rights inside
/// them), and wakes an owner blocked on it so its receive fails
/// over.
///
pub fn destroy_port(id: PortId) -> Option<Arc<Port>> {
    let port = lock!(PORTS).remove(&id)?;
    lock!(NAMED_PORTS).retain(|_, &mut named| named != id);
    lock!(port.queue).clear();

    if let Some(owner) = Task::get(port.owner) {
        owner.remove_owned_port(id);
        owner.atomic_unblock_if_blocked_on(id);
    }

    Some(port)
}

/// Creates a send right over `port` in `group`'s rights table.
/// Only the port's owner may mint rights to it.
///
pub fn create_right(
    port: &Port,
    caller: TaskId,
    group: &Arc<TaskGroup>,
    kind: RightKind,
) -> Result<RightId, Error> {
    if caller != port.owner {
        return Err(Error::NotPermitted);
    }

    group.with_rights(|rights| {
        let id = rights.allocate_id();
        rights.insert(Right {
            id,
            kind,
            port: port.id,
        });
        Ok(id)
    })
}

/// Deletes a send right from the caller's rights namespace.
///
pub fn delete_send_right(caller: &Task, right_id: RightId) -> Result<(), Error> {
    let group = caller
        .rights_namespace()
        .and_then(TaskGroup::get)
        .ok_or(Error::NoSuchObject)?;

    group.with_rights(|rights| {
        rights.remove(right_id).map(|_| ()).ok_or(Error::NoSuchObject)
    })
}

/// How [`send_message_right`] failed.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// A failure unrelated to the auxiliary rights.
    Plain(Error),

    /// The auxiliary right at this argument index did not
    /// resolve.
    AuxRight(usize),
}

impl From<Error> for SendFailure {
    fn from(err: Error) -> SendFailure {
        SendFailure::Plain(err)
    }
}

/// Sends `payload` through the right `right_id` in the caller's
/// rights namespace.
///
/// If `reply_port` is given (and owned by the caller), a reply
/// right to it travels with the message; `reply_many` makes it
/// send-many instead of send-once. The up-to-four `aux_rights`
/// (zero meaning absent) move with the message, unaccepted. The
/// sending right is consumed if it is send-once or
/// `delete_right` is set.
///
/// The operation either fully succeeds or leaves every right
/// where it was.
///
pub fn send_message_right(
    caller: &Arc<Task>,
    right_id: RightId,
    reply_port: Option<PortId>,
    payload: Vec<u8>,
    aux_rights: [RightId; 4],
    reply_many: bool,
    delete_right: bool,
) -> Result<(), SendFailure> {
    let group = caller
        .rights_namespace()
        .and_then(TaskGroup::get)
        .ok_or(Error::NoSuchObject)?;

    // Validate the reply port first: it must be the caller's.
    let reply_pending = match reply_port {
        None => None,
        Some(reply_id) => {
            let reply = Port::get(reply_id).ok_or(Error::NoSuchObject)?;
            if reply.owner() != caller.id() {
                return Err(SendFailure::Plain(Error::NotPermitted));
            }

            Some(PendingRight {
                kind: if reply_many {
                    RightKind::SendMany
                } else {
                    RightKind::SendOnce
                },
                port: reply_id,
            })
        }
    };

    // Find the destination port without yet consuming anything.
    let target_id = group.with_rights(|rights| {
        rights.get(right_id).map(|right| right.port).ok_or(Error::NoSuchObject)
    })?;
    let target = Port::get(target_id).ok_or(Error::NoSuchObject)?;

    // Atomically consume the sending right (if due) and move the
    // auxiliary rights out of the namespace. Everything is
    // checked before anything is touched, so a failure leaves
    // the table unchanged.
    let moved = group.with_rights(|rights| {
        let sending = rights.get(right_id).ok_or(SendFailure::Plain(Error::NoSuchObject))?;
        for (index, &aux) in aux_rights.iter().enumerate() {
            if aux != 0 && rights.get(aux).is_none() {
                return Err(SendFailure::AuxRight(index));
            }
        }

        let mut pending = [None; 4];
        for (index, &aux) in aux_rights.iter().enumerate() {
            if aux != 0 {
                let right = rights.remove(aux).expect("aux right checked above");
                pending[index] = Some(PendingRight {
                    kind: right.kind,
                    port: right.port,
                });
            }
        }

        if sending.kind == RightKind::SendOnce || delete_right {
            rights.remove(right_id);
        }

        Ok(pending)
    })?;

    target.enqueue(Message {
        sender: caller.id(),
        sent_with_right: right_id,
        mem_object_id: 0,
        payload,
        reply_right: reply_pending,
        aux_rights: moved,
    });

    Ok(())
}

/// Sends `payload` directly to a port by id, without a send
/// right. This is the legacy path used before a server has
/// handed out rights, most prominently right after a named-port
/// lookup.
///
/// `reply_right_id` optionally names a right in the caller's
/// namespace (typically one over the caller's own port) to
/// travel as the message's reply right; it moves out of the
/// caller's namespace atomically with the send.
///
pub fn send_message_port(
    caller: &Arc<Task>,
    port: PortId,
    payload: Vec<u8>,
    reply_right_id: Option<RightId>,
) -> Result<(), Error> {
    let target = Port::get(port).ok_or(Error::NoSuchObject)?;

    let reply_pending = match reply_right_id {
        None => None,
        Some(right_id) => {
            let group = caller
                .rights_namespace()
                .and_then(TaskGroup::get)
                .ok_or(Error::NoSuchObject)?;
            let right = group
                .with_rights(|rights| rights.remove(right_id))
                .ok_or(Error::NoSuchObject)?;
            Some(PendingRight {
                kind: right.kind,
                port: right.port,
            })
        }
    };

    target.enqueue(Message {
        sender: caller.id(),
        sent_with_right: 0,
        mem_object_id: 0,
        payload,
        reply_right: reply_pending,
        aux_rights: [None; 4],
    });

    Ok(())
}

/// Completes a receive: pops the front message and, unless
/// `reject_right` is set, adopts its reply right into the
/// caller's rights namespace. Returns the popped message and
/// the adopted right's new id (zero if there was none).
///
/// The adopted right is visible in the namespace before the
/// message leaves the queue.
///
pub fn finish_receive(
    port: &Port,
    caller: &Arc<Task>,
    reject_right: bool,
) -> Result<(Message, RightId), Error> {
    if caller.id() != port.owner {
        return Err(Error::NotPermitted);
    }

    let mut queue = lock!(port.queue);
    let front = queue.front_mut().ok_or(Error::NoMessages)?;

    let mut adopted = 0;
    if !reject_right {
        if let Some(reply) = front.reply_right.take() {
            let group = caller
                .rights_namespace()
                .and_then(TaskGroup::get)
                .ok_or(Error::NoSuchObject)?;
            adopted = group.with_rights(|rights| {
                let id = rights.allocate_id();
                rights.insert(Right {
                    id,
                    kind: reply.kind,
                    port: reply.port,
                });
                id
            });
        }
    } else {
        front.reply_right = None;
    }

    let message = queue.pop_front().expect("front message exists");
    Ok((message, adopted))
}

/// Adopts the auxiliary rights of the front message into the
/// caller's rights namespace, returning their new ids (zero
/// where there was no right). The message stays queued.
///
pub fn accept_rights(port: &Port, caller: &Arc<Task>) -> Result<[RightId; 4], Error> {
    if caller.id() != port.owner {
        return Err(Error::NotPermitted);
    }

    let group = caller
        .rights_namespace()
        .and_then(TaskGroup::get)
        .ok_or(Error::NoSuchObject)?;

    let mut queue = lock!(port.queue);
    let front = queue.front_mut().ok_or(Error::NoMessages)?;

    let mut ids = [0; 4];
    group.with_rights(|rights| {
        for (slot, id) in front.aux_rights.iter_mut().zip(ids.iter_mut()) {
            if let Some(pending) = slot.take() {
                let new_id = rights.allocate_id();
                rights.insert(Right {
                    id: new_id,
                    kind: pending.kind,
                    port: pending.port,
                });
                *id = new_id;
            }
        }
    });

    Ok(ids)
}

/// Publishes `port` under `name`, waking every task blocked
/// waiting for a name to appear.
///
pub fn name_port(name: &[u8], port: PortId) -> Result<(), Error> {
    if Port::get(port).is_none() {
        return Err(Error::NoSuchObject);
    }

    {
        let mut named = lock!(NAMED_PORTS);
        if named.contains_key(name) {
            return Err(Error::AlreadyExists);
        }

        named.insert(name.to_vec(), port);
    }

    // Name waiters re-run their lookup on wake; waking all of
    // them trades a little noise for not tracking names per
    // waiter.
    let waiters = core::mem::take(&mut *lock!(NAME_WAITERS));
    for tid in waiters {
        if let Some(task) = Task::get(tid) {
            task.atomic_unblock_if_waiting_for_name();
        }
    }

    Ok(())
}

/// Looks a port up by name.
///
pub fn get_port_by_name(name: &[u8]) -> Option<PortId> {
    lock!(NAMED_PORTS).get(name).copied()
}

/// Registers the calling task as waiting for a name to be
/// published. The caller blocks afterwards; `name_port` wakes
/// it.
///
pub fn register_name_waiter(tid: TaskId) {
    lock!(NAME_WAITERS).push(tid);
}
