// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Task groups.
//!
//! A group is a set of tasks, and doubles as a *rights namespace*:
//! the group's rights table is where send rights live, and a task's
//! active namespace is one of the groups it belongs to.
//!
//! Ports can watch a group: each watcher port carries an event mask
//! and receives a kernel message when a task joins or leaves, or
//! when the group is destroyed. A group dies when its last member
//! leaves.

use crate::port::{self, PortId, Right, RightId};
use crate::task::{Task, TaskId};
use abi::{
    Error, GroupDestroyed, GroupTaskChanged, GROUP_EVENT_TASK_ADDED, GROUP_EVENT_TASK_REMOVED,
    NOTIFY_ON_ADD, NOTIFY_ON_DESTROY, NOTIFY_ON_REMOVE,
};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::{lock, Mutex};

/// Uniquely identifies a task group throughout the kernel.
///
pub type TaskGroupId = u64;

lazy_static! {
    /// The global task group index.
    ///
    pub static ref GROUPS: Mutex<BTreeMap<TaskGroupId, Arc<TaskGroup>>> =
        Mutex::new(BTreeMap::new());
}

fn next_group_id() -> TaskGroupId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A group's table of send rights.
///
pub struct RightsTable {
    rights: BTreeMap<RightId, Right>,
    next_id: RightId,
}

impl RightsTable {
    fn new() -> Self {
        RightsTable {
            rights: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Allocates a fresh right id in this namespace.
    ///
    pub fn allocate_id(&mut self) -> RightId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Inserts a right under its id.
    ///
    pub fn insert(&mut self, right: Right) {
        self.rights.insert(right.id, right);
    }

    /// Returns the right with the given id, if present.
    ///
    pub fn get(&self, id: RightId) -> Option<Right> {
        self.rights.get(&id).copied()
    }

    /// Removes and returns the right with the given id.
    ///
    pub fn remove(&mut self, id: RightId) -> Option<Right> {
        self.rights.remove(&id)
    }

    /// Returns the number of rights in the table.
    ///
    pub fn len(&self) -> usize {
        self.rights.len()
    }

    /// Returns whether the table is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.rights.is_empty()
    }
}

struct GroupState {
    members: BTreeSet<TaskId>,
    watchers: BTreeMap<PortId, u32>,
    alive: bool,
}

/// A set of tasks, which is also a rights namespace.
///
pub struct TaskGroup {
    id: TaskGroupId,
    state: Mutex<GroupState>,
    rights: Mutex<RightsTable>,
}

impl TaskGroup {
    /// Creates a group containing the given task and registers
    /// it.
    ///
    pub fn create(first: &Arc<Task>) -> Arc<TaskGroup> {
        let group = Arc::new(TaskGroup {
            id: next_group_id(),
            state: Mutex::new(GroupState {
                members: {
                    let mut members = BTreeSet::new();
                    members.insert(first.id());
                    members
                },
                watchers: BTreeMap::new(),
                alive: true,
            }),
            rights: Mutex::new(RightsTable::new()),
        });

        first.add_group(group.id);
        lock!(GROUPS).insert(group.id, group.clone());
        group
    }

    /// Returns the group with the given id, or `None`.
    ///
    pub fn get(id: TaskGroupId) -> Option<Arc<TaskGroup>> {
        lock!(GROUPS).get(&id).cloned()
    }

    /// Returns the group's unique id.
    ///
    pub fn id(&self) -> TaskGroupId {
        self.id
    }

    /// Returns whether the given task belongs to the group.
    ///
    pub fn has_task(&self, task: TaskId) -> bool {
        let state = lock!(self.state);
        state.alive && state.members.contains(&task)
    }

    /// Returns the number of member tasks.
    ///
    pub fn member_count(&self) -> usize {
        lock!(self.state).members.len()
    }

    /// Adds a task to the group, notifying the watchers that
    /// selected join events.
    ///
    pub fn add_task(&self, task: &Arc<Task>) -> Result<(), Error> {
        let watchers = {
            let mut state = lock!(self.state);
            if !state.alive {
                return Err(Error::NoSuchObject);
            }

            if !state.members.insert(task.id()) {
                return Err(Error::AlreadyExists);
            }

            watcher_ports(&state, NOTIFY_ON_ADD)
        };

        task.add_group(self.id);
        self.notify_task_changed(&watchers, GROUP_EVENT_TASK_ADDED, task.id());
        Ok(())
    }

    /// Removes a task from the group, notifying the watchers
    /// that selected leave events. The group is destroyed when
    /// its last member leaves.
    ///
    pub fn remove_task(&self, task: TaskId) -> Result<(), Error> {
        let (watchers, destroyed) = {
            let mut state = lock!(self.state);
            if !state.alive {
                return Err(Error::NoSuchObject);
            }

            if !state.members.remove(&task) {
                return Err(Error::NoSuchObject);
            }

            let watchers = watcher_ports(&state, NOTIFY_ON_REMOVE);
            let destroyed = state.members.is_empty();
            if destroyed {
                state.alive = false;
            }

            (watchers, destroyed)
        };

        if let Some(member) = Task::get(task) {
            member.remove_group(self.id);
        }

        self.notify_task_changed(&watchers, GROUP_EVENT_TASK_REMOVED, task);

        if destroyed {
            self.destroy();
        }

        Ok(())
    }

    /// Registers `port` as a watcher with the given event mask,
    /// returning the previous mask. A zero mask removes the
    /// watcher.
    ///
    pub fn set_notify_mask(&self, port: PortId, mask: u32) -> Result<u32, Error> {
        let mut state = lock!(self.state);
        if !state.alive {
            return Err(Error::NoSuchObject);
        }

        let previous = if mask == 0 {
            state.watchers.remove(&port)
        } else {
            state.watchers.insert(port, mask)
        };

        Ok(previous.unwrap_or(0))
    }

    /// Runs `f` on the group's rights table.
    ///
    pub fn with_rights<R>(&self, f: impl FnOnce(&mut RightsTable) -> R) -> R {
        f(&mut *lock!(self.rights))
    }

    // Tears the group down: deregisters it, drops its rights,
    // and fires the destruction notifications.
    fn destroy(&self) {
        lock!(GROUPS).remove(&self.id);
        self.with_rights(|rights| rights.rights.clear());

        let watchers = {
            let state = lock!(self.state);
            watcher_ports(&state, NOTIFY_ON_DESTROY)
        };

        let message = GroupDestroyed {
            task_group_id: self.id,
        };
        for port in watchers {
            let _ = port::send_kernel_message(port, &message.encode());
        }
    }

    fn notify_task_changed(&self, watchers: &[PortId], event: u16, task: TaskId) {
        let message = GroupTaskChanged {
            event,
            task_group_id: self.id,
            task_id: task,
        };
        for port in watchers {
            let _ = port::send_kernel_message(*port, &message.encode());
        }
    }
}

fn watcher_ports(state: &GroupState, mask_bit: u32) -> Vec<PortId> {
    state
        .watchers
        .iter()
        .filter(|(_, &mask)| mask & mask_bit != 0)
        .map(|(&port, _)| port)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::TaskGroup;
    use crate::port::{self, Port};
    use crate::task::Task;
    use abi::{
        Error, MSG_TYPE_GROUP_DESTROYED, MSG_TYPE_GROUP_TASK_CHANGED, NOTIFY_ON_ADD,
        NOTIFY_ON_DESTROY, NOTIFY_ON_REMOVE,
    };

    #[test]
    fn membership() {
        let alice = Task::create_for_test("alice");
        let bob = Task::create_for_test("bob");

        let group = TaskGroup::create(&alice);
        assert!(group.has_task(alice.id()));
        assert!(!group.has_task(bob.id()));
        assert_eq!(alice.group_ids(), [group.id()]);

        group.add_task(&bob).unwrap();
        assert_eq!(group.add_task(&bob).unwrap_err(), Error::AlreadyExists);
        assert!(group.has_task(bob.id()));
        assert_eq!(group.member_count(), 2);

        group.remove_task(bob.id()).unwrap();
        assert!(!group.has_task(bob.id()));
        assert!(bob.group_ids().is_empty());
        assert_eq!(group.remove_task(bob.id()).unwrap_err(), Error::NoSuchObject);
    }

    #[test]
    fn watcher_notifications() {
        let owner = Task::create_for_test("watcher owner");
        let member = Task::create_for_test("member");
        let joiner = Task::create_for_test("joiner");
        let watch_port = Port::create(owner.id());

        let group = TaskGroup::create(&member);
        group
            .set_notify_mask(
                watch_port.id(),
                NOTIFY_ON_ADD | NOTIFY_ON_REMOVE | NOTIFY_ON_DESTROY,
            )
            .unwrap();

        group.add_task(&joiner).unwrap();
        let added = watch_port.pop_message(owner.id()).unwrap();
        assert_eq!(
            &added.payload[..4],
            &MSG_TYPE_GROUP_TASK_CHANGED.to_le_bytes()
        );
        assert_eq!(&added.payload[16..24], &joiner.id().to_le_bytes());

        group.remove_task(joiner.id()).unwrap();
        let removed = watch_port.pop_message(owner.id()).unwrap();
        assert_eq!(
            &removed.payload[..4],
            &MSG_TYPE_GROUP_TASK_CHANGED.to_le_bytes()
        );

        // Removing the last member destroys the group and fires
        // the destruction notification.
        let group_id = group.id();
        group.remove_task(member.id()).unwrap();
        let removed = watch_port.pop_message(owner.id()).unwrap();
        assert_eq!(
            &removed.payload[..4],
            &MSG_TYPE_GROUP_TASK_CHANGED.to_le_bytes()
        );
        let destroyed = watch_port.pop_message(owner.id()).unwrap();
        assert_eq!(
            &destroyed.payload[..4],
            &MSG_TYPE_GROUP_DESTROYED.to_le_bytes()
        );
        assert_eq!(&destroyed.payload[8..16], &group_id.to_le_bytes());

        assert!(TaskGroup::get(group_id).is_none());
        port::destroy_port(watch_port.id());
    }
}
