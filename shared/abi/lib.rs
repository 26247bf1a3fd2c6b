// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The contract between the Kestrel kernel and userspace.
//!
//! This crate defines the syscall numbers, the error taxonomy with its
//! errno mapping, the flag bits taken by individual syscalls, and the
//! wire-stable layouts of the messages the kernel itself sends to user
//! ports. Everything here is shared with the user-side system library,
//! so the crate has no dependencies and no unsafe code; wire structs
//! encode themselves explicitly as little-endian bytes rather than
//! relying on in-memory layout.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

mod messages;

pub use messages::{
    GroupDestroyed, GroupTaskChanged, KernelInterrupt, KernelRequestPage, MessageDescriptor,
    NamedPortNotification, TimerReply, GROUP_EVENT_TASK_ADDED, GROUP_EVENT_TASK_REMOVED,
    MESSAGE_FLAG_REPLY_RIGHT, MESSAGE_FLAG_REPLY_SEND_MANY, MSG_TYPE_GROUP_DESTROYED,
    MSG_TYPE_GROUP_TASK_CHANGED, MSG_TYPE_INTERRUPT, MSG_TYPE_NAMED_PORT, MSG_TYPE_REQUEST_PAGE,
    MSG_TYPE_TIMER_REPLY,
};

/// The number of entries in the syscall dispatch table.
///
pub const SYSCALL_COUNT: usize = 55;

/// Refers to the calling task where a syscall takes a task id.
///
pub const TASK_ID_SELF: u64 = 0;

/// Do not block; fail with [`Error::WouldBlock`] instead.
///
pub const FLAG_NOBLOCK: u32 = 0x01;

/// `get_first_message`: read the message without popping it.
///
pub const MSG_ARG_NOPOP: u32 = 0x01;

/// `get_first_message`: discard the reply right instead of
/// accepting it into the caller's rights namespace.
///
pub const MSG_ARG_REJECT_RIGHT: u32 = 0x02;

/// `create_right`: the right is consumed by its first send.
///
pub const CREATE_RIGHT_SEND_ONCE: u32 = 0x01;

/// `send_message_right`: create the reply right as send-many
/// instead of send-once.
///
pub const REPLY_CREATE_SEND_MANY: u32 = 0x01;

/// `send_message_right`: delete the sending right afterwards,
/// whatever its kind.
///
pub const SEND_MESSAGE_DELETE_RIGHT: u32 = 0x02;

/// `set_namespace`: the namespace being switched is the
/// rights namespace.
///
pub const NAMESPACE_RIGHTS: u32 = 0x01;

/// Watcher mask bit: notify when the group is destroyed.
///
pub const NOTIFY_ON_DESTROY: u32 = 0x01;

/// Watcher mask bit: notify when a task joins the group.
///
pub const NOTIFY_ON_ADD: u32 = 0x02;

/// Watcher mask bit: notify when a task leaves the group.
///
pub const NOTIFY_ON_REMOVE: u32 = 0x04;

/// The set of syscalls implemented by the kernel.
///
/// The numerical values are the dispatch table indices and are
/// wire-stable. Gaps are unassigned entries, which fail with
/// [`Error::NotSupported`].
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Record the exit code and mark the calling task Dying.
    Exit = 0,

    /// Return the calling task's id.
    GetTaskId = 1,

    /// Create a new task in the Uninit state, with no address space.
    CreateProcess = 2,

    /// Set the entry point and initial arguments of an Uninit task
    /// and make it Ready.
    StartProcess = 3,

    /// Create a default stack region in the target task's address
    /// space and point its stack register at it.
    InitStack = 4,

    /// Change a task's scheduling priority.
    SetPriority = 5,

    /// Name a task, for diagnostics.
    SetTaskName = 6,

    /// Peek the front message of an owned port.
    GetMessageInfo = 9,

    /// Copy out the front message of an owned port, optionally
    /// popping it and accepting its reply right.
    GetFirstMessage = 10,

    /// Send a message through a send right, optionally carrying a
    /// reply right and up to four auxiliary rights.
    SendMessageRight = 11,

    /// Accept the auxiliary rights of the front message into the
    /// caller's rights namespace.
    AcceptRights = 12,

    /// Create a port owned by the given task.
    CreatePort = 13,

    /// Publish a port under a global name.
    NamePort = 14,

    /// Look a port up by name, blocking until it is published
    /// unless `FLAG_NOBLOCK` is given.
    GetPortByName = 15,

    /// Create a send right over an owned port, in the caller's
    /// rights namespace.
    CreateRight = 16,

    /// Switch the caller's active rights namespace to a group it
    /// belongs to.
    SetNamespace = 17,

    /// Set the port receiving the kernel's log stream.
    SetLogPort = 18,

    /// Send a message directly to a port by id, optionally
    /// attaching a reply right from the caller's namespace.
    SendMessagePort = 20,

    /// Atomically move a region between two address spaces.
    TransferRegion = 21,

    /// Create an anonymous memory region.
    CreateNormalRegion = 22,

    /// Delete a send right from the caller's rights namespace.
    DeleteSendRight = 23,

    /// Map a physical range (privileged).
    CreatePhysMapRegion = 24,

    /// Delete a region, invalidating its mappings.
    DeleteRegion = 25,

    /// Create an anonymous pageable memory object.
    CreateMemObject = 30,

    /// Create a task group containing the calling task.
    CreateTaskGroup = 31,

    /// Add a task to a group.
    AddTaskToGroup = 32,

    /// Remove a task from a group.
    RemoveTaskFromGroup = 33,

    /// Query group membership.
    TaskInGroup = 34,

    /// Register a port as a watcher of a task group.
    SetNotifyMask = 35,

    /// Load an ELF executable from a memory object into a task.
    LoadExecutable = 36,

    /// Arm a one-shot timer that fires on a port.
    RequestTimer = 37,

    /// Bind a task to a CPU, or to no CPU in particular.
    SetAffinity = 38,

    /// Voluntarily reschedule.
    Yield = 40,

    /// Create a region backed by a memory object.
    MapMemObject = 41,

    /// Return nanoseconds since boot.
    GetTime = 43,

    /// Mark the target task Dying.
    KillTask = 45,

    /// Take a task off the scheduler.
    PauseTask = 46,

    /// Make a paused task runnable again.
    ResumeTask = 47,

    /// Return the physical address backing a virtual address
    /// of the caller.
    GetPageAddress = 48,

    /// Drop the caller's reference to a memory object.
    ReleaseMemObject = 49,

    /// Return the physical address of a page of a memory object.
    GetPageAddressFromObject = 50,
    // Ensure new values are added to from_u64 and to the
    // numerical-conversion test below.
}

impl Syscall {
    /// Returns the syscall with the given numerical value, or None.
    ///
    pub fn from_u64(num: u64) -> Option<Self> {
        match num {
            0 => Some(Self::Exit),
            1 => Some(Self::GetTaskId),
            2 => Some(Self::CreateProcess),
            3 => Some(Self::StartProcess),
            4 => Some(Self::InitStack),
            5 => Some(Self::SetPriority),
            6 => Some(Self::SetTaskName),
            9 => Some(Self::GetMessageInfo),
            10 => Some(Self::GetFirstMessage),
            11 => Some(Self::SendMessageRight),
            12 => Some(Self::AcceptRights),
            13 => Some(Self::CreatePort),
            14 => Some(Self::NamePort),
            15 => Some(Self::GetPortByName),
            16 => Some(Self::CreateRight),
            17 => Some(Self::SetNamespace),
            18 => Some(Self::SetLogPort),
            20 => Some(Self::SendMessagePort),
            21 => Some(Self::TransferRegion),
            22 => Some(Self::CreateNormalRegion),
            23 => Some(Self::DeleteSendRight),
            24 => Some(Self::CreatePhysMapRegion),
            25 => Some(Self::DeleteRegion),
            30 => Some(Self::CreateMemObject),
            31 => Some(Self::CreateTaskGroup),
            32 => Some(Self::AddTaskToGroup),
            33 => Some(Self::RemoveTaskFromGroup),
            34 => Some(Self::TaskInGroup),
            35 => Some(Self::SetNotifyMask),
            36 => Some(Self::LoadExecutable),
            37 => Some(Self::RequestTimer),
            38 => Some(Self::SetAffinity),
            40 => Some(Self::Yield),
            41 => Some(Self::MapMemObject),
            43 => Some(Self::GetTime),
            45 => Some(Self::KillTask),
            46 => Some(Self::PauseTask),
            47 => Some(Self::ResumeTask),
            48 => Some(Self::GetPageAddress),
            49 => Some(Self::ReleaseMemObject),
            50 => Some(Self::GetPageAddressFromObject),
            _ => None,
        }
    }
}

/// The kernel-wide error taxonomy.
///
/// Core operations return these; the syscall layer translates them
/// into negative errnos with [`Error::to_errno`].
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// No physical or kernel-virtual memory left.
    OutOfMemory,

    /// No free virtual address range large enough.
    NoFreeRegion,

    /// The requested virtual range overlaps an existing region.
    RegionOccupied,

    /// An executable or data blob exceeds what can be mapped.
    FileTooBig,

    /// The task id does not name a live task.
    NoSuchTask,

    /// The id does not name a live port, right, group or
    /// memory object.
    NoSuchObject,

    /// The name or id is already taken.
    AlreadyExists,

    /// The caller does not own the object it is operating on.
    NotPermitted,

    /// The access violates the region's permissions.
    ProtectionViolation,

    /// The task has already been started.
    ProcessInited,

    /// The task already has an address space.
    HasPageTable,

    /// The task is already blocked.
    AlreadyBlocked,

    /// The object is in use.
    Busy,

    /// Malformed input (bad ELF, bad message).
    BadFormat,

    /// An offset or size is out of bounds.
    OutOfRange,

    /// A malformed argument.
    InvalidArgument,

    /// A mapping already exists at the address.
    PagePresent,

    /// No mapping exists at the address.
    PageNotPresent,

    /// The address is not backed by any region.
    PageNotAllocated,

    /// The walk ran into a huge-page entry.
    HugePage,

    /// Recognised but unimplemented operation.
    NotImplemented,

    /// Unknown operation.
    NotSupported,

    /// The operation would block and `FLAG_NOBLOCK` was given.
    WouldBlock,

    /// The port's queue is empty.
    NoMessages,
}

impl Error {
    /// Returns the negative POSIX errno reported to userspace for
    /// this error.
    ///
    pub fn to_errno(self) -> i64 {
        match self {
            Error::OutOfMemory | Error::NoFreeRegion => -12, // ENOMEM
            Error::RegionOccupied
            | Error::AlreadyExists
            | Error::HasPageTable
            | Error::PagePresent => -17, // EEXIST
            Error::FileTooBig => -27,                        // EFBIG
            Error::NoSuchTask => -3,                         // ESRCH
            Error::NoSuchObject | Error::PageNotPresent => -2, // ENOENT
            Error::NotPermitted => -1,                       // EPERM
            Error::ProtectionViolation => -13,               // EACCES
            Error::ProcessInited | Error::AlreadyBlocked | Error::Busy => -16, // EBUSY
            Error::BadFormat => -8,                          // ENOEXEC
            Error::OutOfRange => -34,                        // ERANGE
            Error::InvalidArgument => -22,                   // EINVAL
            Error::PageNotAllocated => -14,                  // EFAULT
            Error::HugePage => -95,                          // EOPNOTSUPP
            Error::NotImplemented => -38,                    // ENOSYS
            Error::NotSupported => -95,                      // EOPNOTSUPP
            Error::WouldBlock | Error::NoMessages => -11,    // EAGAIN
        }
    }
}
