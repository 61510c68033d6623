// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A buddy allocator over a process-shared memory segment, plus the
// primitives it is built from: offset arithmetic, an offset-based intrusive
// list, process-shared shared memory, and process-shared mutex/rwlock
// initialization. Binary layout is stable across processes that map the
// same segment at different virtual addresses.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod rw_lock;
pub use rw_lock::RwLock;

mod spin_lock;
pub use spin_lock::SpinLock;

mod scoped_access;
pub use scoped_access::ScopedAccess;

mod offset;
pub use offset::{Base, Offset, NULL_OFFSET};

mod list;

mod buddy;
pub use buddy::{ClassStats, Segment, SegmentStats, MAX_CLASS, MIN_CLASS};
