// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure Partition Manager.
//!
//! This is the privileged core of the secure processing environment. It hosts
//! a fixed set of secure partitions, each exposing zero or more RoT services,
//! and brokers every interaction between clients (other partitions, or the
//! non-secure world) and those services: connection handles, message queues,
//! vector copies, signals, scheduling, and the exits to fault and reset.
//!
//! Code outside of `arch` and `startup` is portable and runs on the host,
//! where the tests drive it through [`hal::host::HostHal`].
//!
//! # Design principles
//!
//! 1. Static configuration. The set of partitions and services is fixed when
//!    the image is built and handed to [`state::SpmState::new`] once.
//! 2. Everything is an index. Threads, partitions, services and connections
//!    live in fixed arenas and refer to each other by position, never by
//!    pointer.
//! 3. Distrust callers. Any pointer handed in by a partition or by the
//!    non-secure world is checked before use, and tables of pointers are
//!    copied into SPM memory before they are checked.
//! 4. Programmer errors are fatal. There is no recovery path; a broken caller
//!    resets the system.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod trace;
#[macro_use]
pub mod arch;

pub mod err;
#[cfg(target_os = "none")]
pub mod fail;
pub mod hal;
pub mod invoke;
pub mod irq;
pub mod mailbox;
pub mod memcheck;
pub mod msg;
pub mod partition;
pub mod pool;
pub mod psa;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod startup;
pub mod state;
pub mod syscalls;
pub mod thread;
pub mod umem;

/// Upper bound on partitions in one image, including the non-secure one.
pub const MAX_PARTITIONS: usize = 16;

/// Upper bound on RoT services in one image.
pub const MAX_SERVICES: usize = 32;
