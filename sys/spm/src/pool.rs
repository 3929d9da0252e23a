// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection-handle pool.
//!
//! Connections live in a fixed slab threaded with a free list. The handle a
//! client sees packs a tag, the slot's generation and the slot index:
//!
//! ```text
//!  31 30      16 15     8 7      0
//! +--+----------+--------+--------+
//! |0 | 0x4000   |  gen   |  index |
//! +--+----------+--------+--------+
//! ```
//!
//! The tag keeps handles positive, nonzero and unlike any PSA status. The
//! generation is bumped each time a slot is freed, so a handle kept past its
//! connection's lifetime stops validating rather than naming the next
//! occupant.

use abi::PSA_NULL_HANDLE;

use crate::msg::{MsgBody, MSG_MAGIC};

/// Number of connections the SPM can hold at once.
pub const CONN_HANDLE_MAX_NUM: usize = 16;

const HANDLE_TAG: i32 = 0x4000_0000;
const HANDLE_TAG_MASK: i32 = 0x7FFF_0000;

static_assertions::const_assert!(CONN_HANDLE_MAX_NUM <= 256);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnStatus {
    /// No message in flight.
    Idle,
    /// A message is queued or being handled.
    Active,
    /// A non-secure client was told it made a programmer error. Calls fail
    /// until it closes the handle.
    ConnectError,
}

#[derive(Copy, Clone, Debug)]
pub struct Connection {
    pub status: ConnStatus,
    pub client_id: i32,
    /// Index of the connected service.
    pub service: usize,
    /// Reverse handle set by the service.
    pub rhandle: usize,
    pub msg: MsgBody,
}

#[derive(Copy, Clone, Debug)]
enum Slot {
    Free { next: Option<u8> },
    Used(Connection),
}

#[derive(Copy, Clone, Debug)]
struct Entry {
    generation: u8,
    slot: Slot,
}

#[derive(Debug)]
pub struct ConnPool {
    entries: [Entry; CONN_HANDLE_MAX_NUM],
    free_head: Option<u8>,
    in_use: usize,
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnPool {
    pub fn new() -> Self {
        let entries = core::array::from_fn(|i| Entry {
            generation: 0,
            slot: Slot::Free {
                next: if i + 1 < CONN_HANDLE_MAX_NUM {
                    Some((i + 1) as u8)
                } else {
                    None
                },
            },
        });
        Self {
            entries,
            free_head: Some(0),
            in_use: 0,
        }
    }

    /// Allocates a connection between `client_id` and `service`, returning
    /// its slot index, or `None` if the pool is exhausted.
    pub fn alloc(&mut self, client_id: i32, service: usize) -> Option<usize> {
        let idx = usize::from(self.free_head?);
        let entry = &mut self.entries[idx];
        let Slot::Free { next } = entry.slot else {
            // The free list points at a used slot; treat it as exhausted
            // rather than hand out a live connection twice.
            return None;
        };
        self.free_head = next;

        let mut msg = MsgBody::empty(idx, service);
        msg.magic = MSG_MAGIC;
        entry.slot = Slot::Used(Connection {
            status: ConnStatus::Idle,
            client_id,
            service,
            rhandle: 0,
            msg,
        });
        self.in_use += 1;
        Some(idx)
    }

    /// Frees a connection, invalidating every handle to it. Returns the
    /// connection as it was, or `None` if the slot wasn't in use.
    pub fn free(&mut self, idx: usize) -> Option<Connection> {
        let entry = self.entries.get_mut(idx)?;
        let Slot::Used(mut conn) = entry.slot else {
            return None;
        };
        conn.msg.magic = 0;
        entry.slot = Slot::Free {
            next: self.free_head,
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.free_head = Some(idx as u8);
        self.in_use -= 1;
        Some(conn)
    }

    /// Handle value naming the connection in slot `idx`.
    pub fn handle_of(&self, idx: usize) -> i32 {
        match self.entries.get(idx) {
            Some(e) => HANDLE_TAG | i32::from(e.generation) << 8 | idx as i32,
            None => PSA_NULL_HANDLE,
        }
    }

    /// Resolves a handle to a live connection slot, without regard to who
    /// owns it.
    pub fn lookup(&self, handle: i32) -> Option<usize> {
        if handle & HANDLE_TAG_MASK != HANDLE_TAG {
            return None;
        }
        let idx = (handle & 0xFF) as usize;
        let generation = ((handle >> 8) & 0xFF) as u8;
        let entry = self.entries.get(idx)?;
        match &entry.slot {
            Slot::Used(conn)
                if entry.generation == generation && conn.msg.magic == MSG_MAGIC =>
            {
                Some(idx)
            }
            _ => None,
        }
    }

    /// Resolves a handle presented by client `client_id`. Fails if the
    /// handle is stale, malformed, or belongs to another client.
    pub fn validate(&self, handle: i32, client_id: i32) -> Option<usize> {
        let idx = self.lookup(handle)?;
        match self.get(idx) {
            Some(conn) if conn.client_id == client_id => Some(idx),
            _ => None,
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Connection> {
        match &self.entries.get(idx)?.slot {
            Slot::Used(c) => Some(c),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Connection> {
        match &mut self.entries.get_mut(idx)?.slot {
            Slot::Used(c) => Some(c),
            Slot::Free { .. } => None,
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}
