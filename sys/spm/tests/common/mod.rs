// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small image running on the host.
//!
//! Memory is one leaked, page-aligned arena carved into the regions an image
//! needs, so the SPM's access checks see real, dereferenceable addresses:
//!
//! ```text
//! 0x0000 +-----------------+ s-code
//!        | client code     |
//! 0x1000 | service code    |
//! 0x3000 | spm unpriv code |
//! 0x4000 +-----------------+ s-data
//!        | client data     |   stack 0x5000..0x6000
//! 0x6000 | service data    |   stack 0x7000..0x8000
//! 0xb000 | spm unpriv data |
//! 0xc000 +-----------------+ ns-code
//! 0xd000 +-----------------+ ns-data
//!        |                 |   stack 0xf000..0x10000
//! 0x10000+-----------------+
//! ```

#![allow(dead_code)]

use std::ops::Range;

use abi::{InvokeModel, PsaMsg, Sysnum, VersionPolicy, PSA_BLOCK};
use build_spmconfig::{
    IrqConfig, MemoryConfig, PartitionConfig, PartitionKind, ServiceConfig, SpmConfig,
};
use spm::hal::host::HostHal;
use spm::state::SpmState;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const ARENA_LEN: usize = 0x10000;

#[repr(C, align(4096))]
pub struct Arena([u8; ARENA_LEN]);

/// Partition indices.
pub const NS: usize = 0;
pub const CLIENT: usize = 1;
pub const SERVICE: usize = 2;

pub const NS_CLIENT_ID: i32 = -1;
pub const CLIENT_ID: i32 = 0x100;
pub const SERVICE_ID: i32 = 0x101;

/// Strict, version 1, open to the non-secure world.
pub const ECHO_SID: u32 = 0x1000;
pub const ECHO_SIGNAL: u32 = 0x10;
/// Relaxed, version 2, secure clients only.
pub const SECRET_SID: u32 = 0x1001;
pub const SECRET_SIGNAL: u32 = 0x20;
pub const SERVICE_SIGNALS: u32 = ECHO_SIGNAL | SECRET_SIGNAL;

pub const IRQ_LINE: u32 = 9;
pub const IRQ_SIGNAL: u32 = 0x100;
/// Service's handler for `IRQ_LINE`, run in the library model.
pub const IRQ_HANDLER: usize = 0x1201;
pub const MAILBOX_IRQ: u32 = 20;

/// Scratch areas each party may use.
pub const CLIENT_SCRATCH: usize = 0x4000;
pub const SERVICE_SCRATCH: usize = 0x6000;
pub const NS_SCRATCH: usize = 0xd000;

pub struct Rig {
    pub spm: SpmState<HostHal>,
    pub base: usize,
}

fn at(base: usize, r: Range<usize>) -> Range<usize> {
    base + r.start..base + r.end
}

fn config(base: usize, model: InvokeModel, isolation: u8) -> SpmConfig {
    let ns = PartitionConfig {
        name: "ns".into(),
        id: NS_CLIENT_ID,
        kind: PartitionKind::NonSecure,
        priority: 3,
        entry: base + 0xc001,
        code: at(base, 0xc000..0xd000),
        data: at(base, 0xd000..0x10000),
        stack: at(base, 0xf000..0x10000),
        dependencies: vec![],
        services: vec![],
        irqs: vec![],
    };
    let client = PartitionConfig {
        name: "client".into(),
        id: CLIENT_ID,
        kind: PartitionKind::AppRot,
        priority: 2,
        entry: base + 0x0001,
        code: at(base, 0x0000..0x1000),
        data: at(base, 0x4000..0x6000),
        stack: at(base, 0x5000..0x6000),
        dependencies: vec![ECHO_SID, SECRET_SID],
        services: vec![],
        irqs: vec![],
    };
    let service = PartitionConfig {
        name: "service".into(),
        id: SERVICE_ID,
        kind: PartitionKind::PsaRot,
        priority: 1,
        entry: base + 0x1001,
        code: at(base, 0x1000..0x2000),
        data: at(base, 0x6000..0x8000),
        stack: at(base, 0x7000..0x8000),
        dependencies: vec![],
        services: vec![
            ServiceConfig {
                name: "ECHO".into(),
                sid: ECHO_SID,
                version: 1,
                version_policy: VersionPolicy::Strict,
                signal: ECHO_SIGNAL,
                non_secure_client: true,
            },
            ServiceConfig {
                name: "SECRET".into(),
                sid: SECRET_SID,
                version: 2,
                version_policy: VersionPolicy::Relaxed,
                signal: SECRET_SIGNAL,
                non_secure_client: false,
            },
        ],
        irqs: vec![IrqConfig {
            line: IRQ_LINE,
            signal: IRQ_SIGNAL,
            handler: Some(base + IRQ_HANDLER),
        }],
    };

    SpmConfig {
        isolation_level: isolation,
        model,
        ns_client_id: NS_CLIENT_ID,
        memory: MemoryConfig {
            s_code: at(base, 0x0000..0x4000),
            s_data: at(base, 0x4000..0xc000),
            ns_code: at(base, 0xc000..0xd000),
            ns_data: at(base, 0xd000..0x10000),
            spm_unpriv_code: at(base, 0x3000..0x4000),
            spm_unpriv_data: at(base, 0xb000..0xc000),
        },
        partitions: vec![ns, client, service],
    }
}

impl Rig {
    pub fn new(model: InvokeModel, isolation: u8) -> Self {
        let arena: &'static mut Arena = Box::leak(Box::new(Arena([0; ARENA_LEN])));
        let base = arena.0.as_mut_ptr() as usize;
        let image = config(base, model, isolation).into_image().unwrap();
        let hal = HostHal::new(image.memory, image.isolation);
        let mut spm = SpmState::new(image, hal).unwrap();
        spm.start().unwrap();
        Self { spm, base }
    }

    /// An IPC image at isolation level 2, with the service thread running.
    pub fn ipc() -> Self {
        Self::new(InvokeModel::Ipc, 2)
    }

    pub fn addr(&self, offset: usize) -> usize {
        self.base + offset
    }

    pub fn poke(&self, addr: usize, bytes: &[u8]) {
        assert!(addr >= self.base && addr + bytes.len() <= self.base + ARENA_LEN);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    }

    pub fn peek(&self, addr: usize, len: usize) -> Vec<u8> {
        assert!(addr >= self.base && addr + len <= self.base + ARENA_LEN);
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }

    pub fn put<T: IntoBytes + Immutable>(&self, addr: usize, value: &T) {
        self.poke(addr, value.as_bytes());
    }

    pub fn get<T: FromBytes>(&self, addr: usize) -> T {
        T::read_from_bytes(&self.peek(addr, std::mem::size_of::<T>())).unwrap()
    }

    /// Runs pended context switches until there are none.
    pub fn settle(&mut self) {
        while self.spm.switch_pending() {
            self.spm.pendsv();
        }
    }

    /// Makes SPM call `nr` as partition `who`, which must be running, and
    /// returns what's in its return register afterwards. If the call blocked
    /// that's just the first argument.
    pub fn call(&mut self, who: usize, nr: Sysnum, args: [usize; 4]) -> usize {
        assert_eq!(self.spm.current(), Some(who), "partition {who} isn't running");
        self.spm.save_mut(who).load_syscall(nr as u32, args);
        self.spm.svc_entry();
        self.settle();
        self.ret(who)
    }

    /// Return register of partition `who`, as an `i32` status.
    pub fn status(&mut self, who: usize) -> i32 {
        self.ret(who) as u32 as i32
    }

    pub fn ret(&mut self, who: usize) -> usize {
        self.spm.save_mut(who).return_value()
    }
}

/// Parks the service in `psa_wait` on both its services, letting lower
/// priorities run.
pub fn service_wait(rig: &mut Rig) {
    rig.call(SERVICE, Sysnum::Wait, [SERVICE_SIGNALS as usize, PSA_BLOCK as usize, 0, 0]);
}

pub fn service_get(rig: &mut Rig, signal: u32) -> PsaMsg {
    let out = rig.addr(SERVICE_SCRATCH + 0x800);
    assert_eq!(rig.call(SERVICE, Sysnum::Get, [signal as usize, out, 0, 0]), 0);
    rig.get(out)
}

pub fn service_reply(rig: &mut Rig, handle: i32, status: i32) {
    rig.call(SERVICE, Sysnum::Reply, [handle as usize, status as u32 as usize, 0, 0]);
}
