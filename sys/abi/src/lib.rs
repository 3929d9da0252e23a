// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SPM application binary interface.
//!
//! This crate holds everything that has to agree between the SPM, the
//! partitions it hosts, the non-secure world, and the host-side tooling that
//! describes an image: PSA constants and wire structures, supervisor call
//! numbers, the static partition/service descriptors, and the fault
//! vocabulary.

#![no_std]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Version of the PSA Firmware Framework implemented here (1.0).
pub const PSA_FRAMEWORK_VERSION: u32 = 0x0100;

/// Returned by `psa_version` for a service that doesn't exist or that the
/// caller isn't allowed to see.
pub const PSA_VERSION_NONE: u32 = 0;

/// Maximum number of input plus output vectors in a single call.
pub const PSA_MAX_IOVEC: usize = 4;

/// PSA status codes. Non-negative values are the success domain.
pub type PsaStatus = i32;

pub const PSA_SUCCESS: PsaStatus = 0;
pub const PSA_ERROR_PROGRAMMER_ERROR: PsaStatus = -129;
pub const PSA_ERROR_CONNECTION_REFUSED: PsaStatus = -130;
pub const PSA_ERROR_CONNECTION_BUSY: PsaStatus = -131;
pub const PSA_ERROR_GENERIC_ERROR: PsaStatus = -132;
pub const PSA_ERROR_NOT_SUPPORTED: PsaStatus = -134;
pub const PSA_ERROR_DOES_NOT_EXIST: PsaStatus = -140;

/// Handle value that means "no connection". Closing it is a no-op.
pub const PSA_NULL_HANDLE: i32 = 0;

/// Message types as seen by a service in `PsaMsg::msg_type`. Values `>= 0`
/// are service-defined call types.
pub const PSA_IPC_CONNECT: i32 = -1;
pub const PSA_IPC_CALL: i32 = 0;
pub const PSA_IPC_DISCONNECT: i32 = -2;

/// `psa_wait` timeout values. Only the `PSA_BLOCK` bit is honored.
pub const PSA_POLL: u32 = 0x0000_0000;
pub const PSA_BLOCK: u32 = 0x8000_0000;

/// Signal mask matching every signal.
pub const PSA_WAIT_ANY: u32 = 0xFFFF_FFFF;

/// Reserved signal used for `psa_notify`/`psa_clear`.
pub const PSA_DOORBELL: u32 = 0x0000_0008;

/// Signal bits below this mask are reserved by the framework and may not be
/// assigned to services or interrupts.
pub const SIGNAL_RESERVED_MASK: u32 = 0x0000_000F;

/// Tests whether a client id belongs to the non-secure world.
#[inline]
pub const fn client_id_is_ns(client_id: i32) -> bool {
    client_id < 0
}

/// Input vector, as laid out in caller memory.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct PsaInvec {
    pub base: usize,
    pub len: usize,
}

/// Output vector, as laid out in caller memory. `len` is rewritten by the SPM
/// with the number of bytes the service produced when the call completes.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct PsaOutvec {
    pub base: usize,
    pub len: usize,
}

/// Message descriptor delivered to a service by `psa_get`.
///
/// Field order differs from the C `psa_msg_t` so that the structure has no
/// padding on either 32- or 64-bit targets.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct PsaMsg {
    /// Reverse handle set with `psa_set_rhandle`, or 0.
    pub rhandle: usize,
    pub in_size: [usize; PSA_MAX_IOVEC],
    pub out_size: [usize; PSA_MAX_IOVEC],
    /// One of `PSA_IPC_CONNECT`, `PSA_IPC_DISCONNECT`, or a call type `>= 0`.
    pub msg_type: i32,
    /// Message handle, to be passed back to `psa_read`, `psa_reply` and
    /// friends.
    pub handle: i32,
    pub client_id: i32,
    pub reserved: u32,
}

/// Packs the message type and vector counts of `psa_call` into one register.
///
/// The type occupies the upper 16 bits and is sign-extended on unpacking.
#[inline]
pub const fn pack_call_params(msg_type: i32, in_len: usize, out_len: usize) -> u32 {
    ((msg_type as u32) << 16) | ((in_len as u32 & 0xFF) << 8) | (out_len as u32 & 0xFF)
}

/// Inverse of [`pack_call_params`].
#[inline]
pub const fn unpack_call_params(ctrl: u32) -> (i32, usize, usize) {
    (
        (ctrl as i32) >> 16,
        ((ctrl >> 8) & 0xFF) as usize,
        (ctrl & 0xFF) as usize,
    )
}

/// Secure function request, built in caller memory for `SFN_REQUEST` in the
/// library model.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct SfnRequest {
    /// Entry point of the secure function inside the target partition.
    pub sfn: usize,
    /// `in_vec`, `in_len`, `out_vec`, `out_len`.
    pub args: [usize; 4],
    /// Id of the partition that owns `sfn`.
    pub sp_id: i32,
    /// Nonzero if the request arrived from the non-secure world.
    pub ns_caller: u32,
}

/// Enumeration of supervisor call numbers.
///
/// The number travels in the syscall-descriptor register; arguments travel in
/// the argument registers.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Sysnum {
    SfnRequest = 0,
    SfnReturn = 1,
    GetCallerClientId = 2,
    /// Only the SPM's interrupt path enters a handler; partitions issuing
    /// this are refused.
    DeprivReq = 3,
    DeprivRet = 4,

    FrameworkVersion = 0x40,
    Version = 0x41,
    Connect = 0x42,
    Call = 0x43,
    Close = 0x44,
    Wait = 0x45,
    Get = 0x46,
    SetRhandle = 0x47,
    Read = 0x48,
    Skip = 0x49,
    Write = 0x4A,
    Reply = 0x4B,
    Notify = 0x4C,
    Clear = 0x4D,
    Eoi = 0x4E,
    Panic = 0x4F,
    EnableIrq = 0x50,
    DisableIrq = 0x51,
    ExitThread = 0x52,
}

impl Sysnum {
    /// Tests whether this call belongs to the library (SFN) calling
    /// convention rather than the PSA IPC one.
    pub fn is_library_call(self) -> bool {
        (self as u32) < 0x40
    }

    /// Tests whether this call is part of the Service API, made by a secure
    /// partition acting as a service rather than as a client.
    pub fn is_service_call(self) -> bool {
        matches!(
            self,
            Self::Wait
                | Self::Get
                | Self::SetRhandle
                | Self::Read
                | Self::Skip
                | Self::Write
                | Self::Reply
                | Self::Notify
                | Self::Clear
                | Self::Eoi
                | Self::EnableIrq
                | Self::DisableIrq
        )
    }
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the SPM doesn't depend on `num-traits`.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::SfnRequest),
            1 => Ok(Self::SfnReturn),
            2 => Ok(Self::GetCallerClientId),
            3 => Ok(Self::DeprivReq),
            4 => Ok(Self::DeprivRet),
            0x40 => Ok(Self::FrameworkVersion),
            0x41 => Ok(Self::Version),
            0x42 => Ok(Self::Connect),
            0x43 => Ok(Self::Call),
            0x44 => Ok(Self::Close),
            0x45 => Ok(Self::Wait),
            0x46 => Ok(Self::Get),
            0x47 => Ok(Self::SetRhandle),
            0x48 => Ok(Self::Read),
            0x49 => Ok(Self::Skip),
            0x4A => Ok(Self::Write),
            0x4B => Ok(Self::Reply),
            0x4C => Ok(Self::Notify),
            0x4D => Ok(Self::Clear),
            0x4E => Ok(Self::Eoi),
            0x4F => Ok(Self::Panic),
            0x50 => Ok(Self::EnableIrq),
            0x51 => Ok(Self::DisableIrq),
            0x52 => Ok(Self::ExitThread),
            _ => Err(()),
        }
    }
}

/// A half-open `[base, limit)` range of addresses in the image.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemRange {
    pub base: usize,
    pub limit: usize,
}

impl MemRange {
    pub const EMPTY: Self = Self { base: 0, limit: 0 };

    pub const fn new(base: usize, limit: usize) -> Self {
        Self { base, limit }
    }

    pub const fn len(&self) -> usize {
        self.limit.saturating_sub(self.base)
    }

    pub const fn is_empty(&self) -> bool {
        self.limit <= self.base
    }

    /// Checks whether `other` lies entirely inside this range.
    pub const fn encloses(&self, other: &MemRange) -> bool {
        !other.is_empty() && other.base >= self.base && other.limit <= self.limit
    }
}

impl spmcore::MemoryRegion for MemRange {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.limit
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PartitionFlags: u32 {
        /// Application Root of Trust. Runs unprivileged above isolation
        /// level 1.
        const APP_ROT = 1 << 0;
        /// PSA Root of Trust. Always privileged.
        const PSA_ROT = 1 << 1;
        /// Partition runs its own thread and talks PSA IPC.
        const IPC = 1 << 2;
    }
}

/// Policy for matching the version a client asks for against the version a
/// service implements.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// The client may ask for any version up to the service's.
    Relaxed,
    /// The client must ask for exactly the service's version.
    Strict,
}

impl VersionPolicy {
    pub fn accepts(self, requested: u32, implemented: u32) -> bool {
        match self {
            VersionPolicy::Relaxed => requested <= implemented,
            VersionPolicy::Strict => requested == implemented,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum IsolationLevel {
    /// SPE isolated from NSPE only.
    Level1 = 1,
    /// Additionally, PSA RoT isolated from Application RoT.
    Level2 = 2,
    /// Additionally, Application RoT partitions isolated from each other.
    Level3 = 3,
}

impl core::convert::TryFrom<u8> for IsolationLevel {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Level1),
            2 => Ok(Self::Level2),
            3 => Ok(Self::Level3),
            _ => Err(()),
        }
    }
}

/// How partitions are entered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeModel {
    /// Secure functions called through `SFN_REQUEST`/`SFN_RETURN`.
    Library,
    /// One thread per partition, PSA client/service IPC.
    Ipc,
}

/// An interrupt line routed to a partition as a signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IrqDesc {
    pub line: u32,
    pub signal: u32,
    /// Handler run, deprivileged, when the line fires in the library model.
    /// The IPC model delivers the signal instead and ignores this.
    pub handler: Option<usize>,
}

/// Record describing a single partition, fixed at image build time.
#[derive(Clone, Debug)]
pub struct PartitionDesc {
    /// Partition id. Positive for secure partitions; the single non-secure
    /// pseudo-partition carries a negative id.
    pub id: i32,
    pub flags: PartitionFlags,
    /// Scheduling priority; 0 is most important.
    pub priority: u8,
    /// Address where the partition's thread (or init function) starts.
    pub entry: usize,
    /// Read-only/code region.
    pub code: MemRange,
    /// Read-write region, including the stack.
    pub data: MemRange,
    /// Stack bounds; must lie within `data`.
    pub stack: MemRange,
    /// SIDs this partition is allowed to connect to.
    pub dependencies: &'static [u32],
    pub irqs: &'static [IrqDesc],
}

impl PartitionDesc {
    pub fn is_ns(&self) -> bool {
        client_id_is_ns(self.id)
    }
}

/// Record describing a single RoT service, fixed at image build time.
#[derive(Clone, Debug)]
pub struct ServiceDesc {
    pub name: &'static str,
    pub sid: u32,
    pub version: u32,
    pub version_policy: VersionPolicy,
    /// Signal bit asserted in the owning partition when messages are queued.
    pub signal: u32,
    /// Whether non-secure clients may connect.
    pub non_secure_client: bool,
    /// Id of the owning partition.
    pub partition_id: i32,
}

/// Static memory map of the system, used for security attribution and access
/// permission lookups.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryLayout {
    pub s_code: MemRange,
    pub s_data: MemRange,
    pub ns_code: MemRange,
    pub ns_data: MemRange,
    /// Parts of the SPM image that unprivileged partitions may use.
    pub spm_unpriv_code: MemRange,
    pub spm_unpriv_data: MemRange,
}

/// Complete description of an SPM image.
#[derive(Clone, Debug)]
pub struct ImageDesc {
    pub isolation: IsolationLevel,
    pub model: InvokeModel,
    /// Client id used for requests from the non-secure partition when the
    /// non-secure side hasn't named one.
    pub ns_client_id: i32,
    pub memory: MemoryLayout,
    pub partitions: &'static [PartitionDesc],
    pub services: &'static [ServiceDesc],
}

/// A record describing a fault that stops the system.
///
/// Every one of these is terminal: the SPM does not attempt recovery from a
/// programmer error, it resets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// A partition or the non-secure world handed the SPM memory it doesn't
    /// own, or with the wrong security attribute.
    MemoryAccess { address: usize, size: usize },
    /// Arguments passed to an SPM call were invalid.
    SyscallUsage(UsageError),
    /// A partition explicitly gave up with `psa_panic`.
    Panic,
    /// The SPM's own bookkeeping disagrees with itself.
    Integrity,
}

/// A kind of SPM call misuse.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// Supervisor call number is not one we know, or not valid in this model.
    BadSyscallNumber,
    /// No service with the requested SID.
    UnknownService,
    /// The caller isn't allowed to connect to the service.
    NotAuthorized,
    /// The requested version doesn't satisfy the service's policy.
    VersionMismatch,
    /// Handle doesn't name a live connection for this client.
    InvalidHandle,
    /// A message is already in flight on this connection.
    HandleBusy,
    /// `in_len`/`out_len` exceed `PSA_MAX_IOVEC`.
    TooManyIovecs,
    /// Call type was negative.
    BadCallType,
    /// Two input vectors share bytes.
    OverlappingInvecs,
    /// Signal argument had zero or several bits set, or isn't ours.
    InvalidSignal,
    /// Signal isn't currently asserted.
    SignalNotAsserted,
    /// Message handle doesn't name a delivered message for this partition.
    InvalidMessage,
    /// Operation doesn't apply to this message type.
    WrongMessageType,
    /// Vector index is `>= PSA_MAX_IOVEC`.
    BadIovecIndex,
    /// `psa_write` would exceed the declared output size.
    OutvecOverflow,
    /// Reply status isn't acceptable for this message type.
    BadReplyStatus,
    /// A secure client was sent `PSA_ERROR_PROGRAMMER_ERROR`.
    ProgrammerErrorReply,
    /// `psa_notify` target doesn't exist.
    UnknownPartition,
    /// `psa_clear` without a pending doorbell.
    DoorbellNotAsserted,
    /// Signal isn't one of the caller's interrupt signals.
    NotIrqSignal,
    /// Malformed slice (misaligned, wraps, etc).
    InvalidSlice,
    /// Non-secure entry while the secure domain is already entered.
    SecureDomainLocked,
    /// The target partition is not idle.
    PartitionNotIdle,
    /// The calling partition is not running.
    CallerNotRunning,
    /// Return from a partition that wasn't called.
    NothingToReturnTo,
    /// Secure function entry point lies outside the target partition's code.
    BadEntryPoint,
    /// A thread failed its start-up checks.
    BadThread,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// Shared-memory mailbox between a non-secure core and the SPE.
pub mod mailbox {
    use super::*;

    /// Number of slots in the mailbox queue.
    pub const NUM_MAILBOX_QUEUE_SLOT: usize = 4;

    pub type MailboxStatus = i32;

    pub const MAILBOX_SUCCESS: MailboxStatus = 0;
    pub const MAILBOX_QUEUE_FULL: MailboxStatus = i32::MIN + 1;
    pub const MAILBOX_INVAL_PARAMS: MailboxStatus = i32::MIN + 2;
    pub const MAILBOX_NO_PERMS: MailboxStatus = i32::MIN + 3;
    pub const MAILBOX_NO_PEND_EVENT: MailboxStatus = i32::MIN + 4;
    pub const MAILBOX_CHAN_BUSY: MailboxStatus = i32::MIN + 5;
    pub const MAILBOX_CALLBACK_REG_ERROR: MailboxStatus = i32::MIN + 6;
    pub const MAILBOX_INIT_ERROR: MailboxStatus = i32::MIN + 7;

    pub const MAILBOX_PSA_FRAMEWORK_VERSION: i32 = 0x1;
    pub const MAILBOX_PSA_VERSION: i32 = 0x2;
    pub const MAILBOX_PSA_CONNECT: i32 = 0x3;
    pub const MAILBOX_PSA_CALL: i32 = 0x4;
    pub const MAILBOX_PSA_CLOSE: i32 = 0x5;

    /// Parameters of a PSA client call. Which fields are meaningful depends
    /// on the call type.
    #[derive(
        Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct MailboxParams {
        pub sid: u32,
        pub version: u32,
        pub handle: i32,
        pub msg_type: i32,
        pub in_vec: usize,
        pub in_len: usize,
        pub out_vec: usize,
        pub out_len: usize,
    }

    #[derive(
        Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct MailboxMsg {
        pub call_type: i32,
        pub client_id: i32,
        pub params: MailboxParams,
    }

    #[derive(
        Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct MailboxReply {
        pub return_val: i32,
        pub reserved: u32,
    }

    #[derive(
        Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct NsMailboxSlot {
        pub msg: MailboxMsg,
        pub reply: MailboxReply,
        /// Opaque to the SPE; the non-secure side uses it to find the waiting
        /// thread.
        pub owner: usize,
    }

    /// The queue as it sits in non-secure shared memory.
    #[derive(
        Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct NsMailboxQueue {
        pub empty_slots: u32,
        pub pend_slots: u32,
        pub replied_slots: u32,
        pub reserved: u32,
        pub queue: [NsMailboxSlot; NUM_MAILBOX_QUEUE_SLOT],
    }

    static_assertions::const_assert!(NUM_MAILBOX_QUEUE_SLOT <= 32);
}
