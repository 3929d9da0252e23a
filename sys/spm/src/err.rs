// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! SPM operations spend most of their length checking arguments. Writing
//! those checks as `?` on a `Result` keeps the interesting path readable and
//! funnels every failure into one of two outcomes, defined here.

use abi::{FaultInfo, PsaStatus, UsageError};

/// An error committed by a client when calling into the SPM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error. The status code is handed back to the client as
    /// the result of its call.
    Recoverable(PsaStatus),
    /// An unrecoverable error. These end in `SpmState::panic`.
    Unrecoverable(FaultInfo),
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}

impl UserError {
    /// Returns the fault, if this error is fatal.
    pub fn fault(self) -> Option<FaultInfo> {
        match self {
            Self::Recoverable(_) => None,
            Self::Unrecoverable(f) => Some(f),
        }
    }
}

/// Widens a PSA status to the register width used for return values.
///
/// Negative statuses are passed through as their two's complement 32-bit
/// pattern, which is what the caller's `int32_t` view of the register
/// expects.
#[inline]
pub fn status_word(status: PsaStatus) -> usize {
    status as u32 as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_are_fatal() {
        let e = UserError::from(UsageError::HandleBusy);
        assert_eq!(
            e.fault(),
            Some(FaultInfo::SyscallUsage(UsageError::HandleBusy))
        );
        assert_eq!(UserError::Recoverable(-131).fault(), None);
    }

    #[test]
    fn status_word_keeps_low_bits() {
        assert_eq!(status_word(abi::PSA_ERROR_CONNECTION_BUSY) as u32 as i32, -131);
        assert_eq!(status_word(7), 7);
    }
}
