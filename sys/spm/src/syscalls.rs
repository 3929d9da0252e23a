// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor call entry and dispatch.
//!
//! A partition makes an SPM call by loading the call number into the
//! syscall-descriptor register, arguments into the argument registers, and
//! executing `svc`. The architecture code saves the register file and calls
//! [`SpmState::svc_entry`], which finds the call and its arguments in the
//! running thread's saved state.
//!
//! Results come back in the first return register. Calls that blocked get
//! their result later, when whatever woke them writes it. Any programmer error
//! is fatal, and never returns to the caller.
//!
//! `PSA_IPC_CALL` needs more than four arguments, so the second register
//! carries the message type and both vector counts packed together; see
//! `abi::pack_call_params`.

use abi::{unpack_call_params, FaultInfo, InvokeModel, Sysnum, UsageError, PSA_SUCCESS};

use crate::err::{status_word, UserError};
use crate::hal::Hal;
use crate::psa::Completion;
use crate::state::SpmState;
use crate::thread::ArchState;

/// Result of a call that didn't fail: a value for the return register, or
/// nothing if the caller blocked or control went elsewhere.
type CallResult = Result<Option<usize>, UserError>;

fn ok() -> CallResult {
    Ok(Some(status_word(PSA_SUCCESS)))
}

impl<H: Hal> SpmState<H> {
    /// Handles the `svc` just executed by the current thread.
    pub fn svc_entry(&mut self) {
        let Some(cur) = self.sched.current() else {
            self.panic(FaultInfo::Integrity);
        };
        let save = self.sched.thread(cur).save();
        let (nr, args) = (save.syscall_descriptor(), save.args());

        match self.dispatch(cur, nr, args) {
            Ok(Some(value)) => self.sched.set_retval(cur, value),
            Ok(None) => (),
            Err(UserError::Recoverable(status)) => {
                self.sched.set_retval(cur, status_word(status));
            }
            Err(UserError::Unrecoverable(fault)) => self.panic(fault),
        }
    }

    fn dispatch(&mut self, cur: usize, nr: u32, args: [usize; 4]) -> CallResult {
        let call = Sysnum::try_from(nr).map_err(|()| UsageError::BadSyscallNumber)?;
        let library = self.image.model == InvokeModel::Library;
        let either = matches!(call, Sysnum::FrameworkVersion | Sysnum::Panic);
        if !either && call.is_library_call() != library {
            return Err(UsageError::BadSyscallNumber.into());
        }
        // The non-secure world is only ever a client.
        let ns = self.partitions.get(cur).ok_or(FaultInfo::Integrity)?.desc().is_ns();
        if ns && call.is_service_call() {
            return Err(UsageError::NotAuthorized.into());
        }

        match call {
            Sysnum::SfnRequest => {
                self.sfn_request(args[0])?;
                Ok(None)
            }
            Sysnum::SfnReturn => {
                self.sfn_return(args[0])?;
                Ok(None)
            }
            Sysnum::GetCallerClientId => {
                Ok(Some(status_word(self.get_caller_client_id()?)))
            }
            // Handlers are entered from `irq_entry`, never on request.
            Sysnum::DeprivReq => Err(UsageError::NotAuthorized.into()),
            Sysnum::DeprivRet => {
                self.depriv_ret()?;
                Ok(None)
            }

            Sysnum::FrameworkVersion => Ok(Some(self.psa_framework_version() as usize)),
            Sysnum::Version => {
                let client = self.client_for_partition(cur)?;
                Ok(Some(self.psa_version(&client, args[0] as u32) as usize))
            }
            Sysnum::Connect => {
                let client = self.client_for_partition(cur)?;
                let c = self.psa_connect(&client, args[0] as u32, args[1] as u32)?;
                Ok(c.into_word())
            }
            Sysnum::Call => {
                let client = self.client_for_partition(cur)?;
                let (msg_type, in_len, out_len) = unpack_call_params(args[1] as u32);
                let c = self.psa_call(
                    &client,
                    args[0] as i32,
                    msg_type,
                    args[2],
                    in_len,
                    args[3],
                    out_len,
                )?;
                Ok(c.into_word())
            }
            Sysnum::Close => {
                let client = self.client_for_partition(cur)?;
                Ok(self.psa_close(&client, args[0] as i32)?.into_word())
            }

            Sysnum::Wait => {
                let c = self.psa_wait(cur, args[0] as u32, args[1] as u32)?;
                Ok(match c {
                    Completion::Ready(signals) => Some(signals as usize),
                    Completion::Pending => None,
                })
            }
            Sysnum::Get => {
                self.psa_get(cur, args[0] as u32, args[1])?;
                ok()
            }
            Sysnum::SetRhandle => {
                self.psa_set_rhandle(cur, args[0] as i32, args[1])?;
                ok()
            }
            Sysnum::Read => Ok(Some(self.psa_read(cur, args[0] as i32, args[1], args[2], args[3])?)),
            Sysnum::Skip => Ok(Some(self.psa_skip(cur, args[0] as i32, args[1], args[2])?)),
            Sysnum::Write => {
                self.psa_write(cur, args[0] as i32, args[1], args[2], args[3])?;
                ok()
            }
            Sysnum::Reply => {
                self.psa_reply(cur, args[0] as i32, args[1] as i32)?;
                ok()
            }
            Sysnum::Notify => {
                self.psa_notify(args[0] as i32)?;
                ok()
            }
            Sysnum::Clear => {
                self.psa_clear(cur)?;
                ok()
            }
            Sysnum::Eoi => {
                self.psa_eoi(cur, args[0] as u32)?;
                ok()
            }
            Sysnum::EnableIrq => {
                self.psa_irq_enable(cur, args[0] as u32)?;
                ok()
            }
            Sysnum::DisableIrq => {
                self.psa_irq_disable(cur, args[0] as u32)?;
                ok()
            }
            Sysnum::Panic => Err(FaultInfo::Panic.into()),
            Sysnum::ExitThread => {
                self.exit_thread()?;
                Ok(None)
            }
        }
    }
}
