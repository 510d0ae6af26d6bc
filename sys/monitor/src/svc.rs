// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor call dispatch.
//!
//! The host kernel's SVC handler decodes nothing; it hands the immediate and
//! the caller's stacked argument registers to [`Monitor::svc`]. Only the
//! entries this core owns are implemented here. The rest of the table (MPU
//! setup, interrupt virtualization, benchmarking, debug) belongs to other
//! parts of the system, and asking this core for them gets `NOT_SUPPORTED`.
//! Register gateway calls need the gateway record and are routed to
//! [`Monitor::register_gateway`] instead.

use abi::svc::{CustomSvc, FastSvc, Svc, HALT_KIND_VIOLATION};
use abi::{BoxId, FaultInfo, UsageError, Violation, NOT_SUPPORTED};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::err::UserError;
use crate::Monitor;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Svc { caller: BoxId, imm: u8 },
    Halted { caller: BoxId, fault: FaultInfo },
}

ringbuf!(Trace, 16, Trace::None);

impl Monitor<'_, '_> {
    /// Services supervisor call `imm` made by `caller` with arguments
    /// `args`. Returns the value for the caller's `r0`.
    ///
    /// Misuse faults the caller, and the fault is returned so the host kernel
    /// can stop scheduling it.
    pub fn svc(
        &self,
        caller: BoxId,
        imm: u8,
        args: [u32; 4],
    ) -> Result<u32, FaultInfo> {
        let index = self.checked_index(caller);
        if let Some(f) = self.fault_of(caller) {
            return Err(f);
        }
        ringbuf_entry!(Trace::Svc { caller, imm });
        match self.dispatch(caller, imm, args) {
            Ok(r) | Err(UserError::Recoverable(r)) => Ok(r),
            Err(UserError::Unrecoverable(f)) => {
                self.force_fault_index(index, f);
                Err(f)
            }
        }
    }

    fn dispatch(
        &self,
        caller: BoxId,
        imm: u8,
        args: [u32; 4],
    ) -> Result<u32, UserError> {
        match Svc::decode(imm) {
            Svc::Fast { index, nargs } => {
                let entry = FastSvc::try_from(index)
                    .map_err(|_| UsageError::BadSvcNumber)?;
                if entry.nargs() != nargs {
                    return Err(UsageError::BadSvcNumber.into());
                }
                Err(UserError::Recoverable(NOT_SUPPORTED))
            }
            Svc::Custom { index } => {
                let entry = CustomSvc::try_from(index)
                    .map_err(|_| UsageError::BadSvcNumber)?;
                match entry {
                    CustomSvc::HaltUserError => Err(halt(caller, args)),
                    CustomSvc::BoxIdSelf => Ok(u32::from(caller.0)),
                    CustomSvc::BoxNamespaceLen => {
                        self.namespace_len(BoxId(args[0] as u16), args[0])
                    }
                    CustomSvc::BenchmarkConfigure
                    | CustomSvc::BenchmarkStart
                    | CustomSvc::BenchmarkStop
                    | CustomSvc::DebugRegisterDriver => {
                        Err(UserError::Recoverable(NOT_SUPPORTED))
                    }
                }
            }
        }
    }

    fn namespace_len(&self, id: BoxId, raw: u32) -> Result<u32, UserError> {
        if raw > u32::from(u16::MAX) || !id.is_in_range(self.box_count()) {
            return Err(UsageError::BoxOutOfRange.into());
        }
        Ok(self.box_namespace(id).map_or(0, |ns| ns.len() as u32))
    }
}

/// Works out the fault a box is asking to be halted with.
fn halt(caller: BoxId, args: [u32; 4]) -> UserError {
    let [code, kind, ..] = args;
    let fault = if kind == HALT_KIND_VIOLATION {
        match Violation::try_from(code) {
            Ok(v) => FaultInfo::Violation(v),
            Err(()) => FaultInfo::UserHalt(code),
        }
    } else {
        FaultInfo::UserHalt(code)
    };
    ringbuf_entry!(Trace::Halted { caller, fault });
    UserError::Unrecoverable(fault)
}
