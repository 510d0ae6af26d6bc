// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor call stubs.
//!
//! Only the halt call lives here. Everything else a box asks of the monitor
//! goes through gateways or through the RPC and IPC queues.

use abi::svc::{HALT_KIND_USER, HALT_KIND_VIOLATION};
use abi::Violation;

/// Halts the calling box for breaking the RPC or IPC protocol.
pub fn sys_halt(v: Violation) -> ! {
    halt(v as u32, HALT_KIND_VIOLATION)
}

/// Halts the calling box with an application-defined code.
pub fn sys_halt_user(code: u32) -> ! {
    halt(code, HALT_KIND_USER)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        #[inline(always)]
        fn halt(code: u32, kind: u32) -> ! {
            // Safety: the monitor never returns from this call.
            unsafe {
                core::arch::asm!(
                    "svc #{imm}",
                    imm = const abi::svc::CustomSvc::HaltUserError.imm(),
                    in("r0") code,
                    in("r1") kind,
                    options(noreturn),
                )
            }
        }
    } else {
        fn halt(code: u32, kind: u32) -> ! {
            if kind == HALT_KIND_VIOLATION {
                match Violation::try_from(code) {
                    Ok(v) => panic!("box halted: {v:?}"),
                    Err(()) => panic!("box halted: violation {code}"),
                }
            }
            panic!("box halted: user error {code:#x}");
        }
    }
}
