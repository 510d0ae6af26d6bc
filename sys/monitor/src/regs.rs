// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register gateways.
//!
//! A register gateway is a flash record that lets exactly one box perform one
//! fixed operation on one register. The box "calls" the gateway by executing
//! its SVC instruction; the host kernel's SVC handler finds the record just
//! after the instruction and passes it here along with the caller.

use abi::{
    decode_register_operation, svc::FastSvc, BoxId, FaultInfo, RegisterGateway,
    RegisterOp, RegisterWidth, Violation, REGISTER_GATEWAY_BRANCH,
    REGISTER_GATEWAY_MAGIC, SVC_OPCODE_BASE,
};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::Monitor;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Access {
        caller: BoxId,
        address: u32,
        op: RegisterOp,
    },
    Rejected(BoxId),
}

ringbuf!(Trace, 16, Trace::None);

/// Something registers can be read and written through.
pub trait RegisterBus {
    fn read(&mut self, address: u32, width: RegisterWidth) -> u32;
    fn write(&mut self, address: u32, width: RegisterWidth, value: u32);
}

/// The real thing: volatile accesses to the physical address.
#[cfg(target_os = "none")]
pub struct Mmio;

#[cfg(target_os = "none")]
impl RegisterBus for Mmio {
    fn read(&mut self, address: u32, width: RegisterWidth) -> u32 {
        // Safety: the gateway's address was placed in flash by the
        // application build for exactly this access.
        unsafe {
            match width {
                RegisterWidth::Byte => {
                    core::ptr::read_volatile(address as *const u8) as u32
                }
                RegisterWidth::Half => {
                    core::ptr::read_volatile(address as *const u16) as u32
                }
                RegisterWidth::Word => {
                    core::ptr::read_volatile(address as *const u32)
                }
            }
        }
    }

    fn write(&mut self, address: u32, width: RegisterWidth, value: u32) {
        // Safety: as for `read`.
        unsafe {
            match width {
                RegisterWidth::Byte => {
                    core::ptr::write_volatile(address as *mut u8, value as u8)
                }
                RegisterWidth::Half => {
                    core::ptr::write_volatile(address as *mut u16, value as u16)
                }
                RegisterWidth::Word => {
                    core::ptr::write_volatile(address as *mut u32, value)
                }
            }
        }
    }
}

fn width_mask(width: RegisterWidth) -> u32 {
    match width {
        RegisterWidth::Byte => 0xFF,
        RegisterWidth::Half => 0xFFFF,
        RegisterWidth::Word => !0,
    }
}

/// Works out what an operation does to a register currently holding `old`.
/// Returns the value to write back, if any, and the value to hand the caller.
pub fn apply_op(
    op: RegisterOp,
    old: u32,
    value: u32,
    mask: u32,
) -> (Option<u32>, u32) {
    let bits = value & mask;
    let new = match op {
        RegisterOp::Read => return (None, old & mask),
        RegisterOp::Write => (old & !mask) | bits,
        RegisterOp::SetBits => old | bits,
        RegisterOp::ClearBits => old & !bits,
        RegisterOp::ToggleBits => old ^ bits,
    };
    (Some(new), new)
}

impl Monitor<'_, '_> {
    /// Performs the access described by `gw` on behalf of box `caller`,
    /// with `value` as the operand. Returns the value read, or the value
    /// written.
    ///
    /// A gateway that doesn't check out, or doesn't belong to `caller`,
    /// faults `caller`.
    pub fn register_gateway(
        &self,
        caller: BoxId,
        gw: &RegisterGateway,
        value: u32,
        bus: &mut impl RegisterBus,
    ) -> Result<u32, FaultInfo> {
        let index = self.checked_index(caller);
        if let Some(f) = self.fault_of(caller) {
            return Err(f);
        }
        let (op, width) = match self.check_register_gateway(index, gw) {
            Ok(decoded) => decoded,
            Err(f) => {
                ringbuf_entry!(Trace::Rejected(caller));
                self.force_fault_index(index, f);
                return Err(f);
            }
        };

        let mask = gw.mask & width_mask(width);
        let old = bus.read(gw.address, width) & width_mask(width);
        let (new, result) = apply_op(op, old, value, mask);
        if let Some(new) = new {
            bus.write(gw.address, width, new);
        }
        ringbuf_entry!(Trace::Access {
            caller,
            address: gw.address,
            op
        });
        Ok(result)
    }

    fn check_register_gateway(
        &self,
        index: usize,
        gw: &RegisterGateway,
    ) -> Result<(RegisterOp, RegisterWidth), FaultInfo> {
        let svc_opcode = SVC_OPCODE_BASE | FastSvc::RegisterGateway.imm() as u16;
        let well_formed = gw.magic == REGISTER_GATEWAY_MAGIC
            && gw.svc_opcode == svc_opcode
            && gw.branch == REGISTER_GATEWAY_BRANCH;
        if !well_formed || self.config_index(gw.box_cfg) != Some(index) {
            return Err(Violation::BadGateway.into());
        }
        let (op, width) =
            decode_register_operation(gw.operation).ok_or(Violation::BadGateway)?;
        if gw.address % width.bytes() != 0 {
            return Err(Violation::BadGateway.into());
        }
        Ok((op, width))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations() {
        let old = 0b1010_1010;
        let mask = 0b0000_1111;
        assert_eq!(apply_op(RegisterOp::Read, old, 0, mask), (None, 0b1010));
        assert_eq!(
            apply_op(RegisterOp::Write, old, 0b0101_0101, mask),
            (Some(0b1010_0101), 0b1010_0101)
        );
        assert_eq!(
            apply_op(RegisterOp::SetBits, old, 0b1111_0001, mask),
            (Some(0b1010_1011), 0b1010_1011)
        );
        assert_eq!(
            apply_op(RegisterOp::ClearBits, old, 0b1111_1111, mask),
            (Some(0b1010_0000), 0b1010_0000)
        );
        assert_eq!(
            apply_op(RegisterOp::ToggleBits, old, 0b1111_0011, mask),
            (Some(0b1010_1001), 0b1010_1001)
        );
    }

    #[test]
    fn widths() {
        assert_eq!(width_mask(RegisterWidth::Byte), 0xFF);
        assert_eq!(width_mask(RegisterWidth::Half), 0xFFFF);
        assert_eq!(width_mask(RegisterWidth::Word), u32::MAX);
    }
}
