// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash-resident records describing boxes and the gateways between them.
//!
//! None of these are trusted by the monitor until it has checked their magic
//! numbers (and, for boxes, the version).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Magic number at the start of every `BoxConfig`, to reassure the monitor
/// that it isn't reading uninitialized Flash.
pub const BOX_MAGIC: u32 = 0x42CF_B66F;
/// Layout version of `BoxConfig`.
pub const BOX_VERSION: u32 = 100;

/// Longest box namespace, in bytes.
pub const MAX_BOX_NAMESPACE_LEN: usize = 37;
/// Most ACL entries a single box may declare.
pub const MAX_ACLS_PER_BOX: usize = 32;

/// Magic for gateways that are called synchronously.
pub const RPC_GATEWAY_MAGIC_SYNC: u32 = 0x3A1F_5C00;
/// Magic for gateways that return a result token.
pub const RPC_GATEWAY_MAGIC_ASYNC: u32 = 0x3A1F_A5C0;
/// Magic for register gateways.
pub const REGISTER_GATEWAY_MAGIC: u32 = 0x7E6A_0C00;

/// `ldr.w pc, [pc, #0]`, the first word of every RPC gateway. It jumps through
/// the gateway's trampoline pointer.
pub const RPC_GATEWAY_LDR_PC: u32 = 0xF000_F8DF;
/// `svc #imm` opcode base for the first halfword of a register gateway.
pub const SVC_OPCODE_BASE: u16 = 0xDF00;
/// `b.n` over the register gateway's data words.
pub const REGISTER_GATEWAY_BRANCH: u16 = 0xE00A;

/// Signature of every function reachable through an RPC gateway.
pub type RpcTarget = fn(u32, u32, u32, u32) -> u32;

/// Sizes of the per-box sections the monitor reserves in the box's BSS.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct BoxBssSizes {
    /// Box index (identity and bookkeeping).
    pub index: u32,
    /// Application-defined box context.
    pub context: u32,
    /// C library reentrancy state, if any.
    pub reentrancy: u32,
    /// RPC pools and queues.
    pub rpc: u32,
    /// IPC pools, queues and token state.
    pub ipc: u32,
    /// Box heap.
    pub heap: u32,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct AclFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Region belongs only to this box.
        const SECURE = 1 << 3;
        /// Region is a peripheral.
        const PERIPHERAL = 1 << 4;

        const RESERVED = !((1 << 5) - 1);
    }
}

/// One entry of a box's access control list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct Acl {
    pub start: u32,
    pub length: u32,
    pub flags: AclFlags,
}

/// Static description of one box.
#[derive(Debug)]
#[repr(C)]
pub struct BoxConfig {
    /// Should be `BOX_MAGIC`.
    pub magic: u32,
    /// Should be `BOX_VERSION`.
    pub version: u32,
    pub bss: BoxBssSizes,
    /// Size of the box's main stack, in bytes.
    pub stack_size: u32,
    /// Address of the box's library configuration, or zero if it has none.
    pub lib_config: u32,
    /// Human-readable unique name, if the box has one.
    pub namespace: Option<&'static str>,
    pub acls: &'static [Acl],
}

impl BoxConfig {
    /// Creates a box record stamped with the current magic and version.
    pub const fn new(
        namespace: Option<&'static str>,
        stack_size: u32,
        bss: BoxBssSizes,
        acls: &'static [Acl],
    ) -> Self {
        Self {
            magic: BOX_MAGIC,
            version: BOX_VERSION,
            bss,
            stack_size,
            lib_config: 0,
            namespace,
            acls,
        }
    }
}

/// Which call discipline an RPC gateway expects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GatewayKind {
    Sync,
    Async,
}

/// A flash-resident RPC gateway: the only way one box may call a function in
/// another.
///
/// The gateway belongs to the box that owns `target` (`box_cfg`), and calling
/// through it runs `target` in that box.
#[derive(Debug)]
#[repr(C)]
pub struct RpcGateway {
    /// Should be `RPC_GATEWAY_LDR_PC`.
    pub ldr_pc: u32,
    /// One of the `RPC_GATEWAY_MAGIC_*` values.
    pub magic: u32,
    /// The box that runs `target`.
    pub box_cfg: &'static BoxConfig,
    pub target: RpcTarget,
}

impl RpcGateway {
    pub const fn sync(box_cfg: &'static BoxConfig, target: RpcTarget) -> Self {
        Self {
            ldr_pc: RPC_GATEWAY_LDR_PC,
            magic: RPC_GATEWAY_MAGIC_SYNC,
            box_cfg,
            target,
        }
    }

    pub const fn asynchronous(
        box_cfg: &'static BoxConfig,
        target: RpcTarget,
    ) -> Self {
        Self {
            ldr_pc: RPC_GATEWAY_LDR_PC,
            magic: RPC_GATEWAY_MAGIC_ASYNC,
            box_cfg,
            target,
        }
    }

    /// Decodes the gateway's magic. `None` means this isn't a gateway.
    pub fn kind(&self) -> Option<GatewayKind> {
        match self.magic {
            RPC_GATEWAY_MAGIC_SYNC => Some(GatewayKind::Sync),
            RPC_GATEWAY_MAGIC_ASYNC => Some(GatewayKind::Async),
            _ => None,
        }
    }

    /// Checks whether this gateway leads to `target`.
    pub fn leads_to(&self, target: RpcTarget) -> bool {
        same_target(self.target, target)
    }
}

/// Compares RPC targets by address.
pub fn same_target(a: RpcTarget, b: RpcTarget) -> bool {
    a as usize == b as usize
}

/// What a register gateway does to its register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RegisterOp {
    /// Return `register & mask`.
    Read = 0,
    /// Replace the bits in `mask` with the caller's value.
    Write = 1,
    /// Set the caller's bits, limited to `mask`.
    SetBits = 2,
    /// Clear the caller's bits, limited to `mask`.
    ClearBits = 3,
    /// Toggle the caller's bits, limited to `mask`.
    ToggleBits = 4,
}

/// Access width of a register gateway.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RegisterWidth {
    Byte = 0,
    Half = 1,
    Word = 2,
}

impl RegisterWidth {
    pub const fn bytes(self) -> u32 {
        1 << self as u32
    }
}

const REGISTER_OP_MASK: u32 = 0xF;
const REGISTER_WIDTH_SHIFT: u32 = 4;
const REGISTER_WIDTH_MASK: u32 = 0x3 << REGISTER_WIDTH_SHIFT;

/// Packs an operation and width into a gateway's `operation` word.
pub const fn encode_register_operation(op: RegisterOp, width: RegisterWidth) -> u32 {
    op as u32 | ((width as u32) << REGISTER_WIDTH_SHIFT)
}

/// Unpacks a gateway's `operation` word. Unknown bits make the whole word
/// invalid.
pub fn decode_register_operation(word: u32) -> Option<(RegisterOp, RegisterWidth)> {
    if word & !(REGISTER_OP_MASK | REGISTER_WIDTH_MASK) != 0 {
        return None;
    }
    let op = match word & REGISTER_OP_MASK {
        0 => RegisterOp::Read,
        1 => RegisterOp::Write,
        2 => RegisterOp::SetBits,
        3 => RegisterOp::ClearBits,
        4 => RegisterOp::ToggleBits,
        _ => return None,
    };
    let width = match (word & REGISTER_WIDTH_MASK) >> REGISTER_WIDTH_SHIFT {
        0 => RegisterWidth::Byte,
        1 => RegisterWidth::Half,
        2 => RegisterWidth::Word,
        _ => return None,
    };
    Some((op, width))
}

/// A flash-resident register gateway, letting one box touch one register it
/// would otherwise have no access to.
#[derive(Debug)]
#[repr(C)]
pub struct RegisterGateway {
    /// `SVC_OPCODE_BASE | FastSvc::RegisterGateway.imm()`.
    pub svc_opcode: u16,
    /// Should be `REGISTER_GATEWAY_BRANCH`.
    pub branch: u16,
    /// Should be `REGISTER_GATEWAY_MAGIC`.
    pub magic: u32,
    /// The only box allowed to use this gateway.
    pub box_cfg: &'static BoxConfig,
    pub address: u32,
    pub mask: u32,
    /// See `encode_register_operation`.
    pub operation: u32,
}

impl RegisterGateway {
    pub const fn new(
        box_cfg: &'static BoxConfig,
        address: u32,
        mask: u32,
        op: RegisterOp,
        width: RegisterWidth,
    ) -> Self {
        Self {
            svc_opcode: SVC_OPCODE_BASE
                | crate::svc::FastSvc::RegisterGateway.imm() as u16,
            branch: REGISTER_GATEWAY_BRANCH,
            magic: REGISTER_GATEWAY_MAGIC,
            box_cfg,
            address,
            mask,
            operation: encode_register_operation(op, width),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: u32, b: u32, _: u32, _: u32) -> u32 {
        a + b
    }

    fn sub(a: u32, b: u32, _: u32, _: u32) -> u32 {
        a - b
    }

    static CFG: BoxConfig =
        BoxConfig::new(Some("test.box"), 1024, BoxBssSizes { index: 0, context: 0, reentrancy: 0, rpc: 0, ipc: 0, heap: 0 }, &[]);

    #[test]
    fn gateway_kinds() {
        assert_eq!(RpcGateway::sync(&CFG, add).kind(), Some(GatewayKind::Sync));
        assert_eq!(
            RpcGateway::asynchronous(&CFG, add).kind(),
            Some(GatewayKind::Async)
        );
        let mut gw = RpcGateway::sync(&CFG, add);
        gw.magic = RPC_GATEWAY_MAGIC_SYNC ^ 1;
        assert_eq!(gw.kind(), None);
    }

    #[test]
    fn gateway_targets() {
        let gw = RpcGateway::sync(&CFG, add);
        assert!(gw.leads_to(add));
        assert!(!gw.leads_to(sub));
    }

    #[test]
    fn register_operation_words() {
        let w = encode_register_operation(RegisterOp::ClearBits, RegisterWidth::Half);
        assert_eq!(
            decode_register_operation(w),
            Some((RegisterOp::ClearBits, RegisterWidth::Half))
        );
        assert_eq!(decode_register_operation(5), None);
        assert_eq!(decode_register_operation(0x30), None);
        assert_eq!(decode_register_operation(1 << 8), None);
    }

    #[test]
    fn register_gateway_opcode() {
        let gw = RegisterGateway::new(&CFG, 0x4000_0000, 0xFF, RegisterOp::Read, RegisterWidth::Word);
        assert_eq!(gw.svc_opcode, 0xDF80);
        assert_eq!(gw.magic, REGISTER_GATEWAY_MAGIC);
    }
}
