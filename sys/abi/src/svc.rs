// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor call immediate encoding.
//!
//! Boxes enter the monitor with `SVC #imm`. The 8-bit immediate selects one of
//! two tables:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +---+---------------+-----------+
//! | 1 |  fast index   |   nargs   |   fast table (16 entries)
//! +---+---------------+-----------+
//! | 0 |       custom index        |   custom table (128 entries)
//! +---+---------------------------+
//! ```
//!
//! Fast entries carry their argument count in the immediate so the entry
//! sequence can skip unstacking registers that aren't used.

pub const SVC_MODE_MASK: u8 = 1 << 7;
pub const SVC_FAST_MODE: u8 = 1 << 7;
pub const SVC_CUSTOM_MODE: u8 = 0;
pub const SVC_FAST_INDEX_SHIFT: u32 = 3;
pub const SVC_FAST_INDEX_MASK: u8 = 0xF << SVC_FAST_INDEX_SHIFT;
pub const SVC_FAST_NARGS_MASK: u8 = 0x7;
pub const SVC_CUSTOM_INDEX_MASK: u8 = 0x7F;

/// Second argument of `HaltUserError` when the first is an application code.
pub const HALT_KIND_USER: u32 = 0;
/// Second argument of `HaltUserError` when the first is a `Violation`.
pub const HALT_KIND_VIOLATION: u32 = 1;

/// A decoded supervisor call immediate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Svc {
    Fast { index: u8, nargs: u8 },
    Custom { index: u8 },
}

impl Svc {
    /// Produces the immediate for `self`. Out-of-range fields are truncated to
    /// their bit widths.
    pub const fn encode(self) -> u8 {
        match self {
            Svc::Fast { index, nargs } => {
                SVC_FAST_MODE
                    | ((index << SVC_FAST_INDEX_SHIFT) & SVC_FAST_INDEX_MASK)
                    | (nargs & SVC_FAST_NARGS_MASK)
            }
            Svc::Custom { index } => {
                SVC_CUSTOM_MODE | (index & SVC_CUSTOM_INDEX_MASK)
            }
        }
    }

    /// Splits an immediate into its table and fields. Every immediate decodes;
    /// whether the entry exists is up to the dispatcher.
    pub const fn decode(imm: u8) -> Self {
        if imm & SVC_MODE_MASK == SVC_FAST_MODE {
            Svc::Fast {
                index: (imm & SVC_FAST_INDEX_MASK) >> SVC_FAST_INDEX_SHIFT,
                nargs: imm & SVC_FAST_NARGS_MASK,
            }
        } else {
            Svc::Custom {
                index: imm & SVC_CUSTOM_INDEX_MASK,
            }
        }
    }
}

/// Entries in the fast table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FastSvc {
    RegisterGateway = 0,
    BoxInitFirst = 1,
    BoxInitNext = 2,
    IrqSetVector = 3,
    IrqGetVector = 4,
    IrqEnable = 5,
    IrqDisable = 6,
    IrqClearPending = 7,
    IrqSetPending = 8,
    IrqGetPending = 9,
    IrqSetPriority = 10,
    IrqGetPriority = 11,
    IrqGetLevel = 12,
    IrqDisableAll = 13,
    IrqEnableAll = 14,
}

impl FastSvc {
    /// Number of arguments each entry takes, which is part of its immediate.
    pub const fn nargs(self) -> u8 {
        match self {
            FastSvc::RegisterGateway => 0,
            FastSvc::BoxInitFirst | FastSvc::BoxInitNext => 0,
            FastSvc::IrqSetVector | FastSvc::IrqSetPriority => 2,
            FastSvc::IrqGetLevel
            | FastSvc::IrqDisableAll
            | FastSvc::IrqEnableAll => 0,
            _ => 1,
        }
    }

    pub const fn imm(self) -> u8 {
        Svc::Fast {
            index: self as u8,
            nargs: self.nargs(),
        }
        .encode()
    }
}

impl core::convert::TryFrom<u8> for FastSvc {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::RegisterGateway),
            1 => Ok(Self::BoxInitFirst),
            2 => Ok(Self::BoxInitNext),
            3 => Ok(Self::IrqSetVector),
            4 => Ok(Self::IrqGetVector),
            5 => Ok(Self::IrqEnable),
            6 => Ok(Self::IrqDisable),
            7 => Ok(Self::IrqClearPending),
            8 => Ok(Self::IrqSetPending),
            9 => Ok(Self::IrqGetPending),
            10 => Ok(Self::IrqSetPriority),
            11 => Ok(Self::IrqGetPriority),
            12 => Ok(Self::IrqGetLevel),
            13 => Ok(Self::IrqDisableAll),
            14 => Ok(Self::IrqEnableAll),
            _ => Err(()),
        }
    }
}

/// Entries in the custom (slow) table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CustomSvc {
    /// Halt the calling box. Argument 0 is the reason code, argument 1 one of
    /// the `HALT_KIND_*` values saying how to read it.
    HaltUserError = 1,
    BenchmarkConfigure = 2,
    BenchmarkStart = 3,
    BenchmarkStop = 4,
    DebugRegisterDriver = 5,
    /// Returns the caller's own box ID.
    BoxIdSelf = 6,
    /// Returns the namespace length of the box named by argument 0.
    BoxNamespaceLen = 7,
}

impl CustomSvc {
    pub const fn imm(self) -> u8 {
        Svc::Custom { index: self as u8 }.encode()
    }
}

impl core::convert::TryFrom<u8> for CustomSvc {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::HaltUserError),
            2 => Ok(Self::BenchmarkConfigure),
            3 => Ok(Self::BenchmarkStart),
            4 => Ok(Self::BenchmarkStop),
            5 => Ok(Self::DebugRegisterDriver),
            6 => Ok(Self::BoxIdSelf),
            7 => Ok(Self::BoxNamespaceLen),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_layout() {
        let imm = Svc::Fast { index: 0xA, nargs: 3 }.encode();
        assert_eq!(imm, 0b1_1010_011);
        assert_eq!(Svc::decode(imm), Svc::Fast { index: 0xA, nargs: 3 });
    }

    #[test]
    fn custom_layout() {
        let imm = Svc::Custom { index: 0x55 }.encode();
        assert_eq!(imm, 0x55);
        assert_eq!(Svc::decode(imm), Svc::Custom { index: 0x55 });
    }

    #[test]
    fn every_immediate_decodes_to_itself() {
        for imm in 0..=u8::MAX {
            assert_eq!(Svc::decode(imm).encode(), imm);
        }
    }

    #[test]
    fn named_entries() {
        assert_eq!(FastSvc::IrqSetPriority.imm(), 0x80 | (10 << 3) | 2);
        assert_eq!(CustomSvc::HaltUserError.imm(), 1);
        assert_eq!(FastSvc::try_from(15), Err(()));
    }
}
