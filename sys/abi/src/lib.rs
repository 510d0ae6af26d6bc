// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor ABI definitions, shared between the privileged monitor and boxes.
//!
//! Everything in here is a contract between code running in different
//! privilege levels (or in different boxes), so changing the representation of
//! any of these types is an ABI break.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod config;
pub mod svc;

pub use config::*;

/// Maximum number of boxes in one application, including the public box.
pub const MAX_BOXES: usize = 16;

/// Number of outgoing RPC message slots each box owns.
pub const RPC_OUTGOING_MESSAGE_SLOTS: usize = 8;
/// Number of incoming RPC message slots each box owns. These are shared by the
/// box's to-do and done queues.
pub const RPC_INCOMING_MESSAGE_SLOTS: usize = 8;
/// Number of function groups a box can have waiting at once.
pub const RPC_FN_GROUP_SLOTS: usize = 8;
/// Maximum number of targets in a single function group.
pub const RPC_FN_GROUP_MAX_TARGETS: usize = 8;

/// Number of in-flight IPC sends per box.
pub const IPC_SEND_SLOTS: usize = 16;
/// Number of in-flight IPC receives per box.
pub const IPC_RECV_SLOTS: usize = 16;
/// Largest IPC message, in bytes.
pub const IPC_MAX_MESSAGE_LEN: usize = 512;

/// Timeout value meaning "block until the condition holds."
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Names one record in a slot pool.
///
/// Valid indices are `0..Slot::MAX_VALID`. The top of the 8-bit range is
/// reserved for three sentinels, which pool operations hand back to say why
/// something didn't happen.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Slot(pub u8);

impl Slot {
    /// No slot, or a generic error.
    pub const INVALID: Self = Self(0xFF);
    /// The slot was already removed from its queue.
    pub const IS_DEQUEUED: Self = Self(0xFE);
    /// The slot was already returned to its pool.
    pub const IS_FREE: Self = Self(0xFD);
    /// One past the highest valid index. Pools can't be bigger than this.
    pub const MAX_VALID: u8 = 252;

    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Checks whether this is a real index rather than a sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 < Self::MAX_VALID
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

const_assert!(Slot::IS_FREE.0 >= Slot::MAX_VALID);

/// Identifies a box by its position in the box configuration table.
///
/// Box 0 is the public box.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct BoxId(pub u16);

impl BoxId {
    /// The public box, which owns everything not explicitly secured.
    pub const PUBLIC: Self = Self(0);
    /// Wildcard accepted by IPC receives: take a message from any sender.
    pub const ANY: Self = Self(0xFFFF);
    /// Reserved "no box" value.
    pub const INVALID: Self = Self(0xFFFE);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks whether `self` names one of `box_count` boxes.
    pub const fn is_in_range(self, box_count: usize) -> bool {
        (self.0 as usize) < box_count
    }
}

const_assert!(MAX_BOXES < BoxId::INVALID.0 as usize);

/// Number of low bits in a `ResultToken` used for the slot index.
pub const RESULT_SLOT_BITS: u32 = 10;
/// Mask selecting the slot index portion of a `ResultToken`.
pub const RESULT_SLOT_MASK: u32 = (1 << RESULT_SLOT_BITS) - 1;
/// Mask selecting the counter portion of a `ResultToken`.
pub const RESULT_COUNTER_MASK: u32 = !RESULT_SLOT_MASK;

const_assert!(Slot::MAX_VALID as u32 <= RESULT_SLOT_MASK);

/// Correlation value naming one outstanding RPC.
///
/// The low `RESULT_SLOT_BITS` bits hold the caller's outgoing message slot; the
/// remaining top bits hold a per-box counter that is advanced by 2 for every
/// call. Because the counter is always even, the counter field can never be
/// all ones, and so a live token can never equal `ResultToken::INVALID`.
///
/// The same value is used as the message's wait and match cookies.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ResultToken(pub u32);

impl ResultToken {
    pub const INVALID: Self = Self(!0);

    /// Fabricates a token for a counter value and slot.
    pub const fn new(counter: ResultCounter, slot: Slot) -> Self {
        Self((counter.0 << RESULT_SLOT_BITS) | (slot.0 as u32 & RESULT_SLOT_MASK))
    }

    /// Extracts the slot part of this token. Slot bits that don't fit in a
    /// `Slot` come back as `Slot::INVALID`.
    pub fn slot(self) -> Slot {
        u8::try_from(self.0 & RESULT_SLOT_MASK)
            .map(Slot)
            .unwrap_or(Slot::INVALID)
    }

    /// Extracts the counter part of this token.
    pub const fn counter(self) -> ResultCounter {
        ResultCounter(self.0 >> RESULT_SLOT_BITS)
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

/// The per-box counter folded into every `ResultToken`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct ResultCounter(u32);

impl ResultCounter {
    pub const ZERO: Self = Self(0);

    /// Largest value the counter field can hold.
    const MAX: u32 = RESULT_COUNTER_MASK >> RESULT_SLOT_BITS;

    /// Rebuilds a counter from [`ResultCounter::get`]. Bits outside the
    /// counter field are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::MAX)
    }

    /// Advances the counter by 2, wrapping within the counter field. Starting
    /// from an even value, this never produces the all-ones field value.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(2) & Self::MAX)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

/// IPC token value meaning "no token." Tokens are single-bit masks, so this is
/// never handed out.
pub const IPC_INVALID_TOKEN: u32 = 0;

/// Port value reserved as invalid in IPC descriptors.
pub const IPC_PORT_INVALID: u32 = !0;

/// Lifecycle of an RPC message, in either the caller's outgoing queue or the
/// callee's incoming queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RpcMessageState {
    /// Never used.
    #[default]
    Invalid = 0,
    /// Allocated but not yet filled in, or finished with.
    Idle = 1,
    /// Filled in by the caller, waiting for the monitor to pick it up.
    ReadyToSend = 2,
    /// Picked up by the monitor. Only the monitor writes this.
    Sent = 3,
    /// Result is available.
    Done = 4,
}

impl core::convert::TryFrom<u32> for RpcMessageState {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Idle),
            2 => Ok(Self::ReadyToSend),
            3 => Ok(Self::Sent),
            4 => Ok(Self::Done),
            _ => Err(()),
        }
    }
}

/// Lifecycle of an IPC send or receive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum IpcIoState {
    #[default]
    Invalid = 0,
    Idle = 1,
    ReadyToSend = 2,
    ReadyToRecv = 3,
    /// Transfer complete.
    Valid = 4,
}

impl core::convert::TryFrom<u32> for IpcIoState {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Idle),
            2 => Ok(Self::ReadyToSend),
            3 => Ok(Self::ReadyToRecv),
            4 => Ok(Self::Valid),
            _ => Err(()),
        }
    }
}

/// Describes one IPC transfer.
///
/// For a send, `box_id` is the destination. For a receive, it's the sender to
/// accept from (or `BoxId::ANY`); once the receive completes, the delivered
/// copy of the descriptor names the actual sender.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IpcDesc {
    pub box_id: BoxId,
    pub port: u32,
    /// Length of the message in bytes. For a receive, this is filled in with
    /// the delivered length on completion.
    pub len: usize,
    /// Token assigned when the transfer was queued.
    pub token: u32,
}

impl IpcDesc {
    pub const fn new(box_id: BoxId, port: u32, len: usize) -> Self {
        Self {
            box_id,
            port,
            len,
            token: IPC_INVALID_TOKEN,
        }
    }
}

/// Recoverable errors from the RPC API.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum RpcError {
    /// All message or function group slots are in use. Try again later.
    OutOfStructures = 1,
    /// The operation didn't complete before the timeout.
    Timeout = 2,
    /// Bad arguments (e.g. an empty or oversized function group).
    InvalidParameter = 3,
    /// A blocking wait was attempted from an interrupt handler.
    InvalidContext = 4,
}

impl From<RpcError> for u32 {
    fn from(e: RpcError) -> Self {
        e as u32
    }
}

/// Recoverable errors from the IPC API.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum IpcError {
    /// All send or receive slots are in use.
    OutOfStructures = 1,
    /// All 32 tokens are in use.
    OutOfTokens = 2,
    Timeout = 3,
    InvalidBoxId = 4,
    InvalidPort = 5,
    /// Zero-length, oversized, or disagreeing with the buffer.
    InvalidLength = 6,
    /// Empty wait mask, or a mask naming tokens that aren't allocated.
    InvalidTokens = 7,
}

impl From<IpcError> for u32 {
    fn from(e: IpcError) -> Self {
        e as u32
    }
}

/// Response code returned by the monitor for supervisor calls that belong to
/// collaborators outside this core.
pub const NOT_SUPPORTED: u32 = 0xFFFF_FF00;

/// A record describing why a box was halted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The box broke the RPC/IPC protocol, either by accident or on purpose.
    Violation(Violation),
    /// Arguments passed to a supervisor call were invalid.
    SyscallUsage(UsageError),
    /// The box halted itself with an application error code.
    UserHalt(u32),
}

impl From<Violation> for FaultInfo {
    fn from(v: Violation) -> Self {
        Self::Violation(v)
    }
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// Protocol violations. These indicate either a bug or a box trying to
/// interfere with another box's calls, and are always fatal to the box.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(u32)]
pub enum Violation {
    /// A result wait was attempted on a token whose wait cookie has already
    /// been consumed.
    DoubleWait = 1,
    /// A completed call's match cookie doesn't name the caller's outstanding
    /// call.
    CookieMismatch = 2,
    /// A result token names a slot that can't hold an outstanding call.
    ForeignResult = 3,
    /// An RPC or register gateway failed validation.
    BadGateway = 4,
    /// A gateway was invoked through the wrong kind of call.
    GatewayKind = 5,
    /// A queue structure in box memory is corrupt.
    BadQueue = 6,
    /// A slot was used in a state that doesn't allow it.
    SlotMisuse = 7,
    /// An IPC buffer doesn't describe usable memory.
    BadBuffer = 8,
    /// An IPC descriptor in box memory names an impossible peer.
    BadDescriptor = 9,
}

impl core::convert::TryFrom<u32> for Violation {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::DoubleWait),
            2 => Ok(Self::CookieMismatch),
            3 => Ok(Self::ForeignResult),
            4 => Ok(Self::BadGateway),
            5 => Ok(Self::GatewayKind),
            6 => Ok(Self::BadQueue),
            7 => Ok(Self::SlotMisuse),
            8 => Ok(Self::BadBuffer),
            9 => Ok(Self::BadDescriptor),
            _ => Err(()),
        }
    }
}

/// A monitor-defined fault, arising from how a box used a supervisor call.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A box used an undefined supervisor call immediate.
    BadSvcNumber,
    /// A box named a box ID that will never be valid.
    BoxOutOfRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_sentinels_are_invalid() {
        for s in [Slot::INVALID, Slot::IS_DEQUEUED, Slot::IS_FREE] {
            assert!(!s.is_valid());
        }
        assert!(Slot(251).is_valid());
        assert!(!Slot(252).is_valid());
    }

    #[test]
    fn token_layout() {
        let t = ResultToken::new(ResultCounter::ZERO.next(), Slot(5));
        assert_eq!(t.0, (2 << 10) | 5);
        assert_eq!(t.slot(), Slot(5));
        assert_eq!(t.counter(), ResultCounter(2));
    }

    #[test]
    fn counter_never_produces_invalid() {
        // Walk the counter all the way around its field.
        let mut c = ResultCounter::ZERO;
        for _ in 0..(1 << 21) + 2 {
            c = c.next();
            assert_eq!(c.get() & 1, 0);
            let t = ResultToken::new(c, Slot(Slot::MAX_VALID - 1));
            assert!(t.is_valid());
        }
        // Max slot bits plus max counter would be all ones; the counter never
        // gets there.
        assert_eq!(
            ResultToken((ResultCounter::MAX << RESULT_SLOT_BITS) | RESULT_SLOT_MASK),
            ResultToken::INVALID
        );
    }

    #[test]
    fn oversized_slot_bits_decode_invalid() {
        assert_eq!(ResultToken(0x3FF).slot(), Slot::INVALID);
    }

    #[test]
    fn violation_codes_round_trip() {
        for v in [
            Violation::DoubleWait,
            Violation::CookieMismatch,
            Violation::BadDescriptor,
        ] {
            assert_eq!(Violation::try_from(v as u32), Ok(v));
        }
        assert_eq!(Violation::try_from(0), Err(()));
    }
}
