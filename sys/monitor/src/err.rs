// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Monitor code spends a lot of its time deciding whose fault something is.
//! These types let that decision travel in a `Result` to the one place that
//! acts on it.

use abi::{FaultInfo, UsageError, Violation};

use crate::Monitor;

/// An error committed by box code when asking the monitor for something.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error, reported to the errant box as a response code.
    Recoverable(u32),
    /// An unrecoverable error, turned into a fault against the errant box,
    /// which is never serviced again.
    Unrecoverable(FaultInfo),
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}

impl From<Violation> for UserError {
    fn from(v: Violation) -> Self {
        Self::Unrecoverable(v.into())
    }
}

/// A fault that arose in an interaction between two boxes (a call result or
/// a message copy).
///
/// By convention, at least one of the fields is `Some`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InteractFault {
    /// Fault in the box data came from.
    pub src: Option<FaultInfo>,
    /// Fault in the box data was going to.
    pub dst: Option<FaultInfo>,
}

impl InteractFault {
    pub fn in_src(fi: impl Into<FaultInfo>) -> Self {
        Self {
            src: Some(fi.into()),
            dst: None,
        }
    }

    pub fn in_dst(fi: impl Into<FaultInfo>) -> Self {
        Self {
            src: None,
            dst: Some(fi.into()),
        }
    }

    /// Records each side of this fault against the corresponding box.
    pub fn apply(self, monitor: &Monitor<'_, '_>, src: usize, dst: usize) {
        if let Some(f) = self.src {
            monitor.force_fault_index(src, f);
        }
        if let Some(f) = self.dst {
            monitor.force_fault_index(dst, f);
        }
    }
}
