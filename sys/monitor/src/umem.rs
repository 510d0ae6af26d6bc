// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with box memory.

use abi::{FaultInfo, Violation};
use boxlib::ipc::UBuf;

use crate::err::InteractFault;

/// A section of box memory, described by a box.
///
/// A `USlice` is only known to be address-space sane: nonzero base and no
/// wrap. Whether the box may actually touch it is an MPU question.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct USlice {
    base_address: usize,
    length: usize,
}

impl USlice {
    /// Constructs a `USlice` given a base address and length passed from
    /// unprivileged code.
    pub fn from_raw(base_address: usize, length: usize) -> Result<Self, FaultInfo> {
        if base_address == 0 {
            return Err(Violation::BadBuffer.into());
        }
        // Ensure that the slice doesn't wrap the address space.
        if base_address.checked_add(length).is_none() {
            return Err(Violation::BadBuffer.into());
        }
        Ok(Self {
            base_address,
            length,
        })
    }

    pub fn from_ubuf(buf: &UBuf) -> Result<Self, FaultInfo> {
        Self::from_raw(buf.base, buf.len)
    }

    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the address just past the end of this slice.
    pub fn end_addr(&self) -> usize {
        // Can't overflow, checked at construction.
        self.base_address + self.length
    }

    /// Checks whether this slice shares any bytes with `other`.
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base_address < other.end_addr()
            && other.base_address < self.end_addr()
    }
}

/// Copies `len` bytes from the start of `from` to the start of `to`, both in
/// box memory, and returns `len`.
///
/// A source shorter than `len` is the sender's fault. A destination shorter
/// than `len`, or one that overlaps the source, is the receiver's.
///
/// # Safety
///
/// Both slices must describe memory that is mapped and, for `to`, writable,
/// and nothing else may be accessing it during the copy. On hardware this is
/// what the boxes' MPU regions vouch for.
pub unsafe fn safe_copy(
    from: &USlice,
    to: &USlice,
    len: usize,
) -> Result<usize, InteractFault> {
    if from.len() < len {
        return Err(InteractFault::in_src(Violation::BadBuffer));
    }
    if to.len() < len || from.overlaps(to) {
        return Err(InteractFault::in_dst(Violation::BadBuffer));
    }
    // Safety: lengths checked above, disjointness checked above, mapping
    // promised by our caller.
    unsafe {
        core::ptr::copy_nonoverlapping(
            from.base_addr() as *const u8,
            to.base_addr() as *mut u8,
            len,
        );
    }
    Ok(len)
}
