// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation of the box configuration table.
//!
//! The table lives in flash and is produced by the application build, so it
//! is trusted not to change, but not trusted to be well formed. Nothing else
//! in a record is looked at until its magic and version check out.

use abi::{
    AclFlags, BoxBssSizes, BoxConfig, BOX_MAGIC, BOX_VERSION, MAX_ACLS_PER_BOX,
    MAX_BOXES, MAX_BOX_NAMESPACE_LEN,
};

/// Reasons the monitor refuses a box table. Variants carrying a `usize`
/// name the offending box.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// No boxes, or more than `MAX_BOXES`.
    BoxCount,
    /// The number of box contexts doesn't match the table.
    ContextCount,
    /// The context at this position isn't for the box at this position.
    ContextOrder(usize),
    BadMagic(usize),
    BadVersion(usize),
    /// Empty, too long, or not printable ASCII.
    BadNamespace(usize),
    /// Same namespace as an earlier box.
    DuplicateNamespace(usize),
    TooManyAcls(usize),
    /// An ACL is empty, wraps the address space, or uses reserved flags.
    BadAcl { index: usize, acl: usize },
    /// Misaligned, or missing for a secure box.
    BadStack(usize),
    BadBss(usize),
}

/// Checks every record in `configs`.
pub fn check_table(configs: &[&BoxConfig]) -> Result<(), ConfigError> {
    if configs.is_empty() || configs.len() > MAX_BOXES {
        return Err(ConfigError::BoxCount);
    }
    for (i, cfg) in configs.iter().enumerate() {
        check_box(i, cfg)?;
        if let Some(ns) = cfg.namespace {
            let mut earlier = configs[..i].iter().filter_map(|c| c.namespace);
            if earlier.any(|other| other == ns) {
                return Err(ConfigError::DuplicateNamespace(i));
            }
        }
    }
    Ok(())
}

fn check_box(index: usize, cfg: &BoxConfig) -> Result<(), ConfigError> {
    if cfg.magic != BOX_MAGIC {
        return Err(ConfigError::BadMagic(index));
    }
    if cfg.version != BOX_VERSION {
        return Err(ConfigError::BadVersion(index));
    }

    if let Some(ns) = cfg.namespace {
        if !namespace_ok(ns) {
            return Err(ConfigError::BadNamespace(index));
        }
    }

    if cfg.acls.len() > MAX_ACLS_PER_BOX {
        return Err(ConfigError::TooManyAcls(index));
    }
    for (a, acl) in cfg.acls.iter().enumerate() {
        let empty = acl.length == 0;
        let wraps = !empty && acl.start.checked_add(acl.length - 1).is_none();
        if empty || wraps || acl.flags.intersects(AclFlags::RESERVED) {
            return Err(ConfigError::BadAcl { index, acl: a });
        }
    }

    // The public box runs on the host kernel's stack.
    if cfg.stack_size % 8 != 0 || (index != 0 && cfg.stack_size == 0) {
        return Err(ConfigError::BadStack(index));
    }

    if !bss_ok(&cfg.bss) {
        return Err(ConfigError::BadBss(index));
    }
    Ok(())
}

fn namespace_ok(ns: &str) -> bool {
    (1..=MAX_BOX_NAMESPACE_LEN).contains(&ns.len())
        && ns.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
}

fn bss_ok(bss: &BoxBssSizes) -> bool {
    let sizes = [
        bss.index,
        bss.context,
        bss.reentrancy,
        bss.rpc,
        bss.ipc,
        bss.heap,
    ];
    bss.index != 0
        && sizes.iter().all(|s| s % 4 == 0)
        && sizes
            .iter()
            .try_fold(0u32, |total, &s| total.checked_add(s))
            .is_some()
}
