// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A three-box system for integration tests: the public box, a client and a
//! server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use boxlib::{BoxConfig, BoxContext, BoxId, BoxPools};
use monitor::Monitor;

pub const CLIENT: usize = 1;
pub const SERVER: usize = 2;

pub static PUBLIC_CFG: BoxConfig =
    BoxConfig::new(None, 0, boxlib::bss_sizes(0, 0), &[]);
pub static CLIENT_CFG: BoxConfig =
    BoxConfig::new(Some("client"), 2048, boxlib::bss_sizes(16, 1024), &[]);
pub static SERVER_CFG: BoxConfig =
    BoxConfig::new(Some("server"), 2048, boxlib::bss_sizes(16, 1024), &[]);

pub static CONFIGS: [&BoxConfig; 3] = [&PUBLIC_CFG, &CLIENT_CFG, &SERVER_CFG];

pub fn pools() -> [BoxPools; 3] {
    [BoxPools::new(), BoxPools::new(), BoxPools::new()]
}

pub fn contexts(pools: &[BoxPools; 3]) -> [BoxContext<'_>; 3] {
    [0, 1, 2].map(|i| BoxContext::new(BoxId(i as u16), 3, &pools[i]))
}

/// Sets its flag when dropped, so helper threads wind down even when a test
/// assertion fails.
pub struct Stop<'a>(pub &'a AtomicBool);

impl Drop for Stop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Runs `body` with a thread draining `monitor` continuously, the way box
/// switches would on hardware.
pub fn with_drainer<R>(monitor: &Monitor<'_, '_>, body: impl FnOnce() -> R) -> R {
    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                monitor.drain();
                thread::yield_now();
            }
        });
        let _stop = Stop(&done);
        body()
    })
}
