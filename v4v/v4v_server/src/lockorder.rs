// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Debug assertions for the lock hierarchy.
//!
//! The hierarchy is strict: L1 (the domain directory) before L2 (a
//! domain's ring registry) before L3 (a ring's state). Each thread records
//! the innermost level it holds; acquiring a level that is not strictly
//! inner to it is a bug. The rule table lock sits outside the hierarchy
//! and is not tracked.

use std::cell::Cell;

/// Lock levels, outermost first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Level {
    Directory = 1,
    Registry = 2,
    Ring = 3,
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

/// Records the acquisition of `level` until dropped. Construct immediately
/// before taking the corresponding lock.
pub(crate) struct Held {
    prev: u8,
}

impl Held {
    pub fn enter(level: Level) -> Self {
        let prev = HELD.get();
        debug_assert!(
            level as u8 > prev,
            "lock order violation: acquiring {level:?} while holding level {prev}"
        );
        HELD.set(level as u8);
        Self { prev }
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        HELD.set(self.prev);
    }
}
