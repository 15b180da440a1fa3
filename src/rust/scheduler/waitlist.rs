// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::fail::Fail,
    scheduler::fiber::FiberId,
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fiber waiting for another one to finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitEntry {
    pub waiter: FiberId,
}

/// Fibers waiting on a given fiber, in the order they started waiting.
#[derive(Debug, Default)]
pub struct WaitList {
    entries: VecDeque<WaitEntry>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WaitList {
    /// Appends `waiter` to the list.
    pub fn push(&mut self, waiter: FiberId) -> Result<(), Fail> {
        if let Err(e) = self.entries.try_reserve(1) {
            let cause: String = format!("cannot allocate wait entry (waiter={:?}, error={:?})", waiter, e);
            error!("push(): {}", cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }
        self.entries.push_back(WaitEntry { waiter });
        Ok(())
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = WaitEntry> + '_ {
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
