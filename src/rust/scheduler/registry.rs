// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Registry of live fibers.
//!
//! Fiber records live in a slab. The records form a circular doubly-linked list whose links are slab offsets rather
//! than pointers, so the ring can be walked, printed and checked without ever dereferencing a freed record. The ring
//! starts at the root fiber and is kept in creation order, which is also the round-robin order.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::fail::Fail,
    scheduler::fiber::{
        Fiber,
        FiberId,
        FiberStatus,
    },
};
use ::slab::Slab;
use ::std::collections::HashMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Internal offset into the slab that holds a fiber record.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Hash)]
pub struct InternalId(usize);

/// Outcome of unlinking a record from the ring.
#[derive(Debug)]
pub enum Removal {
    /// The record was removed. Scanning continues at `next`.
    Next { fiber: Fiber, next: InternalId },
    /// The record was the last one: the ring is now empty.
    Emptied { fiber: Fiber },
}

/// Circular list of live fibers.
pub struct Registry {
    /// Fiber records.
    fibers: Slab<Fiber>,
    /// Mapping between fiber identifiers and slab offsets.
    ids: HashMap<FiberId, InternalId>,
    /// Head of the ring. Only `None` once the ring has been emptied.
    root: Option<InternalId>,
    /// Fiber that is executing now.
    current: InternalId,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Registry {
    /// Creates a registry that holds only `root`, which is also the current fiber.
    pub fn new(root: Fiber) -> Self {
        let mut fibers: Slab<Fiber> = Slab::<Fiber>::with_capacity(16);
        let id: FiberId = root.id();
        let key: InternalId = InternalId::from(fibers.insert(root));
        fibers[key.into()].next = key;
        fibers[key.into()].prev = key;
        let mut ids: HashMap<FiberId, InternalId> = HashMap::<FiberId, InternalId>::default();
        ids.insert(id, key);
        Self {
            fibers,
            ids,
            root: Some(key),
            current: key,
        }
    }

    /// Links `fiber` at the tail of the ring, right before the root.
    pub fn insert(&mut self, mut fiber: Fiber) -> Result<InternalId, Fail> {
        let id: FiberId = fiber.id();
        if self.ids.contains_key(&id) {
            let cause: String = format!("fiber identifier already registered (id={:?})", id);
            error!("insert(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        let root: InternalId = self.root_key()?;
        let tail: InternalId = self.fibers[root.into()].prev;

        fiber.next = root;
        fiber.prev = tail;
        let key: InternalId = InternalId::from(self.fibers.insert(fiber));
        self.fibers[tail.into()].next = key;
        self.fibers[root.into()].prev = key;
        self.ids.insert(id, key);
        trace!("insert(): id={:?} key={:?} count={:?}", id, key, self.fibers.len());
        Ok(key)
    }

    /// Unlinks the record at `key`, patching its neighbours. When the root goes away, its successor becomes the root.
    /// When the current fiber goes away, its successor becomes current.
    pub fn remove(&mut self, key: InternalId) -> Result<Removal, Fail> {
        if !self.fibers.contains(key.into()) {
            let cause: String = format!("no fiber record at this offset (key={:?})", key);
            error!("remove(): {}", cause);
            return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
        }

        let (next, prev): (InternalId, InternalId) = {
            let fiber: &Fiber = &self.fibers[key.into()];
            (fiber.next, fiber.prev)
        };
        let fiber: Fiber = self.fibers.remove(key.into());
        self.ids.remove(&fiber.id());

        if next == key {
            // That was the only record.
            self.root = None;
            debug!("remove(): registry emptied (id={:?})", fiber.id());
            return Ok(Removal::Emptied { fiber });
        }

        self.fibers[prev.into()].next = next;
        self.fibers[next.into()].prev = prev;
        if self.root == Some(key) {
            self.root = Some(next);
        }
        if self.current == key {
            self.current = next;
        }
        trace!("remove(): id={:?} count={:?}", fiber.id(), self.fibers.len());
        Ok(Removal::Next { fiber, next })
    }

    /// Number of live fibers.
    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// Looks up the slab offset of a fiber.
    pub fn key_of(&self, id: FiberId) -> Option<InternalId> {
        self.ids.get(&id).copied()
    }

    pub fn get(&self, key: InternalId) -> Option<&Fiber> {
        self.fibers.get(key.into())
    }

    pub fn get_mut(&mut self, key: InternalId) -> Option<&mut Fiber> {
        self.fibers.get_mut(key.into())
    }

    pub fn by_id(&self, id: FiberId) -> Option<&Fiber> {
        self.get(self.key_of(id)?)
    }

    pub fn by_id_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        let key: InternalId = self.key_of(id)?;
        self.get_mut(key)
    }

    /// Status of a live fiber.
    pub fn status(&self, id: FiberId) -> Option<FiberStatus> {
        self.by_id(id).map(Fiber::status)
    }

    /// Successor of `key` in the ring.
    pub fn next_of(&self, key: InternalId) -> Result<InternalId, Fail> {
        match self.fibers.get(key.into()) {
            Some(fiber) => Ok(fiber.next),
            None => {
                let cause: String = format!("dangling ring link (key={:?})", key);
                error!("next_of(): {}", cause);
                Err(Fail::new(libc::ENOTRECOVERABLE, &cause))
            },
        }
    }

    pub fn root_key(&self) -> Result<InternalId, Fail> {
        match self.root {
            Some(root) => Ok(root),
            None => {
                let cause: &str = "registry has no root";
                error!("root_key(): {}", cause);
                Err(Fail::new(libc::ENOTRECOVERABLE, cause))
            },
        }
    }

    pub fn current_key(&self) -> InternalId {
        self.current
    }

    pub fn set_current(&mut self, key: InternalId) {
        debug_assert!(self.fibers.contains(key.into()));
        self.current = key;
    }

    /// Record of the executing fiber.
    pub fn current(&self) -> Result<&Fiber, Fail> {
        match self.fibers.get(self.current.into()) {
            Some(fiber) => Ok(fiber),
            None => Err(Fail::new(libc::ENOTRECOVERABLE, "current fiber is gone")),
        }
    }

    pub fn current_mut(&mut self) -> Result<&mut Fiber, Fail> {
        match self.fibers.get_mut(self.current.into()) {
            Some(fiber) => Ok(fiber),
            None => Err(Fail::new(libc::ENOTRECOVERABLE, "current fiber is gone")),
        }
    }

    /// Identifiers of every live fiber in ring order, starting at the root.
    pub fn ids(&self) -> Vec<FiberId> {
        let mut ids: Vec<FiberId> = Vec::<FiberId>::with_capacity(self.fibers.len());
        if let Some(root) = self.root {
            let mut key: InternalId = root;
            loop {
                let fiber: &Fiber = &self.fibers[key.into()];
                ids.push(fiber.id());
                key = fiber.next;
                if key == root || ids.len() > self.fibers.len() {
                    break;
                }
            }
        }
        ids
    }

    /// Walks the ring in both directions and checks that it reaches every record exactly once.
    pub fn check_links(&self) -> Result<(), Fail> {
        let root: InternalId = self.root_key()?;
        if !self.fibers.contains(self.current.into()) {
            return Err(Fail::new(libc::ENOTRECOVERABLE, "current fiber is not registered"));
        }

        let mut reached: usize = 0;
        let mut key: InternalId = root;
        loop {
            let fiber: &Fiber = match self.fibers.get(key.into()) {
                Some(fiber) => fiber,
                None => return Err(Fail::new(libc::ENOTRECOVERABLE, "ring points to a freed record")),
            };
            match self.fibers.get(fiber.next.into()) {
                Some(next) if next.prev == key => (),
                _ => return Err(Fail::new(libc::ENOTRECOVERABLE, "ring links are not symmetric")),
            }
            if self.ids.get(&fiber.id()) != Some(&key) {
                return Err(Fail::new(libc::ENOTRECOVERABLE, "identifier index is stale"));
            }
            reached += 1;
            if reached > self.fibers.len() {
                return Err(Fail::new(libc::ENOTRECOVERABLE, "ring does not close"));
            }
            key = fiber.next;
            if key == root {
                break;
            }
        }

        if reached != self.fibers.len() || self.ids.len() != self.fibers.len() {
            let cause: String = format!(
                "live count does not match ring (reached={:?}, count={:?})",
                reached,
                self.fibers.len()
            );
            return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<usize> for InternalId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<InternalId> for usize {
    fn from(value: InternalId) -> Self {
        value.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
