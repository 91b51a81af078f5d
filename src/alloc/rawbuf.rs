//! An append-only stack of handles whose backing array is itself a tracked
//! block.
//!
//! The stack does not own the blocks its handles point to. Its backing
//! array is never freed by the stack on its own (there's no `Drop`); either
//! call [`PtrStack::release()`] or let the allocator's bulk clear take it.
//! After a bulk clear the stack reads as empty and starts over on the next
//! append.

use std::{iter::FusedIterator, mem};

use log::{debug, warn};

use super::{
    meta::Handle,
    tracing::{Released, TrackingAlloc},
};
use crate::error::AllocError;

/// Slots in the first backing array
pub const INITIAL_ALLOTMENT: usize = 8;

const SLOT: usize = mem::size_of::<usize>();

pub struct PtrStack<'a> {
    alloc: &'a TrackingAlloc,
    /// `None` until the first append
    data: Option<Handle>,
    /// Allocator epoch `data` was issued in
    epoch: u64,
    len: usize,
    capacity: usize,
    /// Capacity asked for by the most recent (re)allocation
    allotment: usize,
    /// Bytes appended, one slot per element
    bytes: usize,
    growths: usize,
}

impl<'a> PtrStack<'a> {
    pub fn new(alloc: &'a TrackingAlloc) -> Self {
        Self {
            alloc,
            data: None,
            epoch: 0,
            len: 0,
            capacity: 0,
            allotment: INITIAL_ALLOTMENT,
            bytes: 0,
            growths: 0,
        }
    }

    /// The backing array, unless it was never allocated or a bulk clear has
    /// taken it since.
    fn live_data(&self) -> Option<Handle> {
        self.data.filter(|_| self.epoch == self.alloc.epoch())
    }

    /// Forget a backing array that a bulk clear has already freed.
    fn sync(&mut self) {
        if self.data.is_some() && self.live_data().is_none() {
            debug!("stack backing array was bulk released, starting over");
            *self = Self::new(self.alloc);
        }
    }

    fn slot_bytes(slots: usize) -> Result<usize, AllocError> {
        slots
            .checked_mul(SLOT)
            .ok_or(AllocError::Overflow { requested: slots })
    }

    /// Push `element` on top. Allocates the backing array on first use and
    /// doubles it when full. On failure the stack is left as it was.
    pub fn append(&mut self, element: Handle) -> Result<(), AllocError> {
        self.sync();
        let data = match self.data {
            None => {
                let data = self.alloc.allocate(Self::slot_bytes(INITIAL_ALLOTMENT)?)?;
                self.data = Some(data);
                self.epoch = self.alloc.epoch();
                self.capacity = INITIAL_ALLOTMENT;
                self.allotment = INITIAL_ALLOTMENT;
                data
            }
            Some(data) if self.len == self.capacity => self.grow(data)?,
            Some(data) => data,
        };

        let offset = self.len * SLOT;
        let mut slots = self.alloc.bytes_mut(data).ok_or(AllocError::Unregistered {
            address: data.addr(),
        })?;
        slots[offset..offset + SLOT].copy_from_slice(&element.addr().to_ne_bytes());
        self.len += 1;
        self.bytes += SLOT;
        Ok(())
    }

    /// Move everything into a new array of twice the current length. The new
    /// array is allocated and filled before the old one is released.
    fn grow(&mut self, old: Handle) -> Result<Handle, AllocError> {
        let allotment = self
            .len
            .checked_mul(2)
            .ok_or(AllocError::Overflow { requested: self.len })?;
        let new = self.alloc.allocate(Self::slot_bytes(allotment)?)?;
        if let Err(e) = self.alloc.copy_payload(old, new, self.len * SLOT) {
            let _ = self.alloc.release(Some(new));
            return Err(e);
        }
        if let Released::Unregistered(old) = self.alloc.release(Some(old)) {
            warn!("stack backing array {old:?} was not registered, leaking it");
        }

        debug!(
            "stack grew from {} to {allotment} slots ({} elements)",
            self.capacity, self.len
        );
        self.data = Some(new);
        self.capacity = allotment;
        self.allotment = allotment;
        self.growths += 1;
        Ok(new)
    }

    pub fn len(&self) -> usize {
        self.live_data().map_or(0, |_| self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.live_data().map_or(0, |_| self.capacity)
    }

    pub fn allotment(&self) -> usize {
        self.allotment
    }

    pub fn bytes(&self) -> usize {
        self.live_data().map_or(0, |_| self.bytes)
    }

    /// How many times the backing array has been reallocated
    pub fn growths(&self) -> usize {
        self.growths
    }

    pub fn get(&self, index: usize) -> Option<Handle> {
        if index >= self.len() {
            return None;
        }
        let slots = self.alloc.bytes(self.live_data()?)?;
        let offset = index * SLOT;
        let mut addr = [0u8; SLOT];
        addr.copy_from_slice(&slots[offset..offset + SLOT]);
        Handle::from_raw(usize::from_ne_bytes(addr) as *mut u8)
    }

    /// Elements oldest first. Each call starts from the bottom again.
    pub fn iter(&self) -> Iter<'_, 'a> {
        Iter {
            stack: self,
            front: 0,
            back: self.len(),
        }
    }

    /// Release the backing array now instead of waiting for a bulk clear.
    /// The elements are not touched.
    pub fn release(self) -> Released {
        self.alloc.release(self.live_data())
    }
}

pub struct Iter<'s, 'a> {
    stack: &'s PtrStack<'a>,
    front: usize,
    back: usize,
}

impl Iter<'_, '_> {
    /// `back`, unless a bulk clear has emptied the stack since
    fn end(&self) -> usize {
        self.back.min(self.stack.len())
    }
}

impl Iterator for Iter<'_, '_> {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        if self.front >= self.end() {
            return None;
        }
        let element = self.stack.get(self.front)?;
        self.front += 1;
        Some(element)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end().saturating_sub(self.front);
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for Iter<'_, '_> {
    fn next_back(&mut self) -> Option<Handle> {
        let end = self.end();
        if self.front >= end {
            return None;
        }
        let element = self.stack.get(end - 1)?;
        self.back = end - 1;
        Some(element)
    }
}

impl ExactSizeIterator for Iter<'_, '_> {}

impl FusedIterator for Iter<'_, '_> {}

impl<'s, 'a> IntoIterator for &'s PtrStack<'a> {
    type Item = Handle;
    type IntoIter = Iter<'s, 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
