// Copyright 2017 Amanieu d'Antras
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// The storage one thread holds in one registry: a value slot for every
/// identifier the thread has written to so far.
///
/// Entries are atomics so that the owning thread can access them without the
/// registry lock while other threads scrape or reclaim them under it. The
/// vector itself is only ever resized by the owning thread, and only while it
/// holds the registry lock. Other threads only look at the vector while
/// holding that same lock.
pub(crate) struct Block {
    entries: UnsafeCell<Vec<AtomicPtr<()>>>,
}

// Access to `entries` follows the protocol described on the type.
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn new() -> Self {
        Block {
            entries: UnsafeCell::new(Vec::new()),
        }
    }

    #[inline]
    fn entries(&self) -> &[AtomicPtr<()>] {
        // Either we are the owner, who is the only one resizing, or we hold
        // the registry lock, which every resize takes.
        unsafe { &*self.entries.get() }
    }

    /// The number of identifiers this block has room for.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    #[inline]
    pub(crate) fn entry(&self, index: usize) -> Option<&AtomicPtr<()>> {
        self.entries().get(index)
    }

    /// Grows the block so that `index` is covered and returns its entry. New
    /// entries start out null, existing ones are kept as they are.
    ///
    /// # Safety
    ///
    /// Must be called by the thread owning the block while it holds the lock
    /// of the registry the block is registered with, and without any
    /// outstanding references into the block.
    pub(crate) unsafe fn grow_to(&self, index: usize) -> &AtomicPtr<()> {
        let entries = &mut *self.entries.get();
        if entries.len() <= index {
            entries.resize_with(index + 1, || AtomicPtr::new(ptr::null_mut()));
        }
        &entries[index]
    }

    /// Atomically swaps the entry at `index` for `value` and returns what was
    /// there before. Entries past the end of the block are left alone and
    /// read as null.
    #[inline]
    pub(crate) fn exchange(&self, index: usize, value: *mut ()) -> *mut () {
        match self.entry(index) {
            Some(entry) => entry.swap(value, Ordering::AcqRel),
            None => ptr::null_mut(),
        }
    }

    /// Takes every non-null value out of the block, paired with its index.
    pub(crate) fn take_all(&self) -> impl Iterator<Item = (usize, *mut ())> + '_ {
        self.entries()
            .iter()
            .map(|entry| entry.swap(ptr::null_mut(), Ordering::AcqRel))
            .enumerate()
            .filter(|(_, value)| !value.is_null())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("len", &self.len()).finish()
    }
}
