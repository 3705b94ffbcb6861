// Copyright 2017 Amanieu d'Antras
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread pointer slots with cleanup on thread exit
//!
//! This library provides the `Slot` type, a handle to a pointer-sized value
//! that every thread has its own copy of. Unlike the standard library's
//! `thread_local!` macro, slots are created and destroyed at runtime, and the
//! values left behind in other threads can be collected with `scrape`.
//!
//! Values are opaque `*mut ()` tokens and null means "no value". The library
//! never looks at what they point to. Instead, a slot can be given an unref
//! handler, which is called exactly once on every value the library discards:
//! when a thread exits while still holding a value, and when the slot itself
//! is dropped while other threads still hold values.
//!
//! Reading and writing the current thread's value is lock-free. Creating and
//! dropping slots, a thread's first use of a slot and scraping take a single
//! registry-wide lock.
//!
//! Unref handlers run while that lock is held. They must not touch any slot,
//! or they will deadlock. A slot's handler is looked up when a value is
//! discarded, so handlers should be fixed when the slot is created.
//!
//! `OwnedSlot` is a typed wrapper storing a `Box<T>` per thread, which is
//! dropped instead of calling a handler.
//!
//! # Examples
//!
//! Basic usage of `Slot`:
//!
//! ```rust
//! use thread_slot::Slot;
//! let slot = Slot::new();
//! assert!(slot.get().is_null());
//! slot.reset(8 as *mut ());
//! assert_eq!(slot.get(), 8 as *mut ());
//! ```
//!
//! Collecting per-thread counters:
//!
//! ```rust
//! use thread_slot::OwnedSlot;
//! use std::sync::Arc;
//! use std::sync::Barrier;
//! use std::thread;
//!
//! let counters = Arc::new(OwnedSlot::<u64>::new());
//! let barrier = Arc::new(Barrier::new(6));
//!
//! let threads: Vec<_> = (0..5)
//!     .map(|_| {
//!         let counters = counters.clone();
//!         let barrier = barrier.clone();
//!         thread::spawn(move || {
//!             // Count some events...
//!             let count = counters.take().unwrap_or(0);
//!             counters.set(count + 1);
//!             barrier.wait();
//!             barrier.wait();
//!         })
//!     })
//!     .collect();
//!
//! // Once every thread has counted, move all counters out and sum them up.
//! barrier.wait();
//! let total: u64 = counters.drain().into_iter().sum();
//! assert_eq!(total, 5);
//! barrier.wait();
//!
//! for thread in threads {
//!     thread.join().unwrap();
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "nightly", feature(thread_local))]

mod block;
mod local;
mod mutex;
mod owned;
mod registry;

pub use owned::OwnedSlot;
pub use registry::Registry;

use std::fmt;
use std::sync::Arc;

/// Cleanup function called on a value the registry discards.
pub type UnrefHandler = Arc<dyn Fn(*mut ()) + Send + Sync>;

/// Identifier of a slot within its registry.
///
/// Identifiers are small and are reused once a slot has been dropped and its
/// values have been cleared from every thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub(crate) u32);

impl SlotId {
    /// Returns the raw identifier.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    // Blocks never grow past an issued identifier, so every index fits.
    #[inline]
    pub(crate) fn from_index(index: usize) -> SlotId {
        SlotId(index as u32)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Per-thread pointer slot
///
/// See the [module-level documentation](index.html) for more.
pub struct Slot {
    id: SlotId,
    registry: &'static Registry,
}

impl Slot {
    /// Creates a new slot in the global registry, without an unref handler.
    pub fn new() -> Slot {
        Slot::new_in(Registry::global(), None)
    }

    /// Creates a new slot in the global registry. `handler` is called on every
    /// value discarded by a thread exiting or by dropping the slot.
    pub fn with_handler<F>(handler: F) -> Slot
    where
        F: Fn(*mut ()) + Send + Sync + 'static,
    {
        let handler: UnrefHandler = Arc::new(handler);
        Slot::new_in(Registry::global(), Some(handler))
    }

    /// Creates a new slot in the given registry.
    pub fn new_in(registry: &'static Registry, handler: Option<UnrefHandler>) -> Slot {
        let id = registry.allocate_id();
        if handler.is_some() {
            registry.set_handler(id, handler);
        }
        Slot { id, registry }
    }

    /// Returns the identifier of this slot.
    #[inline]
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Returns the registry this slot lives in.
    #[inline]
    pub fn registry(&self) -> &'static Registry {
        self.registry
    }

    /// Returns the current thread's value, or null if it has none.
    #[inline]
    pub fn get(&self) -> *mut () {
        self.registry.get(self.id)
    }

    /// Sets the current thread's value. The previous value is overwritten
    /// without calling the unref handler.
    #[inline]
    pub fn reset(&self, value: *mut ()) {
        self.registry.reset(self.id, value)
    }

    /// Sets the current thread's value and returns the previous one.
    #[inline]
    pub fn swap(&self, value: *mut ()) -> *mut () {
        self.registry.swap(self.id, value)
    }

    /// Sets the current thread's value to `new` if it is currently `expected`.
    ///
    /// On success the previous value is returned in `Ok`, which is always
    /// `expected`. Otherwise the value is left alone and returned in `Err`,
    /// so it can be used for the next attempt.
    #[inline]
    pub fn compare_and_swap(
        &self,
        expected: *mut (),
        new: *mut (),
    ) -> Result<*mut (), *mut ()> {
        self.registry.compare_and_swap(self.id, expected, new)
    }

    /// Replaces the value of every thread with `replacement` and returns the
    /// non-null values that were replaced.
    ///
    /// The unref handler is not called on the returned values, they now belong
    /// to the caller. Threads that never wrote to this slot are left alone.
    pub fn scrape(&self, replacement: *mut ()) -> Vec<*mut ()> {
        self.registry.scrape(self.id, replacement)
    }
}

impl Default for Slot {
    fn default() -> Slot {
        Slot::new()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.registry.free_id(self.id);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot {{ id: {}, local_data: {:?} }}", self.id, self.get())
    }
}
