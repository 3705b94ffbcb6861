// Copyright 2017 Amanieu d'Antras
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Registry, Slot, SlotId, UnrefHandler};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

/// Typed wrapper around [`Slot`] that owns one `T` per thread.
///
/// Values are boxed and moved in and out of the slot as a whole, so a value
/// can never be observed by a thread while another thread drains it. Values
/// left behind are dropped when their thread exits or when the `OwnedSlot`
/// is dropped, whichever comes first.
///
/// `T` is dropped while the registry lock is held, so dropping it must not
/// touch any slot.
pub struct OwnedSlot<T: Send + 'static> {
    slot: Slot,
    // Values are only ever moved between threads, never shared.
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> OwnedSlot<T> {
    /// Creates a new slot in the global registry.
    pub fn new() -> OwnedSlot<T> {
        OwnedSlot::new_in(Registry::global())
    }

    /// Creates a new slot in the given registry.
    pub fn new_in(registry: &'static Registry) -> OwnedSlot<T> {
        let handler: UnrefHandler = Arc::new(|ptr: *mut ()| {
            // Only pointers produced by `into_raw` below are ever stored, and
            // each is handed to exactly one taker.
            drop(unsafe { from_raw::<T>(ptr) });
        });
        OwnedSlot {
            slot: Slot::new_in(registry, Some(handler)),
            _marker: PhantomData,
        }
    }

    /// Returns the identifier of the underlying slot.
    #[inline]
    pub fn id(&self) -> SlotId {
        self.slot.id()
    }

    /// Returns whether the current thread holds a value.
    #[inline]
    pub fn is_set(&self) -> bool {
        !self.slot.get().is_null()
    }

    /// Stores `value` for the current thread, dropping the previous value.
    pub fn set(&self, value: T) {
        drop(self.replace(value));
    }

    /// Stores `value` for the current thread and returns the previous value.
    pub fn replace(&self, value: T) -> Option<T> {
        let old = self.slot.swap(into_raw(value));
        unsafe { from_raw(old) }
    }

    /// Moves the current thread's value out of the slot.
    pub fn take(&self) -> Option<T> {
        let old = self.slot.swap(ptr::null_mut());
        unsafe { from_raw(old) }
    }

    /// Moves the values of all threads out of the slot, in unspecified order.
    pub fn drain(&self) -> Vec<T> {
        self.slot
            .scrape(ptr::null_mut())
            .into_iter()
            .filter_map(|ptr| unsafe { from_raw(ptr) })
            .collect()
    }
}

impl<T: Send + 'static> Default for OwnedSlot<T> {
    fn default() -> OwnedSlot<T> {
        OwnedSlot::new()
    }
}

impl<T: Send + 'static> fmt::Debug for OwnedSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedSlot")
            .field("id", &self.id())
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[inline]
fn into_raw<T>(value: T) -> *mut () {
    Box::into_raw(Box::new(value)).cast()
}

/// # Safety
///
/// `ptr` must be null or come from `into_raw::<T>`, and must not be used
/// again afterwards.
#[inline]
unsafe fn from_raw<T>(ptr: *mut ()) -> Option<T> {
    if ptr.is_null() {
        None
    } else {
        Some(*Box::from_raw(ptr.cast::<T>()))
    }
}

#[cfg(test)]
mod tests {
    use super::OwnedSlot;
    use crate::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    struct Dropped(Arc<AtomicUsize>);

    impl Drop for Dropped {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn set_take_replace() {
        let slot = OwnedSlot::new();
        assert!(!slot.is_set());
        assert_eq!(slot.take(), None);

        slot.set(String::from("a"));
        assert!(slot.is_set());
        assert_eq!(slot.replace(String::from("b")).as_deref(), Some("a"));
        assert_eq!(slot.take().as_deref(), Some("b"));
        assert!(!slot.is_set());
    }

    #[test]
    fn zero_sized_values() {
        let slot = OwnedSlot::<()>::new();
        slot.set(());
        assert!(slot.is_set());
        assert_eq!(slot.drain(), vec![()]);
        assert!(!slot.is_set());
    }

    #[test]
    fn drops_on_thread_exit() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(OwnedSlot::new_in(Registry::leaked()));

        let (slot2, dropped2) = (slot.clone(), dropped.clone());
        thread::spawn(move || slot2.set(Dropped(dropped2)))
            .join()
            .unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        slot.set(Dropped(dropped.clone()));
        slot.set(Dropped(dropped.clone()));
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        drop(slot);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn drain_moves_values_out() {
        const THREADS: usize = 4;
        let dropped = Arc::new(AtomicUsize::new(0));
        let slot = OwnedSlot::new_in(Registry::leaked());
        let written = Barrier::new(THREADS + 1);
        let drained = Barrier::new(THREADS + 1);

        let values = thread::scope(|s| {
            let threads: Vec<_> = (0..THREADS)
                .map(|_| {
                    let (slot, written, drained) = (&slot, &written, &drained);
                    let dropped = dropped.clone();
                    s.spawn(move || {
                        slot.set(Dropped(dropped));
                        written.wait();
                        drained.wait();
                        assert!(!slot.is_set());
                    })
                })
                .collect();

            written.wait();
            let values = slot.drain();
            drained.wait();
            for thread in threads {
                thread.join().unwrap();
            }
            values
        });

        assert_eq!(values.len(), THREADS);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(values);
        assert_eq!(dropped.load(Ordering::SeqCst), THREADS);
    }
}
