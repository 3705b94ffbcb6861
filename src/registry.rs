// Copyright 2017 Amanieu d'Antras
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::block::Block;
use crate::local;
use crate::mutex::{Mutex, MutexGuard};
use crate::{SlotId, UnrefHandler};
use once_cell::sync::Lazy;
use slab::Slab;
use std::fmt;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// A set of per-thread slots.
///
/// The registry hands out slot identifiers, keeps track of the storage block
/// of every thread that has touched it and remembers the unref handler of
/// each identifier. All of that sits behind a single lock. Reading and
/// writing a thread's own entries does not take the lock, except the first
/// time a thread touches an identifier beyond the end of its block.
///
/// Registries are never dropped: a thread that exits after `main` returns
/// still needs the registry to retire its block.
///
/// Unref handlers are only ever called by the registry itself. They cannot be
/// looked up from outside the crate:
///
/// ```compile_fail
/// use thread_slot::{OwnedSlot, Registry};
///
/// let slot = OwnedSlot::<Vec<u8>>::new();
/// let handler = Registry::global().handler(slot.id());
/// ```
pub struct Registry {
    state: Mutex<State>,
}

struct State {
    /// Blocks of all threads currently holding storage in this registry.
    blocks: Slab<Arc<Block>>,
    /// Never issued itself. Allocating from a counter at `u32::MAX` aborts.
    next_id: u32,
    free_ids: Vec<SlotId>,
    handlers: Vec<Option<UnrefHandler>>,
}

impl State {
    fn handler(&self, id: SlotId) -> Option<&UnrefHandler> {
        self.handlers.get(id.index()).and_then(Option::as_ref)
    }
}

impl Registry {
    fn new() -> Registry {
        Registry {
            state: Mutex::new(State {
                blocks: Slab::new(),
                next_id: 0,
                free_ids: Vec::new(),
                handlers: Vec::new(),
            }),
        }
    }

    /// Returns the process-wide registry, creating it on first use.
    #[inline]
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Creates a registry that is independent from the global one.
    ///
    /// The registry is leaked, as threads may still need it for cleanup at any
    /// point until the process exits. Every thread touching it gets a separate
    /// block, so this is meant for a handful of long-lived registries.
    pub fn leaked() -> &'static Registry {
        Box::leak(Box::new(Registry::new()))
    }

    /// Returns the identifier the next allocation will hand out.
    pub fn peek_id(&self) -> SlotId {
        let state = self.state.lock();
        match state.free_ids.last() {
            Some(&id) => id,
            None => SlotId(state.next_id),
        }
    }

    /// Returns the identifiers that have been reclaimed and not reused yet.
    pub fn peek_ids(&self) -> Vec<SlotId> {
        self.state.lock().free_ids.clone()
    }

    /// Returns the number of threads currently holding storage in this
    /// registry.
    pub fn live_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Releases the calling thread's storage right away, as if the thread had
    /// exited: the unref handler runs for every value it still holds.
    ///
    /// This is useful for threads whose thread-local destructors never run,
    /// such as the main thread. Touching a slot from this thread afterwards
    /// starts over with empty storage.
    pub fn detach_current_thread(&'static self) {
        local::detach(self);
    }

    pub(crate) fn allocate_id(&self) -> SlotId {
        let mut state = self.state.lock();
        let id = match state.free_ids.pop() {
            Some(id) => id,
            None => {
                let next = match state.next_id.checked_add(1) {
                    Some(next) => next,
                    None => ids_exhausted(),
                };
                let id = SlotId(state.next_id);
                state.next_id = next;
                id
            }
        };
        tracing::trace!(id = id.0, "allocated slot identifier");
        id
    }

    /// Clears `id` in every thread, running the unref handler on whatever was
    /// left there, and makes the identifier available again.
    ///
    /// If a handler panics, the values not swept yet are cleared without being
    /// unreffed and the identifier is still reclaimed before the panic
    /// propagates.
    pub(crate) fn free_id(&self, id: SlotId) {
        let mut reclaim = Reclaim {
            state: self.state.lock(),
            id,
            swept: false,
        };
        let mut unreffed = 0usize;
        {
            let state = &*reclaim.state;
            let handler = state.handler(id);
            for (_, block) in state.blocks.iter() {
                let value = block.exchange(id.index(), ptr::null_mut());
                if value.is_null() {
                    continue;
                }
                unreffed += 1;
                if let Some(handler) = handler {
                    handler(value);
                }
            }
        }
        reclaim.swept = true;
        drop(reclaim);
        tracing::debug!(id = id.0, unreffed, "reclaimed slot identifier");
    }

    pub(crate) fn set_handler(&self, id: SlotId, handler: Option<UnrefHandler>) {
        let mut state = self.state.lock();
        let index = id.index();
        if state.handlers.len() <= index {
            state.handlers.resize_with(index + 1, || None);
        }
        state.handlers[index] = handler;
    }

    /// Returns the unref handler currently registered for `id`.
    #[cfg(test)]
    pub(crate) fn handler(&self, id: SlotId) -> Option<UnrefHandler> {
        self.state.lock().handler(id).cloned()
    }

    /// Adds a thread's block to the registry and returns the key to retire it
    /// with.
    pub(crate) fn register_block(&self, block: Arc<Block>) -> usize {
        let mut state = self.state.lock();
        let key = state.blocks.insert(block);
        tracing::trace!(key, live = state.blocks.len(), "registered thread block");
        key
    }

    /// Removes a thread's block from the registry and runs the unref handler
    /// on every value it still holds.
    ///
    /// Values that a concurrent `free_id` or `scrape` already took are not
    /// seen here, as every path takes values out with a single exchange.
    pub(crate) fn unregister_block(&self, key: usize) {
        let mut state = self.state.lock();
        let block = match state.blocks.try_remove(key) {
            Some(block) => block,
            None => return,
        };
        let mut unreffed = 0usize;
        for (index, value) in block.take_all() {
            unreffed += 1;
            if let Some(handler) = state.handler(SlotId::from_index(index)) {
                handler(value);
            }
        }
        tracing::trace!(key, unreffed, "retired thread block");
    }

    /// Replaces the value of `id` in every thread with `replacement` and
    /// returns the non-null values that were there.
    pub(crate) fn scrape(&self, id: SlotId, replacement: *mut ()) -> Vec<*mut ()> {
        let state = self.state.lock();
        let values: Vec<_> = state
            .blocks
            .iter()
            .map(|(_, block)| block.exchange(id.index(), replacement))
            .filter(|value| !value.is_null())
            .collect();
        tracing::trace!(id = id.0, scraped = values.len(), "scraped slot");
        values
    }

    #[inline]
    pub(crate) fn get(&'static self, id: SlotId) -> *mut () {
        local::with_block(self, |block| match block.entry(id.index()) {
            Some(entry) => entry.load(Ordering::Acquire),
            None => ptr::null_mut(),
        })
        .unwrap_or(ptr::null_mut())
    }

    #[inline]
    pub(crate) fn reset(&'static self, id: SlotId, value: *mut ()) {
        self.with_entry(id, |entry| entry.store(value, Ordering::Release))
    }

    #[inline]
    pub(crate) fn swap(&'static self, id: SlotId, value: *mut ()) -> *mut () {
        self.with_entry(id, |entry| entry.swap(value, Ordering::AcqRel))
    }

    #[inline]
    pub(crate) fn compare_and_swap(
        &'static self,
        id: SlotId,
        expected: *mut (),
        new: *mut (),
    ) -> Result<*mut (), *mut ()> {
        self.with_entry(id, |entry| {
            entry.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        })
    }

    /// Runs `f` on the calling thread's entry for `id`, growing the thread's
    /// block first if it doesn't cover `id` yet.
    fn with_entry<R>(&'static self, id: SlotId, f: impl FnOnce(&AtomicPtr<()>) -> R) -> R {
        let result = local::with_block(self, |block| match block.entry(id.index()) {
            Some(entry) => f(entry),
            None => f(self.grow(block, id)),
        });
        match result {
            Some(result) => result,
            None => storage_unavailable(),
        }
    }

    #[cold]
    fn grow<'a>(&self, block: &'a Block, id: SlotId) -> &'a AtomicPtr<()> {
        let _state = self.state.lock();
        // We are the owning thread, hold the lock and have no other
        // references into the block.
        unsafe { block.grow_to(id.index()) }
    }
}

/// Finishes reclaiming an identifier once its values have been swept, even
/// when a handler unwinds out of the sweep.
struct Reclaim<'a> {
    state: MutexGuard<'a, State>,
    id: SlotId,
    swept: bool,
}

impl Drop for Reclaim<'_> {
    fn drop(&mut self) {
        let index = self.id.index();
        if !self.swept {
            // Whatever is left must not show up under the reused identifier.
            let leaked = self
                .state
                .blocks
                .iter()
                .filter(|(_, block)| !block.exchange(index, ptr::null_mut()).is_null())
                .count();
            tracing::error!(id = self.id.0, leaked, "unref handler panicked, values leaked");
        }
        if let Some(handler) = self.state.handlers.get_mut(index) {
            *handler = None;
        }
        let id = self.id;
        self.state.free_ids.push(id);
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("live_blocks", &state.blocks.len())
            .field("next_id", &state.next_id)
            .field("free_ids", &state.free_ids)
            .finish()
    }
}

/// The calling thread is past the point where it can attach storage, so its
/// values could never be cleaned up.
#[cold]
fn storage_unavailable() -> ! {
    tracing::error!("thread-local slot storage is unavailable on this thread, aborting");
    process::abort()
}

/// Every identifier up to `u32::MAX` has been handed out and none was freed.
#[cold]
fn ids_exhausted() -> ! {
    tracing::error!("slot identifiers are exhausted, aborting");
    process::abort()
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::{SlotId, UnrefHandler};
    use std::panic::{self, AssertUnwindSafe};
    use std::ptr;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    fn token(n: usize) -> *mut () {
        n as *mut ()
    }

    fn recording_handler() -> (UnrefHandler, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler: UnrefHandler = Arc::new(move |value: *mut ()| {
            seen2.lock().unwrap().push(value as usize);
        });
        (handler, seen)
    }

    #[test]
    fn ids_are_issued_in_order() {
        let registry = Registry::leaked();
        assert_eq!(registry.peek_id(), SlotId(0));
        assert_eq!(registry.allocate_id(), SlotId(0));
        assert_eq!(registry.allocate_id(), SlotId(1));
        assert_eq!(registry.peek_id(), SlotId(2));
        assert!(registry.peek_ids().is_empty());
    }

    #[test]
    fn freed_ids_are_reused_last_in_first_out() {
        let registry = Registry::leaked();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let c = registry.allocate_id();
        registry.free_id(a);
        registry.free_id(c);
        assert_eq!(registry.peek_ids(), vec![a, c]);
        assert_eq!(registry.peek_id(), c);
        assert_eq!(registry.allocate_id(), c);
        assert_eq!(registry.allocate_id(), a);
        assert_eq!(registry.allocate_id(), SlotId(b.0 + 2));
    }

    #[test]
    fn counter_stops_short_of_wrapping() {
        let registry = Registry::leaked();
        registry.state.lock().next_id = u32::MAX - 2;

        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_eq!(a, SlotId(u32::MAX - 2));
        assert_eq!(b, SlotId(u32::MAX - 1));
        assert_eq!(registry.state.lock().next_id, u32::MAX);

        // With the counter used up, freed identifiers are still handed out
        // instead of wrapping around to ones that are live.
        registry.free_id(a);
        assert_eq!(registry.allocate_id(), a);
        registry.free_id(b);
        registry.free_id(a);
        assert_eq!(registry.allocate_id(), a);
        assert_eq!(registry.allocate_id(), b);
        assert_eq!(registry.state.lock().next_id, u32::MAX);
    }

    #[test]
    fn handler_panic_still_reclaims_the_id() {
        let registry = Registry::leaked();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler: UnrefHandler = Arc::new(move |value: *mut ()| {
            seen2.lock().unwrap().push(value as usize);
            panic!("unref handler failed");
        });
        let id = registry.allocate_id();
        registry.set_handler(id, Some(handler));
        let written = Barrier::new(2);
        let freed = Barrier::new(2);

        thread::scope(|s| {
            let thread = s.spawn(|| {
                registry.reset(id, token(2));
                written.wait();
                freed.wait();
                assert!(registry.get(id).is_null());
            });

            registry.reset(id, token(1));
            written.wait();
            let result = panic::catch_unwind(AssertUnwindSafe(|| registry.free_id(id)));
            assert!(result.is_err());
            freed.wait();
            thread.join().unwrap();
        });

        // Only the first value reached the handler. The other one was cleared
        // and the exiting thread had nothing left to unref.
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(registry.get(id).is_null());
        assert!(registry.handler(id).is_none());
        assert_eq!(registry.peek_ids(), vec![id]);
        assert!(!registry.state.is_locked());
        assert_eq!(registry.allocate_id(), id);
    }

    #[test]
    fn handler_last_writer_wins() {
        let registry = Registry::leaked();
        let id = registry.allocate_id();
        assert!(registry.handler(id).is_none());

        let (first, first_seen) = recording_handler();
        let (second, second_seen) = recording_handler();
        registry.set_handler(id, Some(first));
        registry.reset(id, token(4));
        registry.set_handler(id, Some(second));

        // The value was written while `first` was registered, but whatever is
        // registered when the value is cleared is what runs.
        registry.free_id(id);
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec![4]);
        assert!(registry.handler(id).is_none());
    }

    #[test]
    fn get_does_not_grow() {
        let registry = Registry::leaked();
        let id = SlotId(10);
        assert!(registry.get(id).is_null());
        assert_eq!(registry.live_blocks(), 1);
        assert_eq!(local_len(registry), 0);

        registry.reset(id, token(1));
        assert_eq!(local_len(registry), 11);
        assert_eq!(registry.get(id), token(1));
        assert!(registry.get(SlotId(3)).is_null());
    }

    fn local_len(registry: &'static Registry) -> usize {
        crate::local::with_block(registry, |block| block.len()).unwrap()
    }

    #[test]
    fn swap_and_compare_and_swap() {
        let registry = Registry::leaked();
        let id = registry.allocate_id();

        assert!(registry.swap(id, token(1)).is_null());
        assert_eq!(registry.swap(id, token(2)), token(1));

        assert_eq!(registry.compare_and_swap(id, token(1), token(3)), Err(token(2)));
        assert_eq!(registry.get(id), token(2));
        assert_eq!(registry.compare_and_swap(id, token(2), token(3)), Ok(token(2)));
        assert_eq!(registry.get(id), token(3));
    }

    #[test]
    fn scrape_takes_from_every_thread() {
        const THREADS: usize = 4;
        let registry = Registry::leaked();
        let id = registry.allocate_id();
        let written = Barrier::new(THREADS + 1);
        let scraped = Barrier::new(THREADS + 1);

        thread::scope(|s| {
            let threads: Vec<_> = (1..=THREADS)
                .map(|n| {
                    let (written, scraped) = (&written, &scraped);
                    s.spawn(move || {
                        registry.reset(id, token(n * 8));
                        written.wait();
                        scraped.wait();
                        assert_eq!(registry.get(id), token(1));
                    })
                })
                .collect();

            written.wait();
            let mut values: Vec<_> = registry
                .scrape(id, token(1))
                .into_iter()
                .map(|value| value as usize)
                .collect();
            values.sort_unstable();
            assert_eq!(values, vec![8, 16, 24, 32]);
            scraped.wait();

            for thread in threads {
                thread.join().unwrap();
            }
        });
    }

    #[test]
    fn free_id_unrefs_values_of_live_threads() {
        const THREADS: usize = 3;
        let registry = Registry::leaked();
        let (handler, seen) = recording_handler();
        let id = registry.allocate_id();
        registry.set_handler(id, Some(handler));
        let written = Barrier::new(THREADS + 1);
        let freed = Barrier::new(THREADS + 1);

        thread::scope(|s| {
            let threads: Vec<_> = (1..=THREADS)
                .map(|n| {
                    let (written, freed) = (&written, &freed);
                    s.spawn(move || {
                        registry.reset(id, token(n));
                        written.wait();
                        freed.wait();
                        assert!(registry.get(id).is_null());
                    })
                })
                .collect();

            written.wait();
            registry.free_id(id);
            let mut values = seen.lock().unwrap().clone();
            values.sort_unstable();
            assert_eq!(values, vec![1, 2, 3]);
            freed.wait();

            for thread in threads {
                thread.join().unwrap();
            }
        });

        // Nothing was left for the exiting threads to unref.
        assert_eq!(seen.lock().unwrap().len(), THREADS);
        assert_eq!(registry.live_blocks(), 0);
    }

    #[test]
    fn thread_exit_unrefs_once() {
        let registry = Registry::leaked();
        let (handler, seen) = recording_handler();
        let id = registry.allocate_id();
        registry.set_handler(id, Some(handler));

        thread::spawn(move || {
            registry.reset(id, token(7));
            assert_eq!(registry.live_blocks(), 1);
        })
        .join()
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert_eq!(registry.live_blocks(), 0);

        registry.free_id(id);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn scrape_skips_threads_that_never_wrote() {
        let registry = Registry::leaked();
        let id = registry.allocate_id();
        registry.get(id);
        assert_eq!(registry.live_blocks(), 1);
        assert!(registry.scrape(id, ptr::null_mut()).is_empty());
        // A short block is not grown by a scrape either.
        assert!(registry.scrape(id, token(5)).is_empty());
        assert!(registry.get(id).is_null());
    }

    #[test]
    fn detach_retires_the_current_block() {
        let registry = Registry::leaked();
        let (handler, seen) = recording_handler();
        let id = registry.allocate_id();
        registry.set_handler(id, Some(handler));

        thread::spawn(move || {
            registry.reset(id, token(9));
            registry.detach_current_thread();
            assert_eq!(registry.live_blocks(), 0);
            assert_eq!(*seen.lock().unwrap(), vec![9]);

            // The thread starts over with fresh storage.
            assert!(registry.get(id).is_null());
            assert_eq!(registry.live_blocks(), 1);
        })
        .join()
        .unwrap();

        assert_eq!(registry.live_blocks(), 0);
    }
}
