// Copyright 2017 Amanieu d'Antras
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Attaching storage blocks to threads, and retiring them on thread exit.

use crate::block::Block;
use crate::registry::Registry;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

/// The block most recently used by this thread, together with its registry.
#[derive(Clone, Copy)]
struct Cached {
    registry: *const Registry,
    block: *const Block,
}

impl Cached {
    const EMPTY: Cached = Cached {
        registry: ptr::null(),
        block: ptr::null(),
    };
}

// This is split into 2 thread-local variables so that we can look up the
// current block without touching the one that owns a destructor.
//
// This makes the fast path smaller.
cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[thread_local]
        static CACHED: Cell<Cached> = Cell::new(Cached::EMPTY);

        #[inline]
        fn cached() -> Cached {
            CACHED.get()
        }

        #[inline]
        fn set_cached(cached: Cached) {
            CACHED.set(cached);
        }
    } else {
        thread_local! { static CACHED: Cell<Cached> = const { Cell::new(Cached::EMPTY) }; }

        #[inline]
        fn cached() -> Cached {
            CACHED.with(Cell::get)
        }

        #[inline]
        fn set_cached(cached: Cached) {
            CACHED.with(|cell| cell.set(cached));
        }
    }
}

thread_local! {
    static LOCAL_BLOCKS: LocalBlocks = LocalBlocks {
        blocks: RefCell::new(Vec::new()),
    };
}

struct LocalBlock {
    registry: &'static Registry,
    key: usize,
    block: Arc<Block>,
}

/// All blocks owned by the current thread, one per registry it has touched.
/// Dropping this on thread exit retires them.
struct LocalBlocks {
    blocks: RefCell<Vec<LocalBlock>>,
}

impl Drop for LocalBlocks {
    fn drop(&mut self) {
        // Nothing may reach the blocks through the cache once they are gone.
        set_cached(Cached::EMPTY);
        for local in self.blocks.get_mut().drain(..) {
            local.registry.unregister_block(local.key);
        }
    }
}

/// Runs `f` on the calling thread's block in `registry`, creating and
/// registering the block on first use.
///
/// Returns `None` if the thread is already tearing down its thread-local
/// storage, at which point a block could not be retired anymore.
#[inline]
pub(crate) fn with_block<R>(
    registry: &'static Registry,
    f: impl FnOnce(&Block) -> R,
) -> Option<R> {
    let cached = cached();
    let block = if ptr::eq(cached.registry, registry) {
        cached.block
    } else {
        attach(registry)?
    };
    // The block is kept alive by `LOCAL_BLOCKS` until this thread retires it,
    // which clears the cache first.
    Some(f(unsafe { &*block }))
}

#[cold]
fn attach(registry: &'static Registry) -> Option<*const Block> {
    LOCAL_BLOCKS
        .try_with(|local| {
            let mut blocks = local.blocks.borrow_mut();
            let block = match blocks.iter().find(|local| ptr::eq(local.registry, registry)) {
                Some(local) => Arc::as_ptr(&local.block),
                None => {
                    let block = Arc::new(Block::new());
                    let key = registry.register_block(block.clone());
                    let ptr = Arc::as_ptr(&block);
                    blocks.push(LocalBlock {
                        registry,
                        key,
                        block,
                    });
                    ptr
                }
            };
            set_cached(Cached { registry, block });
            block
        })
        .ok()
}

/// Retires the calling thread's block in `registry` ahead of thread exit.
pub(crate) fn detach(registry: &'static Registry) {
    let local = LOCAL_BLOCKS.try_with(|local| {
        let mut blocks = local.blocks.borrow_mut();
        let index = blocks
            .iter()
            .position(|local| ptr::eq(local.registry, registry))?;
        if ptr::eq(cached().registry, registry) {
            set_cached(Cached::EMPTY);
        }
        Some(blocks.swap_remove(index))
    });
    if let Ok(Some(local)) = local {
        registry.unregister_block(local.key);
    }
}
