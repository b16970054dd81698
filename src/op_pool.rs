// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Stable-index pool of in-flight `Operation` slots.
//!
//! The event loop needs a `user_data` cookie to hand to the kernel that survives the round trip
//! through io_uring; an index into a dense `Vec` plus a free-stack gives that without per-op
//! heap allocation. Entries are acquired empty and returned empty -- callers are responsible for
//! resetting operation-specific state before release.

use crate::server::ring::Operation;

pub struct OpPool {
    entries: Vec<Operation>,
    free: Vec<u32>,
}

impl OpPool {
    pub fn new(initial: usize) -> Self {
        let mut entries = Vec::with_capacity(initial);
        let mut free = Vec::with_capacity(initial);
        for i in 0..initial {
            entries.push(Operation::default());
            free.push(i as u32);
        }
        free.reverse();
        OpPool { entries, free }
    }

    /// Acquire a free slot, growing (doubling) the pool if none remain.
    pub fn acquire(&mut self) -> u32 {
        if self.free.is_empty() {
            let start = self.entries.len();
            let grow_by = start.max(1);
            self.entries.resize_with(start + grow_by, Operation::default);
            self.free.extend((start..start + grow_by).rev().map(|i| i as u32));
        }
        self.free.pop().expect("just grew the pool")
    }

    pub fn get(&self, idx: u32) -> &Operation {
        &self.entries[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut Operation {
        &mut self.entries[idx as usize]
    }

    /// Return a slot to the free list. The caller must have already cleared any buffer handle or
    /// fd the operation held -- mirrors the original pool's `assert(op->buf == NULL)` /
    /// `assert(op->client_fd == -1)` precondition.
    pub fn release(&mut self, idx: u32) {
        debug_assert!(
            self.entries[idx as usize].is_clear(),
            "operation {idx} released with buf or fd still set"
        );
        self.free.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ring::Operation;

    #[test]
    fn acquire_reuses_released_slot() {
        let mut pool = OpPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a, b);
        pool.release(a);
        let c = pool.acquire();
        assert_eq!(a, c);
    }

    #[test]
    fn grows_when_exhausted() {
        let mut pool = OpPool::new(1);
        let _a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.entries.len(), 2);
        pool.release(b);
    }

    #[test]
    fn get_mut_is_distinct_per_index() {
        let mut pool = OpPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        *pool.get_mut(a) = Operation::default();
        *pool.get_mut(b) = Operation::default();
        assert_ne!(a, b);
    }
}
