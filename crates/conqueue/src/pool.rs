use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_epoch as epoch;
use crossbeam_queue::SegQueue;

/// Node pool with epoch-guarded reclamation.
///
/// `get` hands out a recycled node when one is available, else a fresh heap
/// allocation. `recycle` returns a node to the pool, but the node only becomes
/// reusable once every guard that was active at recycle time has ended, so a
/// thread inside `guard` can keep dereferencing nodes it loaded from shared
/// links even after a competitor recycled them.
///
/// Reclamation rides on `crossbeam_epoch`: `guard` pins the current epoch and
/// `recycle` defers the free-list hand-back past the next two epoch advances.
pub(crate) struct GuardPool<T: Default> {
    free: Arc<FreeList<T>>,
}

/// Addresses of recycled nodes, stored untyped so the deferred hand-back
/// closure stays pointer-free.
struct FreeList<T> {
    nodes: SegQueue<usize>,
    _marker: PhantomData<T>,
}

// Safety: the queue only carries addresses; the nodes they denote are owned
// by the pool and only handed to one `get` caller at a time.
unsafe impl<T: Send> Send for FreeList<T> {}
unsafe impl<T: Send> Sync for FreeList<T> {}

impl<T> Drop for FreeList<T> {
    fn drop(&mut self) {
        // The free list can outlive the pool through deferred recycle
        // closures; whoever drops it last frees the remaining nodes.
        while let Some(addr) = self.nodes.pop() {
            // SAFETY: every address in the free list originates from
            // `Box::into_raw` in `get` and is owned by the list once pushed.
            unsafe { drop(Box::from_raw(addr as *mut T)) };
        }
    }
}

impl<T: Default> GuardPool<T> {
    pub(crate) fn new() -> Self {
        Self {
            free: Arc::new(FreeList {
                nodes: SegQueue::new(),
                _marker: PhantomData,
            }),
        }
    }

    /// A node ready for reinitialization: either recycled or freshly
    /// allocated.
    pub(crate) fn get(&self) -> *mut T {
        match self.free.nodes.pop() {
            Some(addr) => addr as *mut T,
            None => Box::into_raw(Box::new(T::default())),
        }
    }

    /// Return a node to the pool. Must only be called with nodes obtained
    /// from `get` that no new reader can reach.
    pub(crate) fn recycle(&self, node: *mut T) {
        let free = Arc::clone(&self.free);
        let addr = node as usize;

        let guard = epoch::pin();
        // SAFETY: the closure touches only the free list, which is kept alive
        // by the cloned Arc; the node stays untouched until the hand-back
        // runs, which is after every guard concurrent with this call ends.
        unsafe {
            guard.defer_unchecked(move || free.nodes.push(addr));
        }
    }

    /// Run `f` with the calling thread marked active. No node recycled while
    /// this guard is held will be reused by any thread until it ends.
    /// Reentrant.
    pub(crate) fn guard<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = epoch::pin();
        f()
    }

    /// Free every pooled node. Not concurrency safe.
    pub(crate) fn unsafe_reset(&self) {
        while let Some(addr) = self.free.nodes.pop() {
            // SAFETY: as in `FreeList::drop`; the caller guarantees no
            // concurrent `get` or guard.
            unsafe { drop(Box::from_raw(addr as *mut T)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_fresh_nodes() {
        let pool: GuardPool<u64> = GuardPool::new();
        let a = pool.get();
        let b = pool.get();
        assert_ne!(a, b);

        // Hand them back through the epoch machinery
        pool.recycle(a);
        pool.recycle(b);
    }

    #[test]
    fn test_recycled_node_reused_after_guards_end() {
        let pool: GuardPool<u64> = GuardPool::new();
        let node = pool.get();
        pool.recycle(node);

        // Flush deferred hand-backs by cycling the epoch a few times
        let mut seen = false;
        for _ in 0..256 {
            epoch::pin().flush();
            let candidate = pool.get();
            let reused = candidate == node;
            if reused {
                seen = true;
                break;
            }
            pool.recycle(candidate);
        }
        assert!(seen, "recycled node never came back through the pool");
    }

    #[test]
    fn test_guard_passes_through_result() {
        let pool: GuardPool<u64> = GuardPool::new();
        let value = pool.guard(|| 42);
        assert_eq!(value, 42);

        // Reentrant guards are fine
        let nested = pool.guard(|| pool.guard(|| 7));
        assert_eq!(nested, 7);
    }

    #[test]
    fn test_unsafe_reset_drains_free_list() {
        let pool: GuardPool<u64> = GuardPool::new();
        for _ in 0..8 {
            let n = pool.get();
            pool.recycle(n);
        }
        for _ in 0..64 {
            epoch::pin().flush();
        }
        pool.unsafe_reset();
    }
}
