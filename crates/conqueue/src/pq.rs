use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use crate::invariants::debug_assert_nonzero_version;
use crate::pool::GuardPool;
use crate::skiplist::{expected_list_size, random_height, Iter, Node, DEFAULT_TOWER_HEIGHT};
use crate::versioned::{
    in_range, version_add_one, version_delta, version_step, version_sub_one, AtomicVersioned,
    Versioned,
};

// =============================================================================
// LINK PROTOCOL
// =============================================================================
//
// The list hangs off a head sentinel whose links are both the entry points
// and the end marker: a link pointing back at the head means end-of-list, so
// an empty list is the head linked to itself at every layer.
//
// The head's base link version is a generation counter. Every successful
// front delink and every head-level insertion advances it, and every upper
// head link carries the generation it was last written under. A CAS against a
// version outside the in-range window is stale and must re-prepare.
//
// Deletion is a two-phase handshake on versions:
//
// 1. Flag: CAS the front node's own base link from version 0 to
//    head_version + 1. The winner owns the node; a competitor observing the
//    same target version helps instead of retrying blindly.
// 2. Delink: swing the head links (upper layers first, base last) past the
//    front node. The base step consumes the second version increment, so a
//    flag+delink advances the generation by two.
//
// Insertion at the front has to cooperate with that handshake, which is what
// the four cases in `try_push` are about.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeResult {
    /// The link now holds our desired value.
    Success,
    /// The observed version is outside the in-range window; the view is stale.
    OutsideRange,
    /// Another thread already wrote this exact version; nothing left to do.
    OtherLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagResult {
    /// We claimed the node.
    Success,
    /// Another claimant holds the node at the same version; help delink it.
    Competitor,
    /// Stale view; re-read the front.
    Unexpected,
}

/// A concurrency safe lock-free priority queue based on skip list design.
///
/// `H` is the link tower height, derived from an expected-size hint via
/// [`tower_height`](crate::tower_height); the default suits lists of around
/// 512 items. Pop returns the smallest key first.
///
/// Nodes come from an internal pool; every operation runs inside the pool's
/// epoch guard, so a recycled node is never reused while any concurrent
/// operation may still dereference it.
pub struct PriorityQueue<K, V, const H: usize = DEFAULT_TOWER_HEIGHT> {
    head: Box<Node<K, V, H>>,
    pool: GuardPool<Node<K, V, H>>,
}

// Safety: keys and values move across threads through push/pop; shared
// references to them are only handed out by the non-concurrent API.
unsafe impl<K: Send, V: Send, const H: usize> Send for PriorityQueue<K, V, H> {}
unsafe impl<K: Send + Sync, V: Send + Sync, const H: usize> Sync for PriorityQueue<K, V, H> {}

type Set<K, V, const H: usize> = [Versioned<Node<K, V, H>>; H];

impl<K: Ord, V, const H: usize> PriorityQueue<K, V, H> {
    pub fn new() -> Self {
        // The generation-lag mechanism needs the expected list size to sit
        // well inside half the 19-bit version space
        assert!((1..=8).contains(&H), "link tower height out of range");

        let queue = Self {
            head: Box::new(Node::default()),
            pool: GuardPool::new(),
        };

        let head = queue.head_ptr();
        for link in &queue.head.links {
            link.store(Versioned::new(head), Ordering::Relaxed);
        }

        queue
    }

    #[inline]
    fn head_ptr(&self) -> *mut Node<K, V, H> {
        std::ptr::addr_of!(*self.head).cast_mut()
    }

    #[inline]
    fn at_end(&self, node: *const Node<K, V, H>) -> bool {
        std::ptr::eq(node, self.head_ptr())
    }

    /// True if no items exist in the list.
    pub fn empty(&self) -> bool {
        self.at_end(self.head.links[0].load(Ordering::Relaxed).ptr())
    }

    // ---------------------------------------------------------------------
    // PUSH
    // ---------------------------------------------------------------------

    /// Enqueue a key/value pair.
    pub fn push(&self, key: K, value: V) {
        let node = self.pool.get();

        // SAFETY: the node is ours until linked; a pooled node's slot is
        // uninitialized.
        unsafe {
            (*node).write_kv((key, value));
            (*node).height = random_height(H);
        }

        let backoff = Backoff::new();
        while !self.pool.guard(|| self.try_push(node)) {
            backoff.snooze();
        }
    }

    fn try_push(&self, node: *mut Node<K, V, H>) -> bool {
        let mut at_set: Set<K, V, H> = [Versioned::null(); H];
        let mut next_set: Set<K, V, H> = [Versioned::null(); H];

        at_set[H - 1] = Versioned::new(self.head_ptr());

        // SAFETY: the node is unlinked; we initialized it in push.
        let node_ref = unsafe { &*node };

        if !self.prepare_insertion_sets(&mut at_set, &mut next_set, node_ref) {
            return false;
        }

        // Seed the node's tower from the successors it will point at
        for layer in 0..usize::from(node_ref.height) {
            node_ref.links[layer].store(Versioned::new(next_set[layer].ptr()), Ordering::Relaxed);
        }

        // Inserting at head
        if self.at_head(at_set[0].ptr()) {
            return self.link_to_head(&mut next_set, node_ref);
        }

        // Inserting after an unflagged node at least beyond head
        if !next_set[0].has_version() {
            return Self::link_to_node(&at_set, &mut next_set, node_ref);
        }

        let front = self.head.links[0].load(Ordering::Acquire);

        // Inserting after the front node...
        if at_set[0].same_node(front) {
            // Front node is in the middle of deletion, attempt the special
            // case splice to head
            if next_set[0].version() == version_add_one(front.version()) {
                // Make sure our view of the head base version is younger than
                // that of the front base version
                at_set[0] = front;

                return self.link_to_front(&mut at_set, &mut next_set, node_ref);
            }

            // Front node was supplanted mid-deletion, then promoted to front
            // again. Help unflag it.
            // SAFETY: the front pointer was loaded under the guard.
            Self::unflag_node(unsafe { &*front.ptr() }, &mut next_set[0]);
            return false;
        }

        // Inserting after a flagged node beyond front that was supplanted
        // mid-deletion but is still in the list
        if self.can_be_found_from(front.ptr(), at_set[0].ptr()) {
            return Self::link_to_node(&at_set, &mut next_set, node_ref);
        }

        // Cannot insert after a node that is not in the list
        false
    }

    /// Walk the tower from the head's top layer, collecting the predecessor
    /// (`at_set`) and successor (`next_set`) at every layer. Returns false
    /// when head links above the probe point moved since we read them.
    fn prepare_insertion_sets(
        &self,
        at_set: &mut Set<K, V, H>,
        next_set: &mut Set<K, V, H>,
        node: &Node<K, V, H>,
    ) -> bool {
        let node_height = usize::from(node.height);
        // SAFETY: our own node's slot is initialized.
        let key = unsafe { node.key() };

        let mut began_probing = false;

        for i in 0..H {
            let layer = H - 1 - i;

            loop {
                let at = at_set[layer].ptr();
                // SAFETY: `at` is the head or a node found through live links
                // under the guard.
                next_set[layer] = unsafe { (*at).links[layer].load(Ordering::SeqCst) };
                let next = next_set[layer].ptr();

                if self.at_end(next) {
                    break;
                }

                // SAFETY: a linked non-head node has an initialized slot.
                if key < unsafe { (*next).key() } {
                    break;
                }

                // Before the first forward step, the head links loaded above
                // the probe layer must still be current
                if !began_probing {
                    if !self.verify_head_link_versions(layer + 1, node_height, next_set) {
                        return false;
                    }
                    began_probing = true;
                }

                at_set[layer] = next_set[layer];
            }

            if layer > 0 {
                at_set[layer - 1] = at_set[layer];
            }
        }

        if self.at_head(at_set[0].ptr()) {
            self.load_head_set(next_set, 1, node_height);
        }

        true
    }

    fn verify_head_link_versions(
        &self,
        from_layer: usize,
        to_layer: usize,
        expected: &Set<K, V, H>,
    ) -> bool {
        for layer in from_layer..to_layer {
            if self.head.links[layer].load(Ordering::Relaxed).version() != expected[layer].version()
            {
                return false;
            }
        }
        true
    }

    /// Case 1: link at the head. Bumps the base generation, then lays the
    /// upper links under the new version.
    fn link_to_head(&self, next: &mut Set<K, V, H>, node: &Node<K, V, H>) -> bool {
        let version_base = next[0].version();
        let next_version_base = version_add_one(version_base);
        debug_assert_nonzero_version!(next_version_base);

        if Self::needs_version_lag_check(version_base, 1) {
            self.counteract_version_lag(usize::from(node.height), version_base, next);
        }

        let mut desired = Versioned::new(node as *const _ as *mut _);
        if Self::exchange_node_link(
            &self.head.links[0],
            &mut next[0],
            &mut desired,
            next_version_base,
        ) != ExchangeResult::Success
        {
            return false;
        }

        self.link_to_head_upper(next, node, next_version_base);

        true
    }

    fn link_to_head_upper(&self, expected: &mut Set<K, V, H>, node: &Node<K, V, H>, version: u32) {
        for layer in 1..usize::from(node.height) {
            let mut desired = Versioned::new(node as *const _ as *mut _);
            if Self::exchange_head_link(
                &self.head.links[layer],
                &mut expected[layer],
                &mut desired,
                version,
            ) == ExchangeResult::OutsideRange
            {
                break;
            }
        }
    }

    /// Case 2 (and 4): link after an ordinary node.
    fn link_to_node(
        at_set: &Set<K, V, H>,
        expected: &mut Set<K, V, H>,
        node: &Node<K, V, H>,
    ) -> bool {
        let at = at_set[0].ptr();

        let mut desired = Versioned::new(node as *const _ as *mut _);
        // SAFETY: predecessors in `at_set` were found through live links
        // under the guard.
        if Self::exchange_node_link(
            unsafe { &(*at).links[0] },
            &mut expected[0],
            &mut desired,
            0,
        ) != ExchangeResult::Success
        {
            return false;
        }

        Self::link_to_node_upper(at_set, expected, node);

        true
    }

    fn link_to_node_upper(
        at_set: &Set<K, V, H>,
        expected: &mut Set<K, V, H>,
        node: &Node<K, V, H>,
    ) {
        for layer in 1..usize::from(node.height) {
            let at = at_set[layer].ptr();
            let mut desired = Versioned::new(node as *const _ as *mut _);
            let version = expected[layer].version();
            // SAFETY: as in `link_to_node`.
            let _ = Self::exchange_node_link(
                unsafe { &(*at).links[layer] },
                &mut expected[layer],
                &mut desired,
                version,
            );
        }
    }

    /// Case 3: the predecessor is the front node, flagged mid-deletion at the
    /// next generation. Delink it and splice ourselves in its place in one
    /// base CAS; the generation steps by two (the delink and our insertion).
    fn link_to_front(
        &self,
        front_set: &mut Set<K, V, H>,
        next_set: &mut Set<K, V, H>,
        node: &Node<K, V, H>,
    ) -> bool {
        next_set[0] = Versioned::new(node as *const _ as *mut _);

        let current_front = front_set[0].ptr();
        // SAFETY: the front was loaded under the guard.
        let front_node = unsafe { &*current_front };
        let front_height = usize::from(front_node.height);

        if usize::from(node.height) < front_height {
            self.load_head_set(front_set, 1, front_height);
        }

        Self::load_set(next_set, front_node, 1, front_height);

        if self.delink_front(front_set, next_set, 2, front_height) {
            self.link_to_head_upper(front_set, node, front_set[0].version());
            return true;
        }

        false
    }

    // ---------------------------------------------------------------------
    // POP
    // ---------------------------------------------------------------------

    /// Attempt to dequeue the top item. `None` when the queue is empty.
    pub fn try_pop(&self) -> Option<(K, V)> {
        self.pool.guard(|| self.try_pop_internal())
    }

    fn try_pop_internal(&self) -> Option<(K, V)> {
        let claimed = loop {
            let mut front_set: Set<K, V, H> = [Versioned::null(); H];
            let mut next_set: Set<K, V, H> = [Versioned::null(); H];

            front_set[0] = self.head.links[0].load(Ordering::SeqCst);
            let front = front_set[0].ptr();

            if self.at_end(front) {
                return None;
            }

            // SAFETY: loaded from a live head link under the pool guard; the
            // node cannot be reused while the guard is held.
            let front_node = unsafe { &*front };
            let front_height = usize::from(front_node.height);

            self.load_head_set(&mut front_set, 1, front_height);
            Self::load_set(&mut next_set, front_node, 0, front_height);

            let flagged =
                match Self::flag_node(front_node, front_set[0].version(), &mut next_set[0]) {
                    FlagResult::Unexpected => continue,
                    FlagResult::Success => true,
                    FlagResult::Competitor => false,
                };

            let mut delinked = self.delink_front(&mut front_set, &mut next_set, 1, front_height);

            if flagged && !delinked {
                // Someone may have delinked our claim for us (front-replace
                // insertion, or a helping competitor)
                delinked = self.has_been_delinked_by_other(front_node, front_set[0], next_set[0]);

                if !delinked {
                    Self::unflag_node(front_node, &mut next_set[0]);
                }
            }

            if flagged && delinked {
                break front_node;
            }
        };

        // SAFETY: the flag+delink handshake hands the node to exactly one
        // claimant; nobody else moves the slot out or recycles it.
        let kv = unsafe { claimed.take_kv() };
        self.pool.recycle(std::ptr::from_ref(claimed).cast_mut());

        Some(kv)
    }

    /// Claim the front node by raising its own base link version to
    /// `head_version + 1`.
    fn flag_node(
        node: &Node<K, V, H>,
        head_version: u32,
        next: &mut Versioned<Node<K, V, H>>,
    ) -> FlagResult {
        let expected_version = next.version();
        let next_version = version_add_one(head_version);
        debug_assert_nonzero_version!(next_version);

        if expected_version == next_version {
            return FlagResult::Competitor;
        }
        if !in_range(expected_version, next_version) {
            return FlagResult::Unexpected;
        }

        match node.links[0].compare_exchange(
            *next,
            next.with_version(next_version),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                next.set_version(next_version);
                FlagResult::Success
            }
            Err(current) => {
                *next = current;
                if current.version() == next_version {
                    FlagResult::Competitor
                } else {
                    FlagResult::Unexpected
                }
            }
        }
    }

    /// Release a flag that did not lead to a delink.
    fn unflag_node(node: &Node<K, V, H>, expected: &mut Versioned<Node<K, V, H>>) {
        let desired = expected.with_version(0);
        if let Err(current) =
            node.links[0].compare_exchange(*expected, desired, Ordering::Relaxed, Ordering::Relaxed)
        {
            *expected = current;
        }
    }

    /// Swing the head links past the front node: upper layers first, base
    /// last. The base version steps by `version_offset` (1 for a plain
    /// delink, 2 when an insertion rides along).
    fn delink_front(
        &self,
        expected_front: &mut Set<K, V, H>,
        desired_front: &mut Set<K, V, H>,
        version_offset: u8,
        front_height: usize,
    ) -> bool {
        let version_base = expected_front[0].version();
        let next_version_upper = version_add_one(version_base);

        for i in 0..front_height - 1 {
            let layer = front_height - 1 - i;

            let result = Self::exchange_head_link(
                &self.head.links[layer],
                &mut expected_front[layer],
                &mut desired_front[layer],
                next_version_upper,
            );

            if result == ExchangeResult::OutsideRange {
                return false;
            }
            if result == ExchangeResult::Success {
                expected_front[layer] = desired_front[layer];
            }
        }

        let next_version_base = version_step(version_base, version_offset);
        debug_assert_nonzero_version!(next_version_base);

        if Self::needs_version_lag_check(version_base, u32::from(version_offset)) {
            self.counteract_version_lag(front_height, version_base, expected_front);
        }

        if Self::exchange_node_link(
            &self.head.links[0],
            &mut expected_front[0],
            &mut desired_front[0],
            next_version_base,
        ) == ExchangeResult::Success
        {
            expected_front[0] = desired_front[0];
            return true;
        }

        false
    }

    /// Did some other actor complete the delink of `of` after we flagged it?
    /// True when our replacement is already in place, or the node is no
    /// longer reachable while the flag version is still ours.
    fn has_been_delinked_by_other(
        &self,
        of: &Node<K, V, H>,
        actual: Versioned<Node<K, V, H>>,
        tried_replacement: Versioned<Node<K, V, H>>,
    ) -> bool {
        let tried_version = tried_replacement.version();
        let actual_version = actual.version();
        let matching_version = tried_version == actual_version;

        // All good, some other actor did our replacement for us
        if actual.same_node(tried_replacement) && matching_version {
            return true;
        }

        // Establish a search start whose view is younger than that of `of`
        let from = if !in_range(actual_version, tried_version) {
            actual.ptr()
        } else {
            self.head.links[0].load(Ordering::Relaxed).ptr()
        };

        // If the node cannot be found from there and the flag version is
        // still ours, the delink must have been completed on our behalf
        if !self.can_be_found_from(from, of) {
            let current_version = of.links[0].load(Ordering::Relaxed).version();
            return current_version == tried_version;
        }

        false
    }

    /// Linear base layer scan for `node` starting at `search_start`, bounded
    /// by key order.
    fn can_be_found_from(
        &self,
        search_start: *mut Node<K, V, H>,
        node: *const Node<K, V, H>,
    ) -> bool {
        // SAFETY: `node` is a live node under the guard; its slot is
        // initialized.
        let key = unsafe { (*node).key() };

        let mut at: *const Node<K, V, H> = search_start;

        loop {
            if std::ptr::eq(at, node) {
                return true;
            }
            if self.at_end(at) {
                break;
            }

            // SAFETY: nodes on the scan path are alive under the guard.
            if key < unsafe { (*at).key() } {
                break;
            }

            at = unsafe { (*at).links[0].load(Ordering::Relaxed).ptr() };
        }

        false
    }

    // ---------------------------------------------------------------------
    // LINK EXCHANGE
    // ---------------------------------------------------------------------

    /// CAS a head link, retrying while the observed version stays in range.
    /// Sequentially consistent on success, relaxed on failure.
    fn exchange_head_link(
        link: &AtomicVersioned<Node<K, V, H>>,
        expected: &mut Versioned<Node<K, V, H>>,
        desired: &mut Versioned<Node<K, V, H>>,
        desired_version: u32,
    ) -> ExchangeResult {
        desired.set_version(desired_version);

        loop {
            let expected_version = expected.version();

            if expected_version == desired_version {
                return ExchangeResult::OtherLink;
            }
            if !in_range(expected_version, desired_version) {
                return ExchangeResult::OutsideRange;
            }

            match link.compare_exchange(*expected, *desired, Ordering::SeqCst, Ordering::Relaxed) {
                Ok(_) => return ExchangeResult::Success,
                Err(current) => *expected = current,
            }
        }
    }

    /// Single-shot CAS of a node link.
    fn exchange_node_link(
        link: &AtomicVersioned<Node<K, V, H>>,
        expected: &mut Versioned<Node<K, V, H>>,
        desired: &mut Versioned<Node<K, V, H>>,
        desired_version: u32,
    ) -> ExchangeResult {
        desired.set_version(desired_version);

        match link.compare_exchange(*expected, *desired, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => ExchangeResult::Success,
            Err(current) => {
                *expected = current;
                ExchangeResult::OutsideRange
            }
        }
    }

    // ---------------------------------------------------------------------
    // GENERATION LAG
    // ---------------------------------------------------------------------

    /// The lag pass runs whenever the base version crosses a multiple of the
    /// expected list size.
    fn needs_version_lag_check(version_base: u32, version_step: u32) -> bool {
        let version_part = version_base as usize % expected_list_size(H);

        version_part + version_step as usize >= expected_list_size(H)
    }

    /// Drag upper head links whose version lags the base by more than the
    /// expected list size back into range. This is what keeps the 19-bit
    /// version field sufficient over arbitrarily many deletions.
    fn counteract_version_lag(
        &self,
        above_layer: usize,
        version_base: u32,
        expected: &Set<K, V, H>,
    ) {
        let recent_version = version_sub_one(version_base);

        for layer in above_layer..H {
            let mut link_value = expected[layer];

            if link_value.ptr().is_null() {
                link_value = self.head.links[layer].load(Ordering::Relaxed);
            }

            let mut link_version = link_value.version();

            if in_range(link_version, version_base) {
                let mut delta = version_delta(link_version, version_base);

                while expected_list_size(H) < delta as usize {
                    let desired = link_value.with_version(recent_version);

                    match self.head.links[layer].compare_exchange(
                        link_value,
                        desired,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(current) => {
                            link_value = current;
                            link_version = link_value.version();
                            delta = version_delta(link_version, version_base);
                        }
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // SET LOADS
    // ---------------------------------------------------------------------

    fn load_head_set(&self, out: &mut Set<K, V, H>, offset: usize, max: usize) {
        for layer in offset..max {
            out[layer] = self.head.links[layer].load(Ordering::SeqCst);
        }
    }

    fn load_set(out: &mut Set<K, V, H>, at: &Node<K, V, H>, offset: usize, max: usize) {
        for layer in offset..max {
            out[layer] = at.links[layer].load(Ordering::SeqCst);
        }
    }

    #[inline]
    fn at_head(&self, node: *const Node<K, V, H>) -> bool {
        self.at_end(node)
    }

    // ---------------------------------------------------------------------
    // CLEAR & NON-CONCURRENT API
    // ---------------------------------------------------------------------

    /// Remove every item: one full-height delink of the whole chain, then
    /// recycle the nodes.
    pub fn clear(&self) {
        self.pool.guard(|| self.clear_internal());
    }

    fn clear_internal(&self) {
        let mut front_set: Set<K, V, H> = [Versioned::null(); H];
        let mut next_set: Set<K, V, H> = [Versioned::null(); H];

        let front = loop {
            front_set[0] = self.head.links[0].load(Ordering::SeqCst);
            let front = front_set[0].ptr();

            if self.at_end(front) {
                return;
            }

            self.load_head_set(&mut front_set, 1, H);

            let head = Versioned::new(self.head_ptr());
            for link in &mut next_set {
                *link = head;
            }

            if self.delink_front(&mut front_set, &mut next_set, 1, H) {
                break front;
            }
        };

        // The delinked chain is exclusively ours now
        let mut at: *const Node<K, V, H> = front;
        while !self.at_end(at) {
            // SAFETY: we own the chain; each node's slot is initialized.
            let next = unsafe { (*at).links[0].load(Ordering::Relaxed).ptr() };
            unsafe { drop((*at).take_kv()) };
            self.pool.recycle(at.cast_mut());
            at = next;
        }
    }

    /// Reset to the initial state. Not concurrency safe; the list must
    /// already be empty.
    pub fn unsafe_reset(&self) {
        assert!(
            self.empty(),
            "unsafe_reset while items are still in the list"
        );
        self.pool.unsafe_reset();

        let head = Versioned::new(self.head_ptr());
        for link in &self.head.links {
            link.store(head, Ordering::Relaxed);
        }
    }

    /// Search for a key. Not concurrency safe.
    pub fn unsafe_find(&self, key: &K) -> Option<(&K, &V)> {
        let mut at: *const Node<K, V, H> = self.head_ptr();

        for i in 0..H {
            let layer = H - 1 - i;

            loop {
                // SAFETY: caller guarantees no concurrent mutation.
                let next = unsafe { (*at).links[layer].load(Ordering::Relaxed).ptr() };
                if self.at_end(next) {
                    break;
                }

                // SAFETY: linked non-head nodes have initialized slots.
                let kv = unsafe { (*next).kv_ref() };
                if *key == kv.0 {
                    return Some((&kv.0, &kv.1));
                }
                if kv.0 > *key {
                    break;
                }

                at = next;
            }
        }

        None
    }

    /// Iterate items in key order. Not concurrency safe.
    pub fn unsafe_iter(&self) -> Iter<'_, K, V, H> {
        Iter {
            at: self.head.links[0].load(Ordering::Relaxed).ptr(),
            end: self.head_ptr(),
            head: self.head_ptr(),
            _marker: PhantomData,
        }
    }
}

impl<K: Ord, V, const H: usize> Default for PriorityQueue<K, V, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const H: usize> Drop for PriorityQueue<K, V, H> {
    fn drop(&mut self) {
        // Walk the remaining chain directly; no concurrency at drop time
        let mut at = self.head.links[0].load(Ordering::Relaxed).ptr();
        let head = std::ptr::addr_of!(*self.head).cast_mut();

        while !std::ptr::eq(at, head) {
            // SAFETY: exclusive access; every linked node is initialized and
            // pool-owned.
            unsafe {
                let next = (*at).links[0].load(Ordering::Relaxed).ptr();
                drop((*at).take_kv());
                drop(Box::from_raw(at));
                at = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_sorted() {
        let queue: PriorityQueue<u32, &str> = PriorityQueue::new();
        assert!(queue.empty());

        queue.push(3, "a");
        queue.push(1, "b");
        queue.push(2, "c");
        assert!(!queue.empty());

        assert_eq!(queue.try_pop(), Some((1, "b")));
        assert_eq!(queue.try_pop(), Some((2, "c")));
        assert_eq!(queue.try_pop(), Some((3, "a")));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.empty());
    }

    #[test]
    fn test_duplicate_keys() {
        let queue: PriorityQueue<u32, u32> = PriorityQueue::new();

        for i in 0..4 {
            queue.push(7, i);
        }
        queue.push(3, 100);

        assert_eq!(queue.try_pop().map(|(k, _)| k), Some(3));
        let mut sevens = Vec::new();
        while let Some((k, v)) = queue.try_pop() {
            assert_eq!(k, 7);
            sevens.push(v);
        }
        sevens.sort_unstable();
        assert_eq!(sevens, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_pop_to_exhaustion_is_nondecreasing() {
        let queue: PriorityQueue<u64, u64> = PriorityQueue::new();

        // A scrambled key sequence
        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..300 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            queue.push(seed % 1000, seed);
        }

        let mut previous = 0u64;
        let mut count = 0;
        while let Some((key, _)) = queue.try_pop() {
            assert!(previous <= key);
            previous = key;
            count += 1;
        }
        assert_eq!(count, 300);
        assert!(queue.empty());
    }

    #[test]
    fn test_clear_empties_queue() {
        let queue: PriorityQueue<u32, u32> = PriorityQueue::new();
        for i in 0..50 {
            queue.push(i, i);
        }

        queue.clear();
        assert!(queue.empty());
        assert_eq!(queue.try_pop(), None);

        // The structure remains usable
        queue.push(5, 50);
        assert_eq!(queue.try_pop(), Some((5, 50)));
    }

    #[test]
    fn test_unsafe_reset_after_drain() {
        let queue: PriorityQueue<u32, u32> = PriorityQueue::new();
        queue.push(1, 1);
        assert_eq!(queue.try_pop(), Some((1, 1)));

        queue.unsafe_reset();
        assert!(queue.empty());

        queue.push(2, 2);
        assert_eq!(queue.try_pop(), Some((2, 2)));
    }

    #[test]
    fn test_unsafe_find() {
        let queue: PriorityQueue<u32, &str> = PriorityQueue::new();
        queue.push(10, "ten");
        queue.push(20, "twenty");
        queue.push(30, "thirty");

        assert_eq!(queue.unsafe_find(&20), Some((&20, &"twenty")));
        assert_eq!(queue.unsafe_find(&15), None);
    }

    #[test]
    fn test_iteration_forward_and_reverse() {
        let queue: PriorityQueue<u32, u32> = PriorityQueue::new();
        for key in [4, 1, 3, 2] {
            queue.push(key, key * 10);
        }

        let forward: Vec<u32> = queue.unsafe_iter().map(|(k, _)| *k).collect();
        assert_eq!(forward, vec![1, 2, 3, 4]);

        let reverse: Vec<u32> = queue.unsafe_iter().rev().map(|(k, _)| *k).collect();
        assert_eq!(reverse, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_version_wrap_consistency() {
        // A push/pop round advances the head generation by two, so 300k
        // rounds carry it through the 19-bit wrap (and past the unflagged
        // zero value) at least once
        let queue: PriorityQueue<u32, u32, 1> = PriorityQueue::new();

        for round in 0..300_000 {
            queue.push(round % 3, round);
            let popped = queue.try_pop();
            assert!(popped.is_some());
        }
        assert!(queue.empty());
    }

    // Deterministic single-threaded staging of the front-replace insertion
    // case: a pop has flagged the front but not yet delinked when a push of
    // the same key arrives.
    #[test]
    fn test_front_replace_races_flagged_pop() {
        let queue: PriorityQueue<u32, &str> = PriorityQueue::new();
        queue.push(5, "x");

        // Stage the interrupted pop: flag the front, stop before the delink
        let mut front_set: Set<u32, &str, DEFAULT_TOWER_HEIGHT> =
            [Versioned::null(); DEFAULT_TOWER_HEIGHT];
        let mut next_set: Set<u32, &str, DEFAULT_TOWER_HEIGHT> =
            [Versioned::null(); DEFAULT_TOWER_HEIGHT];

        front_set[0] = queue.head.links[0].load(Ordering::SeqCst);
        let front_node = unsafe { &*front_set[0].ptr() };
        let front_height = usize::from(front_node.height);

        queue.load_head_set(&mut front_set, 1, front_height);
        PriorityQueue::load_set(&mut next_set, front_node, 0, front_height);

        assert_eq!(
            PriorityQueue::flag_node(front_node, front_set[0].version(), &mut next_set[0]),
            FlagResult::Success
        );

        // The push observes the flagged front and takes the front-replace
        // branch, delinking (5, "x") while splicing itself in its place
        queue.push(5, "y");

        // The pop resumes: its own delink fails, but the replacement already
        // did the delink on its behalf, so the flagged node is its claim
        let delinked = queue.delink_front(&mut front_set, &mut next_set, 1, front_height);
        assert!(!delinked);
        assert!(queue.has_been_delinked_by_other(front_node, front_set[0], next_set[0]));

        // SAFETY: the claim is exclusive; mirror of try_pop_internal.
        let kv = unsafe { front_node.take_kv() };
        assert_eq!(kv, (5, "x"));
        queue.pool.recycle(std::ptr::from_ref(front_node).cast_mut());

        // The replacement is the only remaining item
        assert_eq!(queue.try_pop(), Some((5, "y")));
        assert!(queue.empty());
    }

    #[test]
    fn test_drop_releases_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct DropTracker(Arc<AtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue: PriorityQueue<u32, DropTracker> = PriorityQueue::new();
            for i in 0..10 {
                queue.push(i, DropTracker(Arc::clone(&drops)));
            }
            drop(queue.try_pop());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }
}
