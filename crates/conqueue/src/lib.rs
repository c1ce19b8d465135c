//! conqueue - Lock-Free Concurrent Containers
//!
//! Two independent containers sharing one substrate of versioned atomic
//! links, epoch-guarded node pooling, and per-thread affinity:
//!
//! - [`FifoQueue`]: an unbounded MPMC queue built from per-producer ring
//!   buffers. Each producing thread owns a chain of single-producer rings
//!   (growing geometrically when full), so producers never contend with each
//!   other; consumers hold an affinity buffer and relocate across producers
//!   as buffers drain. FIFO order holds per producer, not globally.
//! - [`PriorityQueue`]: a skip-list priority queue. Deletion is a
//!   flag-then-delink handshake on versioned links; the head's base-link
//!   version is a generation counter that defeats ABA across repeated
//!   flag/unflag cycles.
//!
//! All operations are lock-free: an operation may retry its own CAS loop but
//! never waits on another thread. `try_pop` returning `None` and `size()`
//! being an estimate are contracts, not bugs.
//!
//! # Example
//!
//! ```
//! use conqueue::{FifoQueue, PriorityQueue};
//!
//! let queue = FifoQueue::new();
//! queue.push(10u64);
//! queue.push(20);
//! assert_eq!(queue.try_pop(), Some(10));
//!
//! let pq: PriorityQueue<u32, &str> = PriorityQueue::new();
//! pq.push(2, "second");
//! pq.push(1, "first");
//! assert_eq!(pq.try_pop(), Some((1, "first")));
//! ```

mod fifo;
mod invariants;
mod metrics;
mod pool;
mod pq;
mod ring;
mod skiplist;
mod tls;
mod versioned;

pub use fifo::FifoQueue;
pub use metrics::MetricsSnapshot;
pub use pq::PriorityQueue;
pub use skiplist::{tower_height, Iter, DEFAULT_TOWER_HEIGHT};
