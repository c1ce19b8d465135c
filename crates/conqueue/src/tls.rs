use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Instance ids are never reused, so an id uniquely determines the stored type
// for the lifetime of the process.
static NEXT_MEMBER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static MEMBER_SLOTS: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Per-(instance, thread) storage.
///
/// Each member instance owns a process-unique id; every thread that touches
/// the member lazily constructs its own value from the initializer captured at
/// member construction. New threads may appear at any time.
///
/// A thread's values are dropped when the thread exits. Dropping the member
/// itself abandons other threads' entries; the values held here are handles
/// whose backing store is owned by the container, so the retention window is
/// bounded by thread lifetime.
pub(crate) struct ThreadLocalMember<T: 'static> {
    id: u64,
    init: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T: 'static> ThreadLocalMember<T> {
    pub(crate) fn new(init: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_MEMBER_ID.fetch_add(1, Ordering::Relaxed),
            init: Arc::new(init),
        }
    }

    /// Access the calling thread's value, constructing it on first access.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = MEMBER_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            Rc::clone(
                slots
                    .entry(self.id)
                    .or_insert_with(|| Rc::new(RefCell::new((self.init)())) as Rc<dyn Any>),
            )
        });

        // The map borrow is released before the value borrow, so `f` may
        // access a different member of the same thread.
        let cell = slot
            .downcast_ref::<RefCell<T>>()
            .expect("member id maps to a single stored type");
        let result = f(&mut cell.borrow_mut());
        result
    }
}
