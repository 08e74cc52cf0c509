//! Hazard pointers: per-thread published page pointers that forbid the page
//! manager from reusing a page.
//!
//! Each thread owns a block of four inline atomic slots, spilling into
//! dynamically allocated blocks chained behind it; the depth is unbounded in
//! principle. Blocks register into the registry on a thread's first use and
//! unregister on thread exit. Registration and the `is_hazard` scan take the
//! registry mutex; publishing and clearing a slot are plain atomic stores by
//! the owning thread.
//!
//! Usage discipline: acquire a slot, publish the page pointer, re-check that
//! the pointer is still reachable from the queue, and only then dereference.

use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Slots per block before spilling.
const INLINE_SLOTS: usize = 4;

/// One thread's hazard slots: the inline array plus an owner-allocated spill
/// chain. Value 0 means the slot is free or protecting nothing.
pub(crate) struct SlotBlock {
    slots: [AtomicUsize; INLINE_SLOTS],
    spill: AtomicPtr<SlotBlock>,
}

impl SlotBlock {
    fn new() -> Self {
        Self {
            slots: Default::default(),
            spill: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The slot at `index`, materializing spill blocks as needed. Only the
    /// owning thread calls this with an index past the existing chain.
    fn slot(&self, index: usize) -> &AtomicUsize {
        if index < INLINE_SLOTS {
            return &self.slots[index];
        }
        let mut spill = self.spill.load(Ordering::Acquire);
        if spill.is_null() {
            let fresh = Box::into_raw(Box::new(SlotBlock::new()));
            match self.spill.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => spill = fresh,
                Err(existing) => {
                    // SAFETY: `fresh` never escaped.
                    unsafe { drop(Box::from_raw(fresh)) };
                    spill = existing;
                }
            }
        }
        // SAFETY: spill blocks live until the owning SlotBlock drops.
        unsafe { (*spill).slot(index - INLINE_SLOTS) }
    }

    /// Whether any slot in this block or its spill chain holds `addr`.
    fn contains(&self, addr: usize) -> bool {
        for slot in &self.slots {
            if slot.load(Ordering::SeqCst) == addr {
                return true;
            }
        }
        let spill = self.spill.load(Ordering::Acquire);
        if spill.is_null() {
            false
        } else {
            // SAFETY: see `slot`.
            unsafe { (*spill).contains(addr) }
        }
    }
}

impl Drop for SlotBlock {
    fn drop(&mut self) {
        let spill = self.spill.load(Ordering::Relaxed);
        if !spill.is_null() {
            // SAFETY: the spill chain is owned by this block.
            unsafe { drop(Box::from_raw(spill)) };
        }
    }
}

/// Registry of every live thread's slot blocks.
pub(crate) struct HazardRegistry {
    threads: Mutex<Vec<Arc<SlotBlock>>>,
}

impl HazardRegistry {
    pub(crate) fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Whether any thread currently publishes `addr`.
    ///
    /// Linear in live threads times slot depth, which stays small.
    pub(crate) fn is_hazard(&self, addr: usize) -> bool {
        let threads = self.threads.lock().expect("hazard registry poisoned");
        threads.iter().any(|block| block.contains(addr))
    }

    /// Acquires a free slot of the calling thread, registering the thread on
    /// first use. The slot protects nothing until [`HazardGuard::protect`].
    pub(crate) fn acquire(&'static self) -> HazardGuard {
        THREAD_HAZARDS.with(|cell| {
            let mut registrations = cell.borrow_mut();
            let registration = match registrations
                .iter()
                .find(|r| ptr::eq::<HazardRegistry>(r.registry, self))
            {
                Some(r) => Rc::clone(r),
                None => {
                    let block = Arc::new(SlotBlock::new());
                    self.threads
                        .lock()
                        .expect("hazard registry poisoned")
                        .push(Arc::clone(&block));
                    let r = Rc::new(ThreadRegistration {
                        registry: self,
                        block,
                        in_use: RefCell::new(Vec::new()),
                    });
                    registrations.push(Rc::clone(&r));
                    r
                }
            };

            let index = registration.claim_index();
            HazardGuard {
                registration,
                index,
                _not_send: std::marker::PhantomData,
            }
        })
    }
}

struct ThreadRegistration {
    registry: &'static HazardRegistry,
    block: Arc<SlotBlock>,
    /// Owner-side occupancy; slot value 0 alone cannot distinguish "free"
    /// from "acquired, protecting nothing yet".
    in_use: RefCell<Vec<bool>>,
}

impl ThreadRegistration {
    fn claim_index(&self) -> usize {
        let mut in_use = self.in_use.borrow_mut();
        if let Some(index) = in_use.iter().position(|used| !used) {
            in_use[index] = true;
            index
        } else {
            in_use.push(true);
            in_use.len() - 1
        }
    }

    fn release_index(&self, index: usize) {
        self.block.slot(index).store(0, Ordering::SeqCst);
        self.in_use.borrow_mut()[index] = false;
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        debug_assert!(
            self.in_use.borrow().iter().all(|used| !used),
            "thread exited with live hazard guards"
        );
        let mut threads = self
            .registry
            .threads
            .lock()
            .expect("hazard registry poisoned");
        threads.retain(|block| !Arc::ptr_eq(block, &self.block));
    }
}

thread_local! {
    static THREAD_HAZARDS: RefCell<Vec<Rc<ThreadRegistration>>> = RefCell::new(Vec::new());
}

/// RAII hold on one hazard slot. Dropping the guard clears the slot.
///
/// Not `Send`: the slot belongs to the acquiring thread.
pub(crate) struct HazardGuard {
    registration: Rc<ThreadRegistration>,
    index: usize,
    _not_send: std::marker::PhantomData<*mut ()>,
}

impl HazardGuard {
    /// Publishes `addr`, replacing whatever the slot held. Sequentially
    /// consistent so the store is globally visible before the caller's
    /// re-validation load.
    #[inline]
    pub(crate) fn protect(&self, addr: usize) {
        self.registration
            .block
            .slot(self.index)
            .store(addr, Ordering::SeqCst);
    }

    /// Clears the slot without releasing it.
    #[inline]
    pub(crate) fn clear(&self) {
        self.protect(0);
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.registration.release_index(self.index);
    }
}
