//! Consumer side: the consume cursor and head advancement.
//!
//! A consume walks forward from the head over dead slots, claims the first
//! ready slot by flipping its word to busy, and after the user code ran marks
//! it dead and sweeps consecutive dead slots. Each sweep past an end control
//! block releases the emptied page back to the page manager.
//!
//! The walk is protected hand-over-hand: the page under the cursor is always
//! published as a hazard pointer (so the page manager defers its reuse), and
//! a claimed slot additionally pins its page for the duration of the consume.
//! Staleness is detected, never prevented: every protection is followed by a
//! re-read, and the walk restarts from the current head when a re-read
//! disagrees.

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use crate::hazard::HazardGuard;
use crate::invariants::debug_assert_claim_held;
use crate::layout::{page_of, same_page, ControlBlock, SlotLayout, ALL_FLAGS, BUSY, DEAD, EXTERNAL};
use crate::progress::{Cardinality, Consistency};
use crate::queue::HeterQueue;
use crate::runtime::RuntimeType;

/// An in-flight consume: a slot claimed busy, its page protected and pinned.
pub(crate) struct Consume<'a, R: RuntimeType> {
    queue: &'a HeterQueue<R>,
    /// Control block of the claimed slot.
    pub(crate) control: usize,
    /// The word to store on commit: the slot's ready word plus `DEAD`.
    pub(crate) next_ptr: usize,
    _guard: HazardGuard,
}

impl<R: RuntimeType> Consume<'_, R> {
    /// The slot's descriptor, copied out of the page.
    pub(crate) fn descriptor(&self) -> R {
        // SAFETY: a claimed slot holds a committed descriptor; R is Copy.
        unsafe { ptr::read(SlotLayout::<R>::type_addr(self.control) as *const R) }
    }

    /// Unaligned base of the value storage (the external block's storage for
    /// external slots).
    pub(crate) fn element_base(&self) -> *mut u8 {
        let inpage = SlotLayout::<R>::element_base(self.control);
        if self.next_ptr & EXTERNAL != 0 {
            // SAFETY: external slots hold a committed record at the in-page
            // element position.
            let record =
                unsafe { ptr::read(inpage as *const crate::layout::ExternalBlock) };
            record.ptr
        } else {
            inpage as *mut u8
        }
    }

    /// Whether the value lives in an external block.
    pub(crate) fn is_external(&self) -> bool {
        self.next_ptr & EXTERNAL != 0
    }

    /// Marks the slot dead and sweeps. The value must already be destroyed
    /// (or deliberately abandoned).
    pub(crate) fn commit_nodestroy(self) {
        // SAFETY: the slot is ours while claimed.
        let held = unsafe { ControlBlock::at(self.control).next.load(Ordering::Relaxed) };
        debug_assert_claim_held!(held);
        // SAFETY: as above.
        unsafe {
            ControlBlock::at(self.control)
                .next
                .store(self.next_ptr, Ordering::Release);
        }
        let Consume {
            queue,
            control,
            _guard: guard,
            ..
        } = self;
        queue.manager().unpin_page(control);
        // let go of the hazard before sweeping, or the sweep would defer
        // this very page instead of freeing it
        drop(guard);
        queue.reclaim_dead();
    }

    /// Returns the slot to the ready state, value untouched.
    pub(crate) fn cancel(self) {
        let ready = self.next_ptr & !DEAD;
        // SAFETY: the slot is ours while claimed.
        let held = unsafe { ControlBlock::at(self.control).next.load(Ordering::Relaxed) };
        debug_assert_claim_held!(held);
        // SAFETY: as above.
        unsafe {
            ControlBlock::at(self.control)
                .next
                .store(ready, Ordering::Release);
        }
        self.queue.manager().unpin_page(self.control);
    }
}

impl<R: RuntimeType> HeterQueue<R> {
    /// Tries to claim the oldest consumable slot.
    pub(crate) fn start_consume_inner(&self) -> Option<Consume<'_, R>> {
        let mut guard = self.manager().acquire_hazard();

        'restart: loop {
            let (begin_head, mut control) = match self.begin_walk(&guard, true) {
                Some(position) => position,
                None => return None,
            };

            loop {
                // SAFETY: the cursor's page is protected by `guard`.
                let word = unsafe { ControlBlock::at(control).next.load(Ordering::Acquire) };
                let next = word & !ALL_FLAGS;

                if next == 0 {
                    // virgin slot or unlinked end control: the queue end --
                    // unless the walk went stale and read a reclaimed slot
                    if self.head_word().load(Ordering::SeqCst) == begin_head {
                        return None;
                    }
                    continue 'restart;
                }

                match word & (BUSY | DEAD) {
                    0 => {
                        // ready: claim it
                        if self.claim_slot(control, word) {
                            self.manager().pin_page(control);
                            return Some(Consume {
                                queue: self,
                                control,
                                next_ptr: word | DEAD,
                                _guard: guard,
                            });
                        }
                        continue 'restart;
                    }
                    DEAD => {
                        if !same_page(control, next) {
                            match self.cross_page(&guard, control, word) {
                                Some(next_guard) => guard = next_guard,
                                None => continue 'restart,
                            }
                        }
                        let _ = self.try_advance_head(control, word);
                        control = next;
                    }
                    _ => {
                        // being produced or consumed
                        match self.config().consistency {
                            Consistency::Sequential => return None,
                            Consistency::Relaxed => control = next,
                        }
                    }
                }
            }
        }
    }

    /// Point-in-time emptiness probe: walks without claiming or advancing.
    pub(crate) fn is_empty_inner(&self) -> bool {
        let mut guard = self.manager().acquire_hazard();

        'restart: loop {
            let (begin_head, mut control) = match self.begin_walk(&guard, false) {
                Some(position) => position,
                None => return true,
            };

            loop {
                // SAFETY: protected by `guard`.
                let word = unsafe { ControlBlock::at(control).next.load(Ordering::Acquire) };
                let next = word & !ALL_FLAGS;

                if next == 0 {
                    if self.head_word().load(Ordering::SeqCst) == begin_head {
                        return true;
                    }
                    continue 'restart;
                }
                if word & (BUSY | DEAD) == 0 {
                    return false;
                }
                if !same_page(control, next) {
                    match self.cross_page(&guard, control, word) {
                        Some(next_guard) => guard = next_guard,
                        None => continue 'restart,
                    }
                }
                control = next;
            }
        }
    }

    /// Sweeps consecutive dead slots from the head, releasing emptied pages.
    pub(crate) fn reclaim_dead(&self) {
        let mut guard = self.manager().acquire_hazard();

        let (_, mut control) = match self.begin_walk(&guard, true) {
            Some(position) => position,
            None => return,
        };

        loop {
            // SAFETY: protected by `guard`.
            let word = unsafe { ControlBlock::at(control).next.load(Ordering::Acquire) };
            let next = word & !ALL_FLAGS;

            if next == 0 || word & (BUSY | DEAD) != DEAD {
                return;
            }
            if !same_page(control, next) {
                match self.cross_page(&guard, control, word) {
                    Some(next_guard) => guard = next_guard,
                    // someone else is sweeping; leave it to them
                    None => return,
                }
            }
            if !self.try_advance_head(control, word) {
                return;
            }
            control = next;
        }
    }

    // ---------------------------------------------------------------------
    // WALK MACHINERY
    // ---------------------------------------------------------------------

    /// Loads the head, protects its page, and re-validates. Returns the
    /// observed head (the staleness witness for the walk) and the first
    /// control block to visit, or `None` for a queue that never allocated.
    ///
    /// `swing` lazily moves a sentinel head onto the first page. Only
    /// consumer contexts may pass it: on single-consumer queues the head
    /// store is plain, so a probe from a foreign thread must walk from the
    /// initial page without writing the head.
    fn begin_walk(&self, guard: &HazardGuard, swing: bool) -> Option<(usize, usize)> {
        loop {
            let head = self.head_word().load(Ordering::Acquire);
            if head == SlotLayout::<R>::SENTINEL {
                let base = self.initial_page_word().load(Ordering::Acquire);
                if base == 0 {
                    return None;
                }
                if swing {
                    self.cas_head(SlotLayout::<R>::SENTINEL, base);
                    continue;
                }
                guard.protect(page_of(base));
                // while the head is still the sentinel, nothing was ever
                // reclaimed, so the initial page cannot have been freed
                if self.head_word().load(Ordering::SeqCst) == head {
                    return Some((head, base));
                }
                continue;
            }
            guard.protect(page_of(head));
            if self.head_word().load(Ordering::SeqCst) == head {
                return Some((head, head));
            }
            // the head moved between load and protection; go again
        }
    }

    /// Hand-over-hand crossing of a page boundary: protects the successor
    /// page, then re-validates the link while the old page is still
    /// protected. On success the returned guard replaces the walk's guard.
    fn cross_page(
        &self,
        _current: &HazardGuard,
        control: usize,
        word: usize,
    ) -> Option<HazardGuard> {
        let next_guard = self.manager().acquire_hazard();
        next_guard.protect(page_of(word & !ALL_FLAGS));
        // SAFETY: `control` is still protected by the walk's guard.
        let reread = unsafe { ControlBlock::at(control).next.load(Ordering::SeqCst) };
        if reread == word {
            Some(next_guard)
        } else {
            None
        }
    }

    fn claim_slot(&self, control: usize, word: usize) -> bool {
        match self.config().consumers {
            Cardinality::Single => {
                // exclusive consumer: plain store on the atomic
                // SAFETY: protected slot in a live page.
                unsafe {
                    ControlBlock::at(control)
                        .next
                        .store(word | BUSY, Ordering::Relaxed);
                }
                true
            }
            // SAFETY: as above.
            Cardinality::Multi => unsafe {
                ControlBlock::at(control)
                    .next
                    .compare_exchange(word, word | BUSY, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            },
        }
    }

    fn cas_head(&self, old: usize, new: usize) -> bool {
        match self.config().consumers {
            Cardinality::Single => {
                if self.head_word().load(Ordering::Relaxed) == old {
                    self.head_word().store(new, Ordering::Release);
                    true
                } else {
                    false
                }
            }
            Cardinality::Multi => self
                .head_word()
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok(),
        }
    }

    /// If the head points at the dead slot `control`, advances it past the
    /// slot and reclaims the slot's bytes: external blocks are freed, the
    /// word and value region are zeroed, and when the slot was the page's
    /// end control block the page itself goes back to the manager.
    fn try_advance_head(&self, control: usize, word: usize) -> bool {
        let next = word & !ALL_FLAGS;
        if !same_page(control, next)
            && page_of(self.tail_word().load(Ordering::SeqCst)) == page_of(control)
        {
            // Never cross (and free) a page the tail still sits in: a
            // producer in its overflow path holds a reference to this page's
            // end control block. The sweep retries once the tail has moved.
            return false;
        }
        if !self.cas_head(control, next) {
            return false;
        }

        if word & EXTERNAL != 0 {
            // SAFETY: we won the advance; the record is read exactly once.
            unsafe { self.free_external_block(control, word) };
        }

        if same_page(control, next) {
            // SAFETY: the head moved past [control, next); nothing reads the
            // value bytes anymore, and stale readers of the word see zero and
            // restart from the head.
            unsafe {
                ControlBlock::at(control).next.store(0, Ordering::Release);
                ptr::write_bytes(
                    (control + size_of::<ControlBlock>()) as *mut u8,
                    0,
                    next - control - size_of::<ControlBlock>(),
                );
            }
        } else {
            debug_assert!(SlotLayout::<R>::is_end_control(control));
            // SAFETY: as above; the page is now entirely dead and behind the
            // head, and its slots were zeroed as the head passed them.
            unsafe {
                ControlBlock::at(control).next.store(0, Ordering::Release);
            }
            self.manager().deallocate_page_zeroed(
                NonNull::new(page_of(control) as *mut u8).expect("page base"),
            );
        }
        true
    }
}
