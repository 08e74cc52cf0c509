//! The page manager: caches freed pages for reuse and defers recycling of
//! pages that some thread may still dereference.
//!
//! Two free stacks are kept, one for raw pages and one for pages whose usable
//! region is known to be zero. Deallocating a page that is currently a hazard
//! for some thread parks it on a per-thread pending list; pending pages are
//! drained opportunistically at later allocation points, and the drain
//! re-zeroes deferred zeroed pages (a stale claimant may have dirtied a
//! control word), amortizing the memset.

use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use log::trace;

use crate::backoff::Backoff;
use crate::hazard::{HazardGuard, HazardRegistry};
use crate::page::{FreeStack, PageFooter, FOOTER_OFFSET, PAGE_ALIGN, PAGE_BYTES};
use crate::page_source::PageSource;
use crate::progress::ProgressGuarantee;

/// Process-lifetime source of fixed-size aligned pages.
///
/// Construction is thread-safe; instances are handed around as `&'static`
/// because pages (and the regions backing them) live until process exit.
/// Most users share [`PageManager::global`]; tests and embedders that want
/// isolated accounting use [`PageManager::leak_new`].
pub struct PageManager {
    source: PageSource,
    free: FreeStack,
    free_zeroed: FreeStack,
    hazards: HazardRegistry,
    /// Pages currently sitting on either free stack.
    free_count: AtomicUsize,
    /// Deferred pages inherited from exited threads, drained like the
    /// per-thread pending lists.
    orphaned: Mutex<Vec<(usize, bool)>>,
    orphan_count: AtomicUsize,
}

struct PendingPage {
    manager: &'static PageManager,
    page: usize,
    zeroed: bool,
}

/// A thread's deferred pages. On thread exit the entries are adopted by
/// their managers so the pages are not lost.
struct PendingList {
    entries: Vec<PendingPage>,
}

impl Drop for PendingList {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            entry
                .manager
                .orphaned
                .lock()
                .expect("orphan list poisoned")
                .push((entry.page, entry.zeroed));
            entry.manager.orphan_count.fetch_add(1, Ordering::Release);
        }
    }
}

thread_local! {
    static PENDING: RefCell<PendingList> = RefCell::new(PendingList { entries: Vec::new() });
}

impl PageManager {
    /// Size of every page, in bytes. The usable region is slightly smaller:
    /// the page footer occupies the last bytes.
    pub const PAGE_BYTES: usize = PAGE_BYTES;

    /// Alignment of every page.
    pub const PAGE_ALIGN: usize = PAGE_ALIGN;

    fn new_internal() -> Self {
        Self {
            source: PageSource::new(),
            free: FreeStack::new(),
            free_zeroed: FreeStack::new(),
            hazards: HazardRegistry::new(),
            free_count: AtomicUsize::new(0),
            orphaned: Mutex::new(Vec::new()),
            orphan_count: AtomicUsize::new(0),
        }
    }

    /// The process-wide manager.
    pub fn global() -> &'static PageManager {
        static GLOBAL: OnceLock<PageManager> = OnceLock::new();
        GLOBAL.get_or_init(PageManager::new_internal)
    }

    /// A fresh manager with its own region list, free stacks, and hazard
    /// registry, leaked to process lifetime.
    pub fn leak_new() -> &'static PageManager {
        Box::leak(Box::new(PageManager::new_internal()))
    }

    // ---------------------------------------------------------------------
    // STATISTICS
    // ---------------------------------------------------------------------

    /// Pages ever obtained from the system source.
    pub fn pages_allocated(&self) -> usize {
        self.source.pages_served()
    }

    /// Pages currently cached on the free stacks.
    pub fn pages_free(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // ALLOCATION
    // ---------------------------------------------------------------------

    /// Allocates one page with undefined content. Returns `None` when the
    /// selected progress guarantee could not obtain one.
    pub fn allocate_page(&'static self, progress: ProgressGuarantee) -> Option<NonNull<u8>> {
        self.drain_pending(progress);

        for stack in [&self.free, &self.free_zeroed] {
            let footer = stack.try_pop_unpinned();
            if !footer.is_null() {
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: pages on the free stacks are live.
                let page = unsafe { (*footer).page_base() };
                return Some(self.hand_out(page));
            }
        }

        let page = self.source.allocate_page(progress);
        if page.is_null() {
            return None;
        }
        // SAFETY: a fresh page has an uninitialized footer; write it whole.
        unsafe { self.write_fresh_footer(page as usize) };
        Some(self.hand_out(page as usize))
    }

    /// Allocates one page whose usable region (everything before the footer)
    /// is zero.
    pub fn allocate_page_zeroed(&'static self, progress: ProgressGuarantee) -> Option<NonNull<u8>> {
        self.drain_pending(progress);

        let footer = self.free_zeroed.try_pop_unpinned();
        if !footer.is_null() {
            self.free_count.fetch_sub(1, Ordering::Relaxed);
            // SAFETY: pages on the free stacks are live.
            let page = unsafe { (*footer).page_base() };
            return Some(self.hand_out(page));
        }

        let footer = self.free.try_pop_unpinned();
        if !footer.is_null() {
            self.free_count.fetch_sub(1, Ordering::Relaxed);
            // SAFETY: as above; raw pages must be cleared before reuse.
            let page = unsafe { (*footer).page_base() };
            unsafe { zero_usable_region(page) };
            return Some(self.hand_out(page));
        }

        let page = self.source.allocate_page(progress);
        if page.is_null() {
            return None;
        }
        unsafe {
            zero_usable_region(page as usize);
            self.write_fresh_footer(page as usize);
        }
        Some(self.hand_out(page as usize))
    }

    fn hand_out(&self, page: usize) -> NonNull<u8> {
        // SAFETY: `page` is live and owned by the caller from here on.
        unsafe { PageFooter::of_page(page).reset_link() };
        NonNull::new(page as *mut u8).expect("page base is never null")
    }

    /// # Safety
    ///
    /// `page` must be a page fresh from the source, footer uninitialized.
    unsafe fn write_fresh_footer(&self, page: usize) {
        let footer = (page + FOOTER_OFFSET) as *mut PageFooter;
        ptr::write(
            footer,
            PageFooter {
                next_page: Default::default(),
                pin_count: AtomicUsize::new(0),
            },
        );
    }

    // ---------------------------------------------------------------------
    // DEALLOCATION
    // ---------------------------------------------------------------------

    /// Returns a page to the manager. The content may be anything.
    pub fn deallocate_page(&'static self, page: NonNull<u8>) {
        self.give_back(page.as_ptr() as usize, false);
    }

    /// Returns a page whose usable region the caller has restored to zero.
    pub fn deallocate_page_zeroed(&'static self, page: NonNull<u8>) {
        self.give_back(page.as_ptr() as usize, true);
    }

    fn give_back(&'static self, page: usize, zeroed: bool) {
        debug_assert!(page % PAGE_ALIGN == 0, "not a page base: {page:#x}");

        self.drain_pending(ProgressGuarantee::Blocking);

        /* Order the caller's unlinking of this page before the scan: a
        thread that published a hazard and then re-validated the link must
        either be seen here, or have seen the unlink and backed off. */
        std::sync::atomic::fence(Ordering::SeqCst);

        if self.hazards.is_hazard(page) {
            trace!("page manager: deferring page {page:#x}, hazard held");
            PENDING.with(|cell| {
                cell.borrow_mut().entries.push(PendingPage {
                    manager: self,
                    page,
                    zeroed,
                });
            });
            return;
        }

        self.push_free(page, zeroed);
    }

    /// Pushes onto the matching free stack, briefly waiting out a pop that
    /// holds the stack lock.
    fn push_free(&self, page: usize, zeroed: bool) {
        let stack = if zeroed { &self.free_zeroed } else { &self.free };
        // SAFETY: the page is live; the caller has relinquished it.
        let footer = unsafe { PageFooter::of_page(page) as *const PageFooter as *mut PageFooter };

        let mut backoff = Backoff::new();
        while !stack.try_push(footer) {
            backoff.snooze();
        }
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Retries this thread's deferred pages, plus any pages adopted from
    /// exited threads. Deferred zeroed pages are re-zeroed here: a stale
    /// claimant may have written a control word while the page was parked.
    fn drain_pending(&'static self, progress: ProgressGuarantee) {
        if !progress.allows_retry() {
            // wait-free callers skip the drain; the pages stay parked
            return;
        }
        PENDING.with(|cell| {
            let mut pending = cell.borrow_mut();
            if pending.entries.is_empty() {
                return;
            }
            pending.entries.retain(|entry| {
                if entry.manager.hazards.is_hazard(entry.page) {
                    return true;
                }
                if entry.zeroed {
                    // SAFETY: the page is parked; no queue owns it.
                    unsafe { zero_usable_region(entry.page) };
                }
                trace!("page manager: draining deferred page {:#x}", entry.page);
                entry.manager.push_free(entry.page, entry.zeroed);
                false
            });
        });

        if self.orphan_count.load(Ordering::Acquire) > 0 {
            let mut orphans = self.orphaned.lock().expect("orphan list poisoned");
            orphans.retain(|&(page, zeroed)| {
                if self.hazards.is_hazard(page) {
                    return true;
                }
                if zeroed {
                    // SAFETY: as above.
                    unsafe { zero_usable_region(page) };
                }
                self.orphan_count.fetch_sub(1, Ordering::Release);
                self.push_free(page, zeroed);
                false
            });
        }
    }

    // ---------------------------------------------------------------------
    // PINNING AND HAZARDS (crate-internal surface for the queues)
    // ---------------------------------------------------------------------

    /// Increments the pin count of the page containing `addr`.
    pub(crate) fn pin_page(&self, addr: usize) {
        // SAFETY: callers pin only pages they reached through a protected
        // pointer; pages are never unmapped.
        unsafe { PageFooter::of_page(addr & !(PAGE_ALIGN - 1)).pin() };
    }

    /// Decrements the pin count of the page containing `addr`.
    pub(crate) fn unpin_page(&self, addr: usize) {
        // SAFETY: paired with `pin_page`.
        unsafe { PageFooter::of_page(addr & !(PAGE_ALIGN - 1)).unpin() };
    }

    /// Acquires a hazard slot for the calling thread.
    pub(crate) fn acquire_hazard(&'static self) -> HazardGuard {
        self.hazards.acquire()
    }

    #[cfg(test)]
    pub(crate) fn is_hazard(&self, page: usize) -> bool {
        self.hazards.is_hazard(page)
    }
}

/// # Safety
///
/// The caller must own the page; nothing may concurrently access its usable
/// region.
unsafe fn zero_usable_region(page: usize) {
    ptr::write_bytes(page as *mut u8, 0, FOOTER_OFFSET);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_reuses_freed_pages() {
        let mgr = PageManager::leak_new();
        let a = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        mgr.deallocate_page(a);
        assert_eq!(mgr.pages_free(), 1);

        let b = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(a, b, "freed page should be reused");
        assert_eq!(mgr.pages_free(), 0);
        assert_eq!(mgr.pages_allocated(), 1);
        mgr.deallocate_page(b);
    }

    #[test]
    fn test_zeroed_allocation_is_zero() {
        let mgr = PageManager::leak_new();
        let page = mgr.allocate_page_zeroed(ProgressGuarantee::Blocking).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(page.as_ptr(), FOOTER_OFFSET) };
        assert!(bytes.iter().all(|&b| b == 0));

        // dirty it, free it raw, ask for a zeroed page again
        unsafe { *page.as_ptr() = 0xAB };
        mgr.deallocate_page(page);
        let again = mgr.allocate_page_zeroed(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(again, page);
        let bytes = unsafe { std::slice::from_raw_parts(again.as_ptr(), FOOTER_OFFSET) };
        assert!(bytes.iter().all(|&b| b == 0));
        mgr.deallocate_page_zeroed(again);
    }

    #[test]
    fn test_hazard_defers_reuse() {
        let mgr = PageManager::leak_new();
        let page = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        let addr = page.as_ptr() as usize;

        let guard = mgr.acquire_hazard();
        guard.protect(addr);

        // the free goes to the pending list, not the free stack
        mgr.deallocate_page(page);
        assert_eq!(mgr.pages_free(), 0);
        assert!(mgr.is_hazard(addr));

        // while the hazard is held, allocation must not return this page
        let other = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_ne!(other, page);

        // dropping the hazard lets a later allocation drain and reuse it
        drop(guard);
        let reused = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(reused.as_ptr() as usize, addr);

        mgr.deallocate_page(other);
        mgr.deallocate_page(reused);
    }

    #[test]
    fn test_concurrent_reclaimer_defers_to_hazard() {
        use std::sync::Barrier;

        let mgr = PageManager::leak_new();
        let page = mgr.allocate_page_zeroed(ProgressGuarantee::Blocking).unwrap();
        let addr = page.as_ptr() as usize;
        let barrier = Barrier::new(2);

        std::thread::scope(|scope| {
            // reader: publishes the hazard, then keeps dereferencing the page
            // while the other thread frees it and recycles pages
            scope.spawn(|| {
                let guard = mgr.acquire_hazard();
                guard.protect(addr);
                barrier.wait(); // the free happens now
                barrier.wait(); // free and re-allocations done
                // the page was never handed out again: its bytes are intact
                let bytes =
                    unsafe { std::slice::from_raw_parts(addr as *const u8, FOOTER_OFFSET) };
                assert!(bytes.iter().all(|&b| b == 0));
                drop(guard);
                barrier.wait(); // hazard popped
            });

            barrier.wait();
            mgr.deallocate_page_zeroed(page);

            // while the hazard is held, no allocation may return the page;
            // dirty every page we do get to catch aliasing
            let mut held = Vec::new();
            for _ in 0..4 {
                let p = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
                assert_ne!(p.as_ptr() as usize, addr);
                unsafe { p.as_ptr().write(0xEE) };
                held.push(p);
            }
            barrier.wait();
            barrier.wait();

            // with the hazard popped, a later allocation drains the deferred
            // page and returns it to service
            let mut reused = false;
            for _ in 0..8 {
                let p = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
                if p.as_ptr() as usize == addr {
                    reused = true;
                }
                held.push(p);
            }
            assert!(reused, "page must return to service after the hazard pops");

            for p in held {
                mgr.deallocate_page(p);
            }
        });
    }

    #[test]
    fn test_pinned_page_stays_on_stack_but_is_skipped() {
        let mgr = PageManager::leak_new();
        let a = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        let b = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        let a_addr = a.as_ptr() as usize;

        mgr.pin_page(a_addr);
        mgr.deallocate_page(a);
        mgr.deallocate_page(b);

        // the pop must skip the pinned page and return the other one
        let got = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(got, b);

        mgr.unpin_page(a_addr);
        let got2 = mgr.allocate_page(ProgressGuarantee::Blocking).unwrap();
        assert_eq!(got2, a);

        mgr.deallocate_page(got);
        mgr.deallocate_page(got2);
    }
}
