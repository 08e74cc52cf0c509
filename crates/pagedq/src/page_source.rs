//! Irreversible page allocation from the host allocator.
//!
//! The source obtains large aligned memory *regions* from the global
//! allocator and carves them into pages. Regions enter a singly linked list
//! and are never released until the source is dropped; in some contention
//! cases a region may be allocated and freed again without serving a page.
//!
//! If a page fits in the current region the allocation is a single
//! `fetch_add` (wait-free in practice); the wait-free flavor uses a single
//! compare-exchange instead and reports failure to the caller. Only the
//! blocking flavor may call into the host allocator to grow a new region.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::{debug, warn};

use crate::page::{PAGE_ALIGN, PAGE_BYTES};
use crate::progress::ProgressGuarantee;

/// Bytes requested from the host per region. Halved iteratively on failure.
pub(crate) const REGION_DEFAULT_BYTES: usize = 4 * 1024 * 1024;

/// Smallest region worth asking for. Below this, allocation fails.
pub(crate) const REGION_MIN_BYTES: usize = 8 * PAGE_BYTES;

const _: () = assert!(REGION_DEFAULT_BYTES % PAGE_BYTES == 0);
const _: () = assert!(REGION_MIN_BYTES % PAGE_BYTES == 0);

struct Region {
    /// Address of the next free page. When >= `end`, the region is exhausted.
    cursor: AtomicUsize,
    /// First address after the last allocable page.
    end: usize,
    /// First allocable page.
    start: usize,
    /// Next region in the list.
    next: AtomicPtr<Region>,
    /// Host allocation backing this region, kept for `Drop`.
    layout: Layout,
}

impl Region {
    /// Allocates the region memory from the host, halving the request on
    /// failure down to [`REGION_MIN_BYTES`]. Returns null on exhaustion.
    fn create() -> *mut Region {
        let mut region_bytes = REGION_DEFAULT_BYTES;
        loop {
            // SAFETY: layout is non-zero-sized and power-of-two aligned.
            let layout = Layout::from_size_align(region_bytes, PAGE_ALIGN)
                .expect("region layout");
            let base = unsafe { alloc(layout) };
            if !base.is_null() {
                let start = base as usize;
                debug!(
                    "page source: new {} KiB region at {:#x}",
                    region_bytes / 1024,
                    start
                );
                let region = Box::new(Region {
                    cursor: AtomicUsize::new(start),
                    end: start + region_bytes,
                    start,
                    next: AtomicPtr::new(ptr::null_mut()),
                    layout,
                });
                return Box::into_raw(region);
            }
            if region_bytes == REGION_MIN_BYTES {
                warn!("page source: host refused a {} KiB region", region_bytes / 1024);
                return ptr::null_mut();
            }
            region_bytes = (region_bytes / 2).max(REGION_MIN_BYTES);
        }
    }

    /// Optimistic allocation: blindly bump the cursor, undo on overshoot.
    fn allocate_lock_free(&self) -> *mut u8 {
        let page = self.cursor.fetch_add(PAGE_BYTES, Ordering::Relaxed);
        if page >= self.start && page < self.end {
            page as *mut u8
        } else {
            /* The overshoot detection fails only if enough threads race here
            to wrap the cursor across the address space, which would need an
            absurd thread count. */
            self.cursor.fetch_sub(PAGE_BYTES, Ordering::Relaxed);
            ptr::null_mut()
        }
    }

    /// Wait-free allocation: one compare-exchange, failure goes to the caller.
    fn allocate_wait_free(&self) -> *mut u8 {
        let cursor = self.cursor.load(Ordering::Relaxed);
        if cursor >= self.end {
            return ptr::null_mut();
        }
        match self.cursor.compare_exchange_weak(
            cursor,
            cursor + PAGE_BYTES,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => cursor as *mut u8,
            Err(_) => ptr::null_mut(),
        }
    }

    fn allocate(&self, progress: ProgressGuarantee) -> *mut u8 {
        match progress {
            ProgressGuarantee::WaitFree => self.allocate_wait_free(),
            _ => self.allocate_lock_free(),
        }
    }
}

/// Thread-safe, irreversible source of pages.
pub(crate) struct PageSource {
    /// Entry point for allocation. Usually the most recent region, but it may
    /// lag behind under contention; it is repaired opportunistically and
    /// non-repair is benign.
    active: AtomicPtr<Region>,

    /// True first region, anchor for `Drop`. Set once.
    first: AtomicPtr<Region>,

    /// Pages handed out over the source's lifetime.
    pages_served: AtomicUsize,
}

impl PageSource {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicPtr::new(ptr::null_mut()),
            first: AtomicPtr::new(ptr::null_mut()),
            pages_served: AtomicUsize::new(0),
        }
    }

    /// Number of pages served since construction.
    pub(crate) fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::Relaxed)
    }

    /// Allocates one page. Returns null when no region has room and the
    /// selected progress guarantee does not permit growing a new one (or the
    /// host is out of memory).
    pub(crate) fn allocate_page(&self, progress: ProgressGuarantee) -> *mut u8 {
        let mut spare: *mut Region = ptr::null_mut();
        let mut curr = self.active.load(Ordering::Acquire);

        let page = loop {
            if curr.is_null() {
                // no region yet
                if !progress.allows_region_growth() {
                    break ptr::null_mut();
                }
                if spare.is_null() {
                    spare = Region::create();
                    if spare.is_null() {
                        break ptr::null_mut();
                    }
                }
                match self.first.compare_exchange(
                    ptr::null_mut(),
                    spare,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.active.store(spare, Ordering::Release);
                        curr = spare;
                        spare = ptr::null_mut();
                    }
                    Err(existing) => curr = existing,
                }
                continue;
            }

            // SAFETY: regions entering the list are destroyed only when the
            // source drops, so this dereference is always valid.
            let region = unsafe { &*curr };
            let page = region.allocate(progress);
            if !page.is_null() {
                break page;
            }

            let mut next = region.next.load(Ordering::Acquire);
            if next.is_null() {
                if !progress.allows_region_growth() {
                    break ptr::null_mut();
                }
                if spare.is_null() {
                    spare = Region::create();
                }
                if !spare.is_null() {
                    match region.next.compare_exchange(
                        ptr::null_mut(),
                        spare,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            next = spare;
                            spare = ptr::null_mut();
                        }
                        Err(existing) => next = existing,
                    }
                } else {
                    /* We could not allocate a region; someone else may have
                    in the meanwhile. If not, give in. */
                    next = region.next.load(Ordering::Acquire);
                    if next.is_null() {
                        break ptr::null_mut();
                    }
                }
            }

            /* Move the entry pointer forward. Spurious failure is tolerable:
            the next caller starts one region behind and catches up. */
            let _ = self.active.compare_exchange_weak(
                curr,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            );
            curr = next;
        };

        if !spare.is_null() {
            // lost the install race end to end; return the region to the host
            // SAFETY: `spare` was created above and never entered the list.
            unsafe { delete_region(spare) };
        }

        if !page.is_null() {
            self.pages_served.fetch_add(1, Ordering::Relaxed);
        }
        page
    }
}

/// # Safety
///
/// `region` must have come from [`Region::create`] and must not be reachable
/// from any region list.
unsafe fn delete_region(region: *mut Region) {
    let boxed = Box::from_raw(region);
    dealloc(boxed.start as *mut u8, boxed.layout);
}

impl Drop for PageSource {
    fn drop(&mut self) {
        let mut curr = self.first.load(Ordering::Acquire);
        while !curr.is_null() {
            // SAFETY: exclusive access in Drop; the list is ours.
            unsafe {
                let next = (*curr).next.load(Ordering::Relaxed);
                delete_region(curr);
                curr = next;
            }
        }
    }
}
