//! Pages and the free-page stacks.
//!
//! A page is a `PAGE_BYTES`-sized, `PAGE_ALIGN`-aligned byte buffer. The last
//! bytes of every page hold a [`PageFooter`]: the intrusive link used while
//! the page sits on a free list, and the pin count that forbids reuse of the
//! page's bytes while any thread may still dereference into it.

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::invariants::debug_assert_pin_balanced;

/// Size of every page, in bytes.
pub const PAGE_BYTES: usize = 64 * 1024;

/// Alignment of every page. Equal to the size, so the page base of any
/// address inside a page is a single mask away.
pub const PAGE_ALIGN: usize = PAGE_BYTES;

/// Offset of the footer from the page base. The usable byte region of a page
/// ends here.
pub(crate) const FOOTER_OFFSET: usize = PAGE_BYTES - size_of::<PageFooter>();

const _: () = assert!(PAGE_BYTES.is_power_of_two());
const _: () = assert!(FOOTER_OFFSET % std::mem::align_of::<PageFooter>() == 0);

/// Structure at the tail of every page.
#[repr(C)]
pub(crate) struct PageFooter {
    /// Next page when this page is inside a stack, undefined otherwise.
    pub(crate) next_page: AtomicPtr<PageFooter>,

    /// Number of times the page has been pinned. The page manager does not
    /// hand out a page while its pin count is greater than zero.
    pub(crate) pin_count: AtomicUsize,
}

impl PageFooter {
    /// Footer of the page with base address `page`.
    ///
    /// # Safety
    ///
    /// `page` must be the base address of a live page.
    #[inline]
    pub(crate) unsafe fn of_page<'a>(page: usize) -> &'a PageFooter {
        debug_assert!(page % PAGE_ALIGN == 0, "not a page base: {page:#x}");
        &*((page + FOOTER_OFFSET) as *const PageFooter)
    }

    /// Base address of the page this footer belongs to.
    #[inline]
    pub(crate) fn page_base(&self) -> usize {
        (self as *const PageFooter as usize) - FOOTER_OFFSET
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        let previous = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert_pin_balanced!(previous);
    }

    /// Resets the footer for a page leaving the manager. The pin count is
    /// left alone: a page cannot leave a free stack while pinned, and a page
    /// coming straight from the system has a zeroed footer written first.
    #[inline]
    pub(crate) fn reset_link(&self) {
        self.next_page.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

// =============================================================================
// NON-ATOMIC PAGE STACK
// =============================================================================

/// A singly linked list of pages threaded through their footers. Not thread
/// safe: used on lists that a single thread logically owns, such as a free
/// stack stolen during a pop.
pub(crate) struct PageStack {
    first: *mut PageFooter,
    cached_last: *mut PageFooter,
}

impl PageStack {
    pub(crate) fn new(first: *mut PageFooter) -> Self {
        Self {
            first,
            cached_last: ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn first(&self) -> *mut PageFooter {
        self.first
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    /// Removes the first page whose pin count is zero, or returns null.
    pub(crate) fn pop_unpinned(&mut self) -> *mut PageFooter {
        // we may remove the last page, so forget the cached tail
        self.cached_last = ptr::null_mut();

        let mut prev: *mut PageFooter = ptr::null_mut();
        let mut curr = self.first;
        while !curr.is_null() {
            // SAFETY: pages on a stolen stack stay alive for the whole pop;
            // only this thread edits the links.
            unsafe {
                if (*curr).pin_count.load(Ordering::SeqCst) == 0 {
                    let next = (*curr).next_page.load(Ordering::Relaxed);
                    if prev.is_null() {
                        self.first = next;
                    } else {
                        (*prev).next_page.store(next, Ordering::Relaxed);
                    }
                    return curr;
                }
                prev = curr;
                curr = (*curr).next_page.load(Ordering::Relaxed);
            }
        }

        // the search failed, but the walk found the last page
        self.cached_last = prev;
        ptr::null_mut()
    }
}

// =============================================================================
// LOCK-FREE FREE STACK
// =============================================================================

/// Lock-free stack of free pages, specialized for the page manager.
///
/// A pop first exchanges the top with a lock marker, which makes concurrent
/// pops (and pushes) observe a locked stack; it then walks and edits the list
/// non-atomically and restores the top. This sidesteps the ABA problem
/// without tags and lets `next_page` links be edited plainly during the walk.
/// Pushes are a single compare-exchange and never wait.
pub(crate) struct FreeStack {
    top: AtomicPtr<PageFooter>,
}

fn lock_marker() -> *mut PageFooter {
    1 as *mut PageFooter
}

impl FreeStack {
    pub(crate) fn new() -> Self {
        Self {
            top: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Tries to push a (possibly still pinned) page. Fails only while a pop
    /// holds the stack, or on a lost compare-exchange.
    pub(crate) fn try_push(&self, page: *mut PageFooter) -> bool {
        debug_assert!(!page.is_null());

        let top = self.top.load(Ordering::Relaxed);
        if top == lock_marker() {
            return false;
        }

        // SAFETY: the page is owned by the caller until the push commits.
        unsafe { (*page).next_page.store(top, Ordering::Relaxed) };

        /* Weak CAS: the strong form may not be wait-free. ABA is harmless on
        push: even if the top changed to B and back, committing on the old
        value is still a valid push. */
        self.top
            .compare_exchange_weak(top, page, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Removes the first unpinned page, or returns null. While the pop is in
    /// progress other threads observe a locked (effectively empty) stack.
    pub(crate) fn try_pop_unpinned(&self) -> *mut PageFooter {
        let top = self.top.swap(lock_marker(), Ordering::Acquire);
        if top == lock_marker() {
            // another pop is in progress
            return ptr::null_mut();
        }

        let mut stack = PageStack::new(top);
        let page = if stack.is_empty() {
            ptr::null_mut()
        } else {
            stack.pop_unpinned()
        };

        self.top.store(stack.first(), Ordering::Release);
        page
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    // Footers backed by plain boxes; the stacks only touch footer fields.
    fn footer_box() -> Box<PageFooter> {
        Box::new(PageFooter {
            next_page: AtomicPtr::new(ptr::null_mut()),
            pin_count: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_free_stack_push_pop() {
        let stack = FreeStack::new();
        let a = Box::into_raw(footer_box());
        let b = Box::into_raw(footer_box());

        assert!(stack.try_push(a));
        assert!(stack.try_push(b));

        // LIFO: b out first
        assert_eq!(stack.try_pop_unpinned(), b);
        assert_eq!(stack.try_pop_unpinned(), a);
        assert!(stack.try_pop_unpinned().is_null());

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn test_pop_skips_pinned_pages() {
        let stack = FreeStack::new();
        let a = Box::into_raw(footer_box());
        let b = Box::into_raw(footer_box());

        assert!(stack.try_push(a));
        assert!(stack.try_push(b));

        unsafe { (*b).pin() };

        // b (top) is pinned, so a comes out from underneath it
        assert_eq!(stack.try_pop_unpinned(), a);

        unsafe { (*b).unpin() };
        assert_eq!(stack.try_pop_unpinned(), b);

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn test_locked_stack_rejects_pushes() {
        let stack = FreeStack::new();
        let a = Box::into_raw(footer_box());

        // hold the pop lock by swapping the marker in manually
        let top = stack.top.swap(lock_marker(), Ordering::Acquire);
        assert!(top.is_null());
        assert!(!stack.try_push(a), "pushes fail while a pop is in progress");
        stack.top.store(top, Ordering::Release);

        assert!(stack.try_push(a));
        assert_eq!(stack.try_pop_unpinned(), a);

        unsafe { drop(Box::from_raw(a)) };
    }
}
