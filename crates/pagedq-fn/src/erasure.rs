//! Erasure policies: how a callable's type collapses into the descriptor
//! stored next to it.
//!
//! Both descriptors report alignment 1 to the queue and re-derive the
//! callable's real address themselves: the invoke and destroy functions were
//! instantiated for the concrete callable type and know its alignment, so
//! the slot does not need to record it.

use std::marker::PhantomData;
use std::mem::align_of;
use std::ptr;

use pagedq_rs::{DescriptorOf, RuntimeType};

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Selects the descriptor layout of a [`FunctionQueue`](crate::FunctionQueue).
pub trait ErasurePolicy<A: 'static, Rt: 'static>: sealed::Sealed {
    /// The descriptor stored per callable.
    type Desc: FnDescriptor<A, Rt>;
}

/// Operations every function-queue descriptor provides.
pub trait FnDescriptor<A, Rt>: RuntimeType {
    /// Builds the descriptor of a concrete callable type.
    fn of_callable<F>() -> Self
    where
        F: FnOnce(A) -> Rt + Send + 'static;

    /// Invokes the callable stored at `base` with `args` and destroys it.
    ///
    /// # Safety
    ///
    /// `base` must be the unaligned storage base of a live callable this
    /// descriptor was built for. The callable is consumed: on return *and*
    /// on unwind it no longer exists, and the slot must be retired, never
    /// returned to the ready state.
    unsafe fn invoke_destroy(&self, base: *mut u8, args: A) -> Rt;
}

/// Standard erasure: invoke and destroy pointers (two words per slot).
/// Clearing or dropping the queue destroys live callables.
pub struct StandardErasure;

/// Manual erasure: only the invoke pointer (one word per slot). The queue
/// cannot destroy callables it did not invoke: clearing or dropping a
/// non-drained queue *leaks* them. Meant for trivially destructible
/// callables or known-drain shutdown paths.
pub struct ManualErasure;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::StandardErasure {}
    impl Sealed for super::ManualErasure {}
}

impl<A: 'static, Rt: 'static> ErasurePolicy<A, Rt> for StandardErasure {
    type Desc = StandardDesc<A, Rt>;
}

impl<A: 'static, Rt: 'static> ErasurePolicy<A, Rt> for ManualErasure {
    type Desc = ManualDesc<A, Rt>;
}

// =============================================================================
// DESCRIPTOR IMPLS
// =============================================================================

unsafe fn invoke_impl<A, Rt, F: FnOnce(A) -> Rt>(base: *mut u8, args: A) -> Rt {
    let aligned = align_up(base as usize, align_of::<F>()) as *mut F;
    // Moving the callable out makes the call consume it; if the call
    // unwinds, the moved copy is dropped by the unwinding itself.
    let callable = ptr::read(aligned);
    callable(args)
}

unsafe fn destroy_impl<F>(base: *mut u8) {
    let aligned = align_up(base as usize, align_of::<F>()) as *mut F;
    ptr::drop_in_place(aligned);
}

/// Two-word descriptor: invoke-and-destroy plus standalone destroy.
pub struct StandardDesc<A: 'static, Rt: 'static> {
    invoke: unsafe fn(*mut u8, A) -> Rt,
    destroy: unsafe fn(*mut u8),
}

impl<A: 'static, Rt: 'static> Clone for StandardDesc<A, Rt> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<A: 'static, Rt: 'static> Copy for StandardDesc<A, Rt> {}

unsafe impl<A: 'static, Rt: 'static> RuntimeType for StandardDesc<A, Rt> {
    #[inline]
    fn align(&self) -> usize {
        1
    }

    unsafe fn drop_in_place(&self, base: *mut u8) {
        (self.destroy)(base);
    }
}

impl<A: 'static, Rt: 'static> FnDescriptor<A, Rt> for StandardDesc<A, Rt> {
    fn of_callable<F>() -> Self
    where
        F: FnOnce(A) -> Rt + Send + 'static,
    {
        Self {
            invoke: invoke_impl::<A, Rt, F>,
            destroy: destroy_impl::<F>,
        }
    }

    #[inline]
    unsafe fn invoke_destroy(&self, base: *mut u8, args: A) -> Rt {
        (self.invoke)(base, args)
    }
}

unsafe impl<A: 'static, Rt: 'static, F> DescriptorOf<F> for StandardDesc<A, Rt>
where
    F: FnOnce(A) -> Rt + Send + 'static,
{
    fn descriptor() -> Self {
        Self::of_callable::<F>()
    }
}

/// One-word descriptor: invoke-and-destroy only.
pub struct ManualDesc<A: 'static, Rt: 'static> {
    invoke: unsafe fn(*mut u8, A) -> Rt,
    _policy: PhantomData<fn(A) -> Rt>,
}

impl<A: 'static, Rt: 'static> Clone for ManualDesc<A, Rt> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<A: 'static, Rt: 'static> Copy for ManualDesc<A, Rt> {}

unsafe impl<A: 'static, Rt: 'static> RuntimeType for ManualDesc<A, Rt> {
    #[inline]
    fn align(&self) -> usize {
        1
    }

    unsafe fn drop_in_place(&self, _base: *mut u8) {
        // No destroy pointer was stored; the callable is leaked.
    }
}

impl<A: 'static, Rt: 'static> FnDescriptor<A, Rt> for ManualDesc<A, Rt> {
    fn of_callable<F>() -> Self
    where
        F: FnOnce(A) -> Rt + Send + 'static,
    {
        Self {
            invoke: invoke_impl::<A, Rt, F>,
            _policy: PhantomData,
        }
    }

    #[inline]
    unsafe fn invoke_destroy(&self, base: *mut u8, args: A) -> Rt {
        (self.invoke)(base, args)
    }
}

unsafe impl<A: 'static, Rt: 'static, F> DescriptorOf<F> for ManualDesc<A, Rt>
where
    F: FnOnce(A) -> Rt + Send + 'static,
{
    fn descriptor() -> Self {
        Self::of_callable::<F>()
    }
}
