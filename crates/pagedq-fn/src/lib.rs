//! pagedq-fn - Function Queues over pagedq-rs
//!
//! A [`FunctionQueue`] stores arbitrary callables of one fixed call signature
//! inline in pages: no boxing, no per-element allocation. Pushing stores the
//! callable by value next to a one- or two-word descriptor; consuming invokes
//! it with the supplied arguments, destroys it, and returns the result.
//!
//! The call signature is expressed as `FunctionQueue<Args, Ret>`, with
//! multi-argument signatures using a tuple for `Args`:
//!
//! ```
//! use pagedq_fn::FunctionQueue;
//! use pagedq_rs::QueueConfig;
//!
//! // a queue of int(int, int) callables
//! let queue: FunctionQueue<(i32, i32), i32> = FunctionQueue::new(QueueConfig::default());
//! queue.push(|(a, b)| a + b);
//!
//! assert_eq!(queue.try_consume((40, 2)), Some(42));
//! assert_eq!(queue.try_consume((0, 0)), None);
//! ```
//!
//! # Erasure policies
//!
//! [`StandardErasure`] (the default) stores an invoke and a destroy pointer:
//! clearing or dropping the queue destroys every live callable.
//! [`ManualErasure`] saves one word per slot by storing only the invoke
//! pointer; a [`ManualFunctionQueue`] that is cleared or dropped before being
//! drained *leaks* the remaining callables.

mod erasure;

pub use erasure::{
    ErasurePolicy, FnDescriptor, ManualDesc, ManualErasure, StandardDesc, StandardErasure,
};

use std::marker::PhantomData;

use pagedq_rs::{
    Consumer, DescriptorOf, HeterQueue, PageManager, Producer, ProgressGuarantee, QueueConfig,
    RuntimeType, TryPushError,
};

/// A queue of callables with signature `FnOnce(A) -> Rt`.
///
/// Concurrency cardinality and consistency follow the [`QueueConfig`], with
/// the same rules as [`HeterQueue`]: single-cardinality sides go through the
/// exclusive [`FnProducer`] / [`FnConsumer`] handles.
pub struct FunctionQueue<A = (), Rt = (), E = StandardErasure>
where
    A: 'static,
    Rt: 'static,
    E: ErasurePolicy<A, Rt>,
{
    queue: HeterQueue<E::Desc>,
    _signature: PhantomData<fn(A) -> Rt>,
}

/// A function queue that stores no destroy pointer. See [`ManualErasure`].
pub type ManualFunctionQueue<A = (), Rt = ()> = FunctionQueue<A, Rt, ManualErasure>;

impl<A, Rt, E> FunctionQueue<A, Rt, E>
where
    A: 'static,
    Rt: 'static,
    E: ErasurePolicy<A, Rt>,
{
    /// Creates a function queue on the process-wide page manager.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            queue: HeterQueue::new(config),
            _signature: PhantomData,
        }
    }

    /// Creates a function queue on a specific page manager.
    pub fn with_manager(config: QueueConfig, manager: &'static PageManager) -> Self {
        Self {
            queue: HeterQueue::with_manager(config, manager),
            _signature: PhantomData,
        }
    }

    /// Stores a callable, blocking as needed.
    pub fn push<F>(&self, callable: F)
    where
        F: FnOnce(A) -> Rt + Send + 'static,
        E::Desc: DescriptorOf<F>,
    {
        self.queue.push(callable);
    }

    /// Stores a callable under the selected progress guarantee. On failure
    /// the callable is handed back inside the error.
    pub fn try_push<F>(
        &self,
        progress: ProgressGuarantee,
        callable: F,
    ) -> Result<(), TryPushError<F>>
    where
        F: FnOnce(A) -> Rt + Send + 'static,
        E::Desc: DescriptorOf<F>,
    {
        self.queue.try_push(progress, callable)
    }

    /// Invokes the oldest stored callable with `args`, destroys it, and
    /// returns its result. `None` when nothing was consumable.
    ///
    /// A panicking callable is still consumed: invocation took it by value,
    /// so its slot is retired during the unwind.
    pub fn try_consume(&self, args: A) -> Option<Rt> {
        let txn = self.queue.start_consume()?;
        Some(invoke_claimed(txn, args))
    }

    /// Destroys every currently stored callable without invoking it.
    ///
    /// With [`ManualErasure`] the callables cannot be destroyed and are
    /// leaked instead.
    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Point-in-time emptiness probe.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Claims the exclusive producer handle (required on single-producer
    /// configurations).
    pub fn producer(&self) -> Option<FnProducer<'_, A, Rt, E>> {
        self.queue.producer().map(|inner| FnProducer {
            inner,
            _signature: PhantomData,
        })
    }

    /// Claims the exclusive consumer handle (required on single-consumer
    /// configurations).
    pub fn consumer(&self) -> Option<FnConsumer<'_, A, Rt, E>> {
        self.queue.consumer().map(|inner| FnConsumer {
            inner,
            _signature: PhantomData,
        })
    }
}

/// Runs a claimed slot's callable and retires the slot, on return or unwind.
fn invoke_claimed<A, Rt, D>(txn: pagedq_rs::ConsumeTransaction<'_, D>, args: A) -> Rt
where
    D: FnDescriptor<A, Rt>,
{
    struct Retire<'a, D: RuntimeType>(Option<pagedq_rs::ConsumeTransaction<'a, D>>);
    impl<D: RuntimeType> Drop for Retire<'_, D> {
        fn drop(&mut self) {
            if let Some(txn) = self.0.take() {
                // the callable was consumed by the unwinding invocation; the
                // slot must not return to the ready state
                txn.commit_nodestroy();
            }
        }
    }

    let descriptor = txn.complete_type();
    let base = txn.unaligned_element_ptr();
    let mut retire = Retire(Some(txn));
    // SAFETY: the transaction claims a live callable this descriptor was
    // stored with; invoke_destroy consumes it exactly once.
    let result = unsafe { descriptor.invoke_destroy(base, args) };
    if let Some(txn) = retire.0.take() {
        txn.commit_nodestroy();
    }
    result
}

/// Exclusive producer handle of a [`FunctionQueue`].
pub struct FnProducer<'a, A, Rt, E>
where
    A: 'static,
    Rt: 'static,
    E: ErasurePolicy<A, Rt>,
{
    inner: Producer<'a, E::Desc>,
    _signature: PhantomData<fn(A) -> Rt>,
}

impl<A, Rt, E> FnProducer<'_, A, Rt, E>
where
    A: 'static,
    Rt: 'static,
    E: ErasurePolicy<A, Rt>,
{
    /// See [`FunctionQueue::push`].
    pub fn push<F>(&mut self, callable: F)
    where
        F: FnOnce(A) -> Rt + Send + 'static,
        E::Desc: DescriptorOf<F>,
    {
        self.inner.push(callable);
    }

    /// See [`FunctionQueue::try_push`].
    pub fn try_push<F>(
        &mut self,
        progress: ProgressGuarantee,
        callable: F,
    ) -> Result<(), TryPushError<F>>
    where
        F: FnOnce(A) -> Rt + Send + 'static,
        E::Desc: DescriptorOf<F>,
    {
        self.inner.try_push(progress, callable)
    }
}

/// Exclusive consumer handle of a [`FunctionQueue`].
pub struct FnConsumer<'a, A, Rt, E>
where
    A: 'static,
    Rt: 'static,
    E: ErasurePolicy<A, Rt>,
{
    inner: Consumer<'a, E::Desc>,
    _signature: PhantomData<fn(A) -> Rt>,
}

impl<A, Rt, E> FnConsumer<'_, A, Rt, E>
where
    A: 'static,
    Rt: 'static,
    E: ErasurePolicy<A, Rt>,
{
    /// See [`FunctionQueue::try_consume`].
    pub fn try_consume(&mut self, args: A) -> Option<Rt> {
        let txn = self.inner.start_consume()?;
        Some(invoke_claimed(txn, args))
    }

    /// See [`FunctionQueue::clear`].
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// See [`FunctionQueue::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_void_signature_roundtrip() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let queue: FunctionQueue = FunctionQueue::new(QueueConfig::default());

        queue.push(|()| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(queue.try_consume(()), Some(()));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(queue.try_consume(()), None);
    }

    #[test]
    fn test_captured_state_travels_with_callable() {
        let queue: FunctionQueue<u32, String> = FunctionQueue::new(QueueConfig::default());
        let prefix = String::from("value-");
        queue.push(move |n| format!("{prefix}{n}"));

        assert_eq!(queue.try_consume(7).as_deref(), Some("value-7"));
    }

    #[test]
    fn test_panicking_callable_is_retired() {
        let queue: FunctionQueue<(), u8> = FunctionQueue::new(QueueConfig::default());
        queue.push(|()| panic!("invoked and gone"));
        queue.push(|()| 9);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.try_consume(());
        }));
        assert!(result.is_err());

        // the panicking slot is gone; the next callable is intact
        assert_eq!(queue.try_consume(()), Some(9));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_consumer_via_handle() {
        use pagedq_rs::MPSC_CONFIG;

        let queue: FunctionQueue<i64, i64> = FunctionQueue::new(MPSC_CONFIG);
        queue.push(|x| x - 1);

        let mut consumer = queue.consumer().unwrap();
        assert_eq!(consumer.try_consume(10), Some(9));
        assert!(consumer.is_empty());
    }
}
