//! pagedq - Heterogeneous Page-Backed Lock-Free Queues
//!
//! Queues that store values of *different complete types* contiguously inside
//! 64 KiB virtual-memory pages: no per-element allocation, no boxed trait
//! objects, type identity erased into a small run-time descriptor stored next
//! to each value.
//!
//! # Key pieces
//!
//! - [`PageManager`]: process-wide source of fixed-size aligned pages, with
//!   free-page caching and hazard-pointer deferred reclamation
//! - [`HeterQueue`]: the queue itself, FIFO per producer, with
//!   single/multi cardinality per side and sequential/relaxed consistency
//!   selected at construction
//! - four progress flavors per operation: blocking, lock-free and wait-free
//!   (the blocking flavor panics only on unrecoverable OOM)
//! - two-phase [`PushTransaction`] / [`ConsumeTransaction`] APIs with
//!   commit/cancel and raw-block side allocations
//!
//! # Example
//!
//! ```
//! use pagedq_rs::{HeterQueue, QueueConfig};
//!
//! let queue: HeterQueue = HeterQueue::new(QueueConfig::default());
//! queue.push(42u64);
//! queue.push(String::from("mixed types, one queue"));
//!
//! let mut labels = Vec::new();
//! while queue.try_consume(|ty, ptr| unsafe {
//!     if let Some(n) = ty.downcast_ptr::<u64>(ptr) {
//!         labels.push(format!("number {}", *n));
//!     } else if let Some(s) = ty.downcast_ptr::<String>(ptr) {
//!         labels.push(format!("string {:?}", *s));
//!     }
//! }) {}
//!
//! assert_eq!(labels.len(), 2);
//! assert!(queue.is_empty());
//! ```

mod backoff;
mod config;
mod error;
mod hazard;
mod head;
mod invariants;
mod layout;
mod page;
mod page_manager;
mod page_source;
mod progress;
mod queue;
mod runtime;
mod tail;

pub use backoff::Backoff;
pub use config::{QueueConfig, MPMC_CONFIG, MPSC_CONFIG, SPMC_CONFIG, SPSC_CONFIG};
pub use error::{RawAllocError, TryPushError};
pub use page::{PAGE_ALIGN, PAGE_BYTES};
pub use page_manager::PageManager;
pub use progress::{Cardinality, Consistency, ProgressGuarantee};
pub use queue::{Consumer, ConsumeTransaction, HeterQueue, Producer, PushTransaction};
pub use runtime::{AnyType, DescriptorOf, RuntimeType};
