//! Reusable single-awaiter completion primitive.
//!
//! A [`CompletionSource`] represents a value (or void, or error, or
//! cancellation) that becomes available exactly once per *cycle*. One
//! producer calls one of `set_result` / `set_exception` / `set_canceled`;
//! one consumer awaits the outcome; once the result is consumed the source
//! resets itself and is reused for the next cycle without reallocation.
//!
//! The primitive is a completion signal, not a lock: no method blocks, and
//! continuation hand-off between the racing producer and consumer is a
//! single atomic slot exchange.
//!
//! # Modules
//!
//! - [`CompletionSource`]: the producer/consumer handle and its `Future`
//!   adapters
//! - [`AwaitableSource`]: the poll/register/consume contract for runtimes
//!   that drive a cycle by hand
//! - [`dispatch`](SynchronizationContext): where continuations run: inline,
//!   on the ambient Tokio runtime, or on an installed context/scheduler
//! - [`ready`]: immediately-settled awaitables for known outcomes
//!
//! # Examples
//!
//! ```
//! use core_completion::{CancellationToken, CompletionSource};
//!
//! async fn example() {
//!     let source = CompletionSource::<u32>::default();
//!
//!     // Consumer side: obtain the awaitable for this cycle, optionally
//!     // wired to a cancellation token.
//!     let token = CancellationToken::new();
//!     let pending = source.await_value(Some(token.clone()));
//!
//!     // Producer side, possibly on another thread.
//!     let producer = source.clone();
//!     assert!(producer.set_result(42));
//!
//!     assert_eq!(pending.await.unwrap(), 42);
//! }
//! ```
//!
//! # Contract violations
//!
//! Stale version tokens, double completion of one cycle, double continuation
//! registration, and consuming before completion are programming errors and
//! panic immediately. They are never retried or silently swallowed.
//!
//! # Concurrency contract
//!
//! Exactly one producer and one consumer per cycle. Constructing multiple
//! concurrent consumers against one cycle is undefined usage. The version
//! counter wraps after 65536 cycles; token checks are plain equality, a
//! documented theoretical limitation.

mod cancellation;
mod contract;
mod dispatch;
mod error;
mod logic;
pub mod ready;
mod source;

pub use contract::{AwaitableSource, CompletionFlags, CompletionStatus, Continuation, OpaqueState};
pub use dispatch::{
    current_scheduler, current_synchronization_context, with_scheduler,
    with_synchronization_context, ContinuationScheduler, SynchronizationContext,
};
pub use error::{BoxError, CompletionError};
pub use source::{CompletionSource, ContinuationOptions, ValueAwaitable, VoidAwaitable};

// Re-export the cancellation type consumers hand to `await_value`.
pub use tokio_util::sync::CancellationToken;
