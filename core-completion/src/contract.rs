//! The awaitable-source contract.
//!
//! This is the wire-level surface of the primitive: a consumer-side runtime
//! (a `Future` adapter, a poll loop, a hand-written awaiter) drives a
//! completion cycle exclusively through [`AwaitableSource`]. Every method
//! takes the version token handed out when the cycle was awaited; presenting
//! a token from a prior cycle is a contract violation and panics.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::CompletionError;

/// Observable state of one completion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// No completion method has been called yet.
    Pending,
    /// `set_result` stored a value.
    Succeeded,
    /// `set_exception` stored a generic error.
    Faulted,
    /// The cycle was completed with the cancellation-kind error.
    Canceled,
}

bitflags! {
    /// Behavior flags for [`AwaitableSource::on_completed`].
    ///
    /// The two flags are independent: context flow controls *what ambient
    /// state travels with* the continuation, scheduler use controls *where*
    /// it runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompletionFlags: u8 {
        /// Snapshot the current `tracing` span and re-enter it around the
        /// continuation wherever it ends up running.
        const FLOW_CONTEXT = 0b01;
        /// Capture the ambient synchronization context or continuation
        /// scheduler (if one is installed) as the dispatch target.
        const USE_SCHEDULING_CONTEXT = 0b10;
    }
}

/// Consumer callback invoked exactly once when the cycle completes.
///
/// A plain function pointer: no allocation per registration, and the slot it
/// occupies can be exchanged with a single atomic operation. Per-registration
/// data rides in the [`OpaqueState`] argument.
pub type Continuation = fn(OpaqueState);

/// Opaque per-registration state threaded through to the continuation.
///
/// Cheap to clone and `Send + Sync`, so it can cross into whatever thread the
/// dispatch policy picks.
#[derive(Clone)]
pub struct OpaqueState(Option<Arc<dyn Any + Send + Sync>>);

impl OpaqueState {
    /// Wraps a value for later retrieval via [`downcast_ref`](Self::downcast_ref).
    pub fn new<S: Any + Send + Sync>(state: S) -> Self {
        Self(Some(Arc::new(state)))
    }

    /// A state carrying nothing.
    pub fn none() -> Self {
        Self(None)
    }

    /// Borrows the wrapped value if it is an `S`.
    pub fn downcast_ref<S: Any>(&self) -> Option<&S> {
        self.0.as_ref()?.downcast_ref()
    }
}

impl fmt::Debug for OpaqueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueState")
            .field(&self.0.as_ref().map(|_| "..."))
            .finish()
    }
}

/// The contract between a completion cycle and its single consumer.
///
/// # Panics
///
/// All three methods panic when `token` does not match the current cycle
/// version. `get_result` additionally panics when called before completion,
/// and `on_completed` when a continuation is already installed for this
/// cycle. These are caller contract violations, not recoverable conditions.
pub trait AwaitableSource {
    /// The value produced on success.
    type Output;

    /// Classifies the cycle as pending, succeeded, faulted, or canceled.
    fn get_status(&self, token: u16) -> CompletionStatus;

    /// Consumes the cycle's outcome and resets the cycle for reuse.
    ///
    /// Returns the stored value, or re-raises the stored error verbatim.
    /// The version is bumped before this method returns, so the token is
    /// stale afterwards.
    fn get_result(&self, token: u16) -> Result<Self::Output, CompletionError>;

    /// Installs the continuation to fire when the cycle completes.
    ///
    /// If completion already happened, the continuation is dispatched
    /// immediately instead of being stored. Either way it fires exactly
    /// once.
    fn on_completed(
        &self,
        continuation: Continuation,
        state: OpaqueState,
        token: u16,
        flags: CompletionFlags,
    );
}
