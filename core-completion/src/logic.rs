//! The per-cycle completion state machine.
//!
//! One `CompletionLogic` carries every mutable field of a cycle: the version
//! counter, the result/error slots, the continuation slot, and the captured
//! dispatch context. The continuation slot is the synchronization crux: a
//! tri-state atomic (`EMPTY` / `INSTALLED` / `SIGNALED`) exchanged exactly
//! once by each side, which makes registration-before-completion and
//! completion-before-registration both race-free without a lock on the hot
//! path:
//!
//! - the consumer writes the continuation cell, then tries `EMPTY ->
//!   INSTALLED`; observing `SIGNALED` instead means completion raced ahead
//!   and the consumer dispatches its own continuation;
//! - the producer stores the payload, flips `completed`, then swaps the slot
//!   to `SIGNALED`; observing `INSTALLED` means a continuation is waiting
//!   and the producer dispatches it.
//!
//! Everything else rides on the documented single-producer/single-consumer
//! contract plus the Release/Acquire pairing on `completed`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use tokio::runtime::Handle;
use tracing::Span;

use crate::cancellation::CancellationRegistration;
use crate::contract::{CompletionFlags, CompletionStatus, Continuation, OpaqueState};
use crate::dispatch::{self, SchedulingTarget};
use crate::error::{CapturedError, CompletionError};

// Continuation slot states.
const EMPTY: u8 = 0;
const INSTALLED: u8 = 1;
const SIGNALED: u8 = 2;

/// Source-side configuration the state machine reads at signal time.
///
/// Passed by value so the logic never holds a back-reference into its owner.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CycleConfig {
    pub(crate) run_continuations_asynchronously: bool,
    pub(crate) force_default_scheduler: bool,
}

/// The registered consumer callback and its opaque state.
pub(crate) struct ContinuationSlot {
    pub(crate) func: Continuation,
    pub(crate) state: OpaqueState,
}

/// State machine for a single completion cycle, reusable across resets.
pub(crate) struct CompletionLogic<T> {
    version: AtomicU16,
    completed: AtomicBool,
    slot_state: AtomicU8,
    result: UnsafeCell<Option<T>>,
    error: UnsafeCell<Option<CapturedError>>,
    continuation: UnsafeCell<Option<ContinuationSlot>>,
    target: UnsafeCell<Option<SchedulingTarget>>,
    span: UnsafeCell<Option<Span>>,
    pool: UnsafeCell<Option<Handle>>,
    registration: UnsafeCell<Option<CancellationRegistration>>,
}

// SAFETY: cell access is gated by the slot-state handshake and the
// `completed` flag. The producer writes `result`/`error` before the Release
// flip of `completed`; the consumer reads them only after an Acquire load
// observes it. The continuation/target/span/pool cells belong to the
// consumer until the slot exchange hands them to exactly one side. The
// registration cell is consumer/owner-only per the one-producer/one-consumer
// contract.
unsafe impl<T: Send> Send for CompletionLogic<T> {}
unsafe impl<T: Send> Sync for CompletionLogic<T> {}

impl<T> CompletionLogic<T> {
    pub(crate) fn new() -> Self {
        Self {
            version: AtomicU16::new(0),
            completed: AtomicBool::new(false),
            slot_state: AtomicU8::new(EMPTY),
            result: UnsafeCell::new(None),
            error: UnsafeCell::new(None),
            continuation: UnsafeCell::new(None),
            target: UnsafeCell::new(None),
            span: UnsafeCell::new(None),
            pool: UnsafeCell::new(None),
            registration: UnsafeCell::new(None),
        }
    }

    /// Current cycle version; the token all contract calls must present.
    pub(crate) fn version(&self) -> u16 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn validate_token(&self, token: u16) {
        let version = self.version();
        if token != version {
            panic!(
                "completion token {token} does not match current version {version}; \
                 the awaitable outlived a reset"
            );
        }
    }

    pub(crate) fn get_status(&self, token: u16) -> CompletionStatus {
        self.validate_token(token);

        if !self.is_completed() {
            return CompletionStatus::Pending;
        }
        // SAFETY: completed was observed with Acquire, so the producer's
        // error write is visible and the producer no longer touches it.
        match unsafe { &*self.error.get() } {
            None => CompletionStatus::Succeeded,
            Some(error) => error.status(),
        }
    }

    /// Consumes the outcome and recycles the cycle.
    pub(crate) fn get_result(&self, token: u16) -> Result<T, CompletionError> {
        self.validate_token(token);

        if !self.is_completed() {
            panic!("completion result requested before the cycle completed");
        }

        // SAFETY: as in get_status; consumption is exclusive to the single
        // consumer.
        let value = unsafe { (*self.result.get()).take() };
        let error = unsafe { (*self.error.get()).take() };
        self.reset();

        match (error, value) {
            (Some(error), _) => Err(error.into()),
            (None, Some(value)) => Ok(value),
            (None, None) => unreachable!("completed cycle holds neither result nor error"),
        }
    }

    /// Starts the next cycle: bumps the version (wrapping), disposes any
    /// cancellation registration, and clears every per-cycle field.
    ///
    /// Only the consumer (via `get_result`) or the owning source may call
    /// this, and only once no prior-version awaitable is still live.
    pub(crate) fn reset(&self) {
        let version = self.version.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        // SAFETY: reset runs after consumption (or while idle); neither side
        // of the handshake touches the cells at this point.
        unsafe {
            (*self.registration.get()).take();
            (*self.result.get()).take();
            (*self.error.get()).take();
            (*self.continuation.get()).take();
            (*self.target.get()).take();
            (*self.span.get()).take();
            (*self.pool.get()).take();
        }

        self.completed.store(false, Ordering::Release);
        self.slot_state.store(EMPTY, Ordering::Release);
        tracing::trace!(version, "cycle reset");
    }

    /// Stores the cancellation bridge for the current cycle. A replaced
    /// registration is dropped, which unregisters it.
    pub(crate) fn set_registration(&self, registration: Option<CancellationRegistration>) {
        // SAFETY: consumer-side call per contract; the bridge task never
        // touches this cell.
        unsafe {
            *self.registration.get() = registration;
        }
    }

    pub(crate) fn on_completed(
        &self,
        continuation: Continuation,
        state: OpaqueState,
        token: u16,
        flags: CompletionFlags,
    ) {
        self.validate_token(token);

        // Catch double registration before touching the cells; the slot may
        // already belong to the producer.
        if self.slot_state.load(Ordering::Acquire) == INSTALLED {
            panic!("a continuation is already installed for this cycle");
        }

        // SAFETY: these cells belong to the consumer until the slot exchange
        // below publishes them; the producer reads them only after observing
        // INSTALLED.
        unsafe {
            if flags.contains(CompletionFlags::FLOW_CONTEXT) {
                *self.span.get() = Some(Span::current());
            }
            if flags.contains(CompletionFlags::USE_SCHEDULING_CONTEXT) {
                *self.target.get() = dispatch::capture_ambient_target();
            }
            *self.pool.get() = Handle::try_current().ok();
            *self.continuation.get() = Some(ContinuationSlot {
                func: continuation,
                state,
            });
        }

        match self
            .slot_state
            .compare_exchange(EMPTY, INSTALLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::trace!(version = token, "continuation installed");
            }
            Err(SIGNALED) => {
                // Completion raced ahead of registration; nothing else will
                // fire this continuation, so dispatch it now. The producer
                // observed EMPTY, so the cells are still ours. The captured
                // span does not flow on this path (completion already
                // happened on another thread).
                let (slot, target, pool) = unsafe {
                    let _ = (*self.span.get()).take();
                    (
                        (*self.continuation.get()).take(),
                        (*self.target.get()).take(),
                        (*self.pool.get()).take(),
                    )
                };
                let slot = slot.unwrap_or_else(|| {
                    unreachable!("continuation slot emptied while signaled")
                });
                let target = target.unwrap_or(match pool {
                    Some(handle) => SchedulingTarget::ThreadPool(handle),
                    None => SchedulingTarget::ForceDefault,
                });
                tracing::trace!(version = token, "completion preceded registration");
                dispatch::execute(target, slot.func, slot.state, None);
            }
            Err(INSTALLED) => {
                panic!("a continuation is already installed for this cycle");
            }
            Err(state) => unreachable!("continuation slot in unknown state {state}"),
        }
    }

    pub(crate) fn set_result(&self, value: T, config: CycleConfig) {
        // SAFETY: producer-exclusive until the completed flip publishes it.
        unsafe {
            *self.result.get() = Some(value);
        }
        self.signal_completion(config);
    }

    pub(crate) fn set_error(&self, error: CapturedError, config: CycleConfig) {
        // SAFETY: as in set_result.
        unsafe {
            *self.error.get() = Some(error);
        }
        self.signal_completion(config);
    }

    fn signal_completion(&self, config: CycleConfig) {
        if self.completed.swap(true, Ordering::AcqRel) {
            panic!("double completion of completion source is prohibited");
        }
        tracing::trace!(version = self.version(), "cycle completed");

        match self.slot_state.swap(SIGNALED, Ordering::AcqRel) {
            EMPTY => {
                // No continuation yet; a late on_completed will see SIGNALED
                // and dispatch itself.
            }
            INSTALLED => self.invoke_continuation(config),
            state => unreachable!("continuation slot in unknown state {state} at signal"),
        }
    }

    /// Dispatches the installed continuation according to the captured
    /// target and the source configuration.
    fn invoke_continuation(&self, config: CycleConfig) {
        // SAFETY: the swap observed INSTALLED, which transfers the cells to
        // the producer. Everything is taken out before dispatch so a
        // consumer woken by the continuation can reset concurrently.
        let (slot, target, span, pool) = unsafe {
            (
                (*self.continuation.get()).take(),
                (*self.target.get()).take(),
                (*self.span.get()).take(),
                (*self.pool.get()).take(),
            )
        };
        let slot =
            slot.unwrap_or_else(|| unreachable!("continuation slot emptied while installed"));

        let pool_or_default = |pool: Option<Handle>| match pool {
            Some(handle) => SchedulingTarget::ThreadPool(handle),
            None => SchedulingTarget::ForceDefault,
        };

        let target = if config.force_default_scheduler {
            // Overrides any captured context: the caller must be guaranteed
            // re-entrancy into an arbitrary scheduler cannot happen.
            pool_or_default(pool)
        } else {
            match target {
                Some(target) => target,
                None if config.run_continuations_asynchronously => pool_or_default(pool),
                None => SchedulingTarget::Inline,
            }
        };

        dispatch::execute(target, slot.func, slot.state, span);
    }
}
