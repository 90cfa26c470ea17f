//! The public completion-source handle.
//!
//! [`CompletionSource`] is the face of the primitive: producers call one of
//! the `set_*` methods exactly once per cycle, the consumer awaits
//! [`await_value`](CompletionSource::await_value) /
//! [`await_void`](CompletionSource::await_void) (or drives the
//! [`AwaitableSource`] contract by hand), and after consumption the same
//! source is reused for the next cycle without reallocation.
//!
//! Clones share one cycle. The supported concurrency mode is exactly one
//! producer and one consumer per cycle; pointing multiple concurrent
//! consumers at one cycle is undefined usage, not a feature.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::task::{Context, Poll, Waker};

use tokio_util::sync::CancellationToken;

use crate::cancellation::CancellationRegistration;
use crate::contract::{AwaitableSource, CompletionFlags, CompletionStatus, Continuation, OpaqueState};
use crate::error::{BoxError, CapturedError, CompletionError};
use crate::logic::{CompletionLogic, CycleConfig};

/// Version-agnostic dispatch configuration for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuationOptions {
    /// Honor captured contexts and the `run_continuations_asynchronously`
    /// flag.
    #[default]
    None,
    /// Ignore any captured context and always dispatch continuations to the
    /// default pool. Use when re-entrancy into an arbitrary custom scheduler
    /// must be ruled out.
    ForceDefaultScheduler,
}

struct Inner<T> {
    /// Producer gate serializing the three completion entry points.
    gate: Mutex<()>,
    run_continuations_asynchronously: AtomicBool,
    options: ContinuationOptions,
    logic: CompletionLogic<T>,
}

/// A reusable, single-awaiter completion source.
///
/// # Examples
///
/// ```
/// use core_completion::CompletionSource;
///
/// async fn example() {
///     let source = CompletionSource::<u32>::default();
///
///     let pending = source.await_value(None);
///     assert!(source.set_result(42));
///     assert_eq!(pending.await.unwrap(), 42);
///
///     // Consumption reset the source; the next cycle is independent.
///     let pending = source.await_value(None);
///     assert!(source.set_result(7));
///     assert_eq!(pending.await.unwrap(), 7);
/// }
/// ```
pub struct CompletionSource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompletionSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for CompletionSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSource")
            .field("version", &self.inner.logic.version())
            .field("completed", &self.inner.logic.is_completed())
            .finish()
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new(ContinuationOptions::None)
    }
}

impl<T> CompletionSource<T> {
    /// Creates a fresh source at version 0.
    pub fn new(options: ContinuationOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(()),
                run_continuations_asynchronously: AtomicBool::new(true),
                options,
                logic: CompletionLogic::new(),
            }),
        }
    }

    /// The current cycle version, for diagnostics and tests.
    pub fn version(&self) -> u16 {
        self.inner.logic.version()
    }

    /// Whether completing dispatches continuations asynchronously (the
    /// default) instead of invoking them on the completing thread.
    pub fn run_continuations_asynchronously(&self) -> bool {
        self.inner
            .run_continuations_asynchronously
            .load(Ordering::Relaxed)
    }

    /// Sets the asynchronous-dispatch flag. Applies from the next signal.
    pub fn set_run_continuations_asynchronously(&self, value: bool) {
        self.inner
            .run_continuations_asynchronously
            .store(value, Ordering::Relaxed);
    }

    /// Starts the next cycle by hand.
    ///
    /// `get_result` already resets on consumption; call this only for a
    /// cycle that was completed but never consumed, and only once no
    /// consumer still holds a prior-version awaitable.
    pub fn reset(&self) {
        self.inner.logic.reset();
    }

    fn config(&self) -> CycleConfig {
        CycleConfig {
            run_continuations_asynchronously: self.run_continuations_asynchronously(),
            force_default_scheduler: matches!(
                self.inner.options,
                ContinuationOptions::ForceDefaultScheduler
            ),
        }
    }

    /// Completes the cycle with a value.
    ///
    /// Returns `false` without side effects when the cycle is already
    /// completed; at most one caller observes `true` per cycle. May invoke
    /// the registered continuation synchronously on this thread when
    /// `run_continuations_asynchronously` is off.
    pub fn set_result(&self, value: T) -> bool {
        let _guard = self
            .inner
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.logic.is_completed() {
            return false;
        }
        self.inner.logic.set_result(value, self.config());
        true
    }

    /// Completes the cycle with an error, best-effort.
    ///
    /// Uses try-lock semantics on the producer gate so it can never block;
    /// this is the path the cancellation bridge takes from arbitrary
    /// threads. A no-op when the cycle is already completed *or* when the
    /// gate is momentarily held: an error racing a slow `set_result` may be
    /// dropped silently even though the result has not committed yet. That
    /// asymmetry is deliberate and documented behavior.
    pub fn set_exception(&self, error: impl Into<BoxError>) {
        self.try_complete_with_error(CapturedError::Failed(error.into()), None);
    }

    /// Completes the cycle with the cancellation-kind error, best-effort.
    ///
    /// Same no-op-under-contention semantics as
    /// [`set_exception`](Self::set_exception).
    pub fn set_canceled(&self) {
        self.try_complete_with_error(CapturedError::Canceled, None);
    }

    fn try_complete_with_error(&self, error: CapturedError, bound_version: Option<u16>) {
        let _guard = match self.inner.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if self.inner.logic.is_completed() {
            return;
        }
        // A version-bound caller (the cancellation bridge) must not complete
        // a cycle recycled after it registered. Reset bumps the version
        // before clearing `completed`, so an uncompleted cycle observed here
        // guarantees the version load below is current.
        if bound_version.is_some_and(|version| self.inner.logic.version() != version) {
            return;
        }
        self.inner.logic.set_error(error, self.config());
    }
}

impl<T: Send + 'static> CompletionSource<T> {
    /// Obtains the awaitable for the current cycle's value.
    ///
    /// When a cancellation token is supplied, a bridge is registered that
    /// completes the cycle as canceled if the token fires first; the bridge
    /// is disposed on reset. Registering the bridge spawns a task and
    /// therefore requires an ambient Tokio runtime; without a token the
    /// awaitable works on any executor.
    ///
    /// The returned awaitable is bound to the current version. Holding it
    /// across a reset performed behind its back is undefined usage; the
    /// version check will panic on the next poll.
    pub fn await_value(&self, cancellation: Option<CancellationToken>) -> ValueAwaitable<T> {
        self.register_cancellation(cancellation);
        ValueAwaitable {
            source: self.clone(),
            token: self.version(),
            registered: false,
        }
    }

    /// Like [`await_value`](Self::await_value) but the awaitable discards
    /// the value, yielding only completion/error.
    pub fn await_void(&self, cancellation: Option<CancellationToken>) -> VoidAwaitable<T> {
        self.register_cancellation(cancellation);
        VoidAwaitable {
            source: self.clone(),
            token: self.version(),
            registered: false,
        }
    }

    fn register_cancellation(&self, cancellation: Option<CancellationToken>) {
        let registration = cancellation.map(|token| {
            let source = self.clone();
            // Aborting the bridge task on reset cannot stop a callback whose
            // final poll already passed the await, so the callback is bound
            // to this cycle's version and re-validated under the gate.
            let version = self.version();
            CancellationRegistration::register(token, move || {
                source.try_complete_with_error(CapturedError::Canceled, Some(version));
            })
        });
        self.inner.logic.set_registration(registration);
    }
}

impl<T> AwaitableSource for CompletionSource<T> {
    type Output = T;

    fn get_status(&self, token: u16) -> CompletionStatus {
        self.inner.logic.get_status(token)
    }

    fn get_result(&self, token: u16) -> Result<T, CompletionError> {
        self.inner.logic.get_result(token)
    }

    fn on_completed(
        &self,
        continuation: Continuation,
        state: OpaqueState,
        token: u16,
        flags: CompletionFlags,
    ) {
        self.inner.logic.on_completed(continuation, state, token, flags);
    }
}

/// Continuation used by the awaitable adapters: wake the registered waker.
fn wake_by_state(state: OpaqueState) {
    if let Some(waker) = state.downcast_ref::<Waker>() {
        waker.wake_by_ref();
    }
}

const AWAIT_FLAGS: CompletionFlags = CompletionFlags::FLOW_CONTEXT
    .union(CompletionFlags::USE_SCHEDULING_CONTEXT);

/// Future over one cycle of a [`CompletionSource`], yielding the value.
///
/// Single-awaiter contract: the waker is registered on the first pending
/// poll and not replaced afterwards, so the task that first polls must be
/// the one that consumes. Polling again after the result was returned
/// panics (stale token).
pub struct ValueAwaitable<T> {
    source: CompletionSource<T>,
    token: u16,
    registered: bool,
}

impl<T: Send + 'static> Future for ValueAwaitable<T> {
    type Output = Result<T, CompletionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.source.get_status(this.token) {
            CompletionStatus::Pending => {
                if !this.registered {
                    this.source.on_completed(
                        wake_by_state,
                        OpaqueState::new(cx.waker().clone()),
                        this.token,
                        AWAIT_FLAGS,
                    );
                    this.registered = true;
                }
                Poll::Pending
            }
            _ => Poll::Ready(this.source.get_result(this.token)),
        }
    }
}

/// Future over one cycle of a [`CompletionSource`], discarding the value.
pub struct VoidAwaitable<T> {
    source: CompletionSource<T>,
    token: u16,
    registered: bool,
}

impl<T: Send + 'static> Future for VoidAwaitable<T> {
    type Output = Result<(), CompletionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.source.get_status(this.token) {
            CompletionStatus::Pending => {
                if !this.registered {
                    this.source.on_completed(
                        wake_by_state,
                        OpaqueState::new(cx.waker().clone()),
                        this.token,
                        AWAIT_FLAGS,
                    );
                    this.registered = true;
                }
                Poll::Pending
            }
            _ => Poll::Ready(this.source.get_result(this.token).map(|_| ())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_result_reports_the_first_completion_only() {
        let source = CompletionSource::<u32>::default();
        assert!(source.set_result(1));
        assert!(!source.set_result(2));
    }

    #[test]
    fn set_exception_after_completion_is_a_no_op() {
        let source = CompletionSource::<u32>::default();
        assert!(source.set_result(1));
        source.set_exception("too late");
        assert_eq!(source.get_status(source.version()), CompletionStatus::Succeeded);
        assert_eq!(source.get_result(source.version()).unwrap(), 1);
    }

    #[test]
    fn cancellation_is_classified_apart_from_faults() {
        let source = CompletionSource::<u32>::default();
        source.set_canceled();
        assert_eq!(source.get_status(source.version()), CompletionStatus::Canceled);
        assert!(source.get_result(source.version()).unwrap_err().is_canceled());

        source.set_exception("broken");
        assert_eq!(source.get_status(source.version()), CompletionStatus::Faulted);
    }

    #[test]
    fn synchronous_dispatch_runs_on_the_completing_thread() {
        let source = CompletionSource::<u32>::default();
        source.set_run_continuations_asynchronously(false);
        let token = source.version();

        fn record(state: OpaqueState) {
            let cell = state
                .downcast_ref::<Mutex<Option<std::thread::ThreadId>>>()
                .expect("thread cell");
            *cell.lock().unwrap() = Some(std::thread::current().id());
        }

        let state = OpaqueState::new(Mutex::<Option<std::thread::ThreadId>>::new(None));
        source.on_completed(record, state.clone(), token, CompletionFlags::empty());

        assert!(source.set_result(42));
        // set_result returned, so the continuation already ran, inline.
        let recorded = state
            .downcast_ref::<Mutex<Option<std::thread::ThreadId>>>()
            .unwrap()
            .lock()
            .unwrap()
            .expect("continuation did not run synchronously");
        assert_eq!(recorded, std::thread::current().id());
        assert_eq!(source.get_result(token).unwrap(), 42);
    }

    #[test]
    fn version_bound_cancellation_cannot_complete_a_recycled_cycle() {
        let source = CompletionSource::<u32>::default();
        let stale = source.version();
        assert!(source.set_result(1));
        assert_eq!(source.get_result(stale).unwrap(), 1);

        // A bridge callback registered against the consumed cycle fires
        // after consumption recycled the source. It must not touch the new
        // cycle.
        source.try_complete_with_error(CapturedError::Canceled, Some(stale));
        assert_eq!(source.get_status(source.version()), CompletionStatus::Pending);

        // Bound to the live cycle, the same path still cancels.
        source.try_complete_with_error(CapturedError::Canceled, Some(source.version()));
        assert_eq!(source.get_status(source.version()), CompletionStatus::Canceled);
    }

    #[test]
    fn awaitable_polls_to_completion_without_a_runtime() {
        use futures::task::noop_waker;

        let source = CompletionSource::<u32>::default();
        source.set_run_continuations_asynchronously(false);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut pending = source.await_value(None);
        assert!(Pin::new(&mut pending).poll(&mut cx).is_pending());

        assert!(source.set_result(6));
        match Pin::new(&mut pending).poll(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 6),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
    }

    #[test]
    fn version_survives_wraparound_semantics() {
        let source = CompletionSource::<u8>::default();
        let first = source.version();
        assert!(source.set_result(1));
        let _ = source.get_result(first);
        assert_eq!(source.version(), first.wrapping_add(1));
    }

    #[test]
    fn reset_without_consumption_discards_the_outcome() {
        let source = CompletionSource::<u32>::default();
        assert!(source.set_result(9));
        source.reset();
        assert!(!source.inner.logic.is_completed());
        assert!(source.set_result(10));
    }

    #[test]
    fn continuation_state_reaches_the_callback_unchanged() {
        let source = CompletionSource::<u32>::default();
        source.set_run_continuations_asynchronously(false);
        let token = source.version();

        fn add_ten(state: OpaqueState) {
            state
                .downcast_ref::<AtomicUsize>()
                .expect("counter state")
                .fetch_add(10, Ordering::SeqCst);
        }

        let state = OpaqueState::new(AtomicUsize::new(3));
        source.on_completed(add_ten, state.clone(), token, CompletionFlags::empty());
        assert!(source.set_result(0));
        assert_eq!(
            state.downcast_ref::<AtomicUsize>().unwrap().load(Ordering::SeqCst),
            13
        );
    }
}
