//! Continuation dispatch.
//!
//! A completing producer has to hand the registered continuation to *some*
//! execution context. The options mirror the host runtimes a consumer may be
//! sitting on: run it inline on the completing thread, spawn it onto a Tokio
//! runtime, post it to a [`SynchronizationContext`], or submit it to a
//! [`ContinuationScheduler`]. Contexts and schedulers are ambient: they are
//! installed for a scope with [`with_synchronization_context`] /
//! [`with_scheduler`] and captured at registration time, the same way the
//! runtime handle is captured via `Handle::try_current`.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::Span;

use crate::contract::{Continuation, OpaqueState};

/// A post-style dispatch target: jobs run on whatever thread the context
/// represents (a UI loop, a single-threaded reactor).
pub trait SynchronizationContext: Send + Sync {
    /// Queues `job` for later execution; must not run it inline.
    fn post(&self, job: Box<dyn FnOnce() + Send>);
}

/// A submit-style dispatch target: a custom scheduler that owns its own
/// worker threads or queueing discipline.
pub trait ContinuationScheduler: Send + Sync {
    /// Submits `job` for execution.
    fn schedule(&self, job: Box<dyn FnOnce() + Send>);
}

/// Where a continuation runs, resolved to a concrete action at signal time.
pub(crate) enum SchedulingTarget {
    /// On the completing thread, before the completion method returns.
    Inline,
    /// Spawned onto the runtime that was ambient at registration.
    ThreadPool(Handle),
    /// Posted to the synchronization context captured at registration.
    SynchronizationContext(Arc<dyn SynchronizationContext>),
    /// Submitted to the scheduler captured at registration.
    CustomScheduler(Arc<dyn ContinuationScheduler>),
    /// On whatever runtime is current at dispatch, inline as a last resort.
    ForceDefault,
}

impl fmt::Debug for SchedulingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inline => "Inline",
            Self::ThreadPool(_) => "ThreadPool",
            Self::SynchronizationContext(_) => "SynchronizationContext",
            Self::CustomScheduler(_) => "CustomScheduler",
            Self::ForceDefault => "ForceDefault",
        };
        f.write_str(name)
    }
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Arc<dyn SynchronizationContext>>> =
        const { RefCell::new(None) };
    static CURRENT_SCHEDULER: RefCell<Option<Arc<dyn ContinuationScheduler>>> =
        const { RefCell::new(None) };
}

/// Installs `context` as the ambient synchronization context for the
/// duration of `f` on this thread.
pub fn with_synchronization_context<R>(
    context: Arc<dyn SynchronizationContext>,
    f: impl FnOnce() -> R,
) -> R {
    let previous = CURRENT_CONTEXT.with(|cell| cell.borrow_mut().replace(context));
    let _restore = RestoreContext(previous);
    f()
}

/// Installs `scheduler` as the ambient continuation scheduler for the
/// duration of `f` on this thread.
pub fn with_scheduler<R>(scheduler: Arc<dyn ContinuationScheduler>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_SCHEDULER.with(|cell| cell.borrow_mut().replace(scheduler));
    let _restore = RestoreScheduler(previous);
    f()
}

/// The synchronization context installed on this thread, if any.
pub fn current_synchronization_context() -> Option<Arc<dyn SynchronizationContext>> {
    CURRENT_CONTEXT.with(|cell| cell.borrow().clone())
}

/// The continuation scheduler installed on this thread, if any.
pub fn current_scheduler() -> Option<Arc<dyn ContinuationScheduler>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
}

struct RestoreContext(Option<Arc<dyn SynchronizationContext>>);

impl Drop for RestoreContext {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_CONTEXT.with(|cell| *cell.borrow_mut() = previous);
    }
}

struct RestoreScheduler(Option<Arc<dyn ContinuationScheduler>>);

impl Drop for RestoreScheduler {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Captures the ambient dispatch target, preferring a synchronization
/// context over a custom scheduler. Returns `None` when neither is
/// installed, which means "inline or thread-pool, decided at signal time".
pub(crate) fn capture_ambient_target() -> Option<SchedulingTarget> {
    if let Some(context) = current_synchronization_context() {
        return Some(SchedulingTarget::SynchronizationContext(context));
    }
    if let Some(scheduler) = current_scheduler() {
        return Some(SchedulingTarget::CustomScheduler(scheduler));
    }
    None
}

/// Runs the continuation, re-entering the captured span if one flowed.
fn run(func: Continuation, state: OpaqueState, span: Option<Span>) {
    match span {
        Some(span) => span.in_scope(|| func(state)),
        None => func(state),
    }
}

/// Hands the continuation to its target.
pub(crate) fn execute(
    target: SchedulingTarget,
    func: Continuation,
    state: OpaqueState,
    span: Option<Span>,
) {
    tracing::trace!(?target, "dispatching continuation");
    match target {
        SchedulingTarget::Inline => run(func, state, span),
        SchedulingTarget::ThreadPool(handle) => {
            handle.spawn(async move { run(func, state, span) });
        }
        SchedulingTarget::SynchronizationContext(context) => {
            context.post(Box::new(move || run(func, state, span)));
        }
        SchedulingTarget::CustomScheduler(scheduler) => {
            scheduler.schedule(Box::new(move || run(func, state, span)));
        }
        SchedulingTarget::ForceDefault => match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { run(func, state, span) });
            }
            Err(_) => run(func, state, span),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingContext {
        jobs: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl RecordingContext {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
            })
        }

        fn run_all(&self) -> usize {
            let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
            let count = jobs.len();
            for job in jobs {
                job();
            }
            count
        }
    }

    impl SynchronizationContext for RecordingContext {
        fn post(&self, job: Box<dyn FnOnce() + Send>) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    struct RecordingScheduler;

    impl ContinuationScheduler for RecordingScheduler {
        fn schedule(&self, job: Box<dyn FnOnce() + Send>) {
            job();
        }
    }

    #[test]
    fn ambient_context_is_scoped() {
        assert!(current_synchronization_context().is_none());
        let context = RecordingContext::new();
        with_synchronization_context(context, || {
            assert!(current_synchronization_context().is_some());
        });
        assert!(current_synchronization_context().is_none());
    }

    #[test]
    fn ambient_scopes_nest_and_restore() {
        let outer = RecordingContext::new();
        let inner = RecordingContext::new();
        with_synchronization_context(outer.clone(), || {
            with_synchronization_context(inner.clone(), || {
                current_synchronization_context()
                    .unwrap()
                    .post(Box::new(|| {}));
            });
            assert!(current_synchronization_context().is_some());
        });
        assert!(current_synchronization_context().is_none());
        // The innermost scope received the post, the outer one did not.
        assert_eq!(inner.run_all(), 1);
        assert_eq!(outer.run_all(), 0);
    }

    #[test]
    fn capture_prefers_context_over_scheduler() {
        let context = RecordingContext::new();
        with_synchronization_context(context, || {
            with_scheduler(Arc::new(RecordingScheduler), || {
                let target = capture_ambient_target();
                assert!(matches!(
                    target,
                    Some(SchedulingTarget::SynchronizationContext(_))
                ));
            });
        });
    }

    #[test]
    fn capture_falls_back_to_scheduler() {
        with_scheduler(Arc::new(RecordingScheduler), || {
            let target = capture_ambient_target();
            assert!(matches!(target, Some(SchedulingTarget::CustomScheduler(_))));
        });
        assert!(capture_ambient_target().is_none());
    }

    #[test]
    fn inline_execution_runs_before_returning() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn bump(_state: OpaqueState) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        execute(SchedulingTarget::Inline, bump, OpaqueState::none(), None);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn posted_jobs_wait_for_the_context() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn bump(_state: OpaqueState) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        let context = RecordingContext::new();
        execute(
            SchedulingTarget::SynchronizationContext(context.clone()),
            bump,
            OpaqueState::none(),
            None,
        );
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
        assert_eq!(context.run_all(), 1);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }
}
