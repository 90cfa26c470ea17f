//! Bridge from an external cancellation signal to a completion cycle.
//!
//! A [`CancellationToken`] has no callback registry, so the bridge is a small
//! spawned task: it awaits the token and then invokes the callback (which
//! completes the owning source as canceled). The registration handle aborts
//! that task when dropped. Abort cannot stop a callback whose final poll has
//! already passed the await, so the owning source additionally binds each
//! callback to the cycle version it was registered against and re-validates
//! that version before completing.

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Disposable link between one [`CancellationToken`] and one completion
/// cycle. Dropping it unregisters the bridge.
pub(crate) struct CancellationRegistration {
    handle: AbortHandle,
}

impl CancellationRegistration {
    /// Spawns the bridge task.
    ///
    /// Requires an ambient Tokio runtime; `await_value` / `await_void` only
    /// call this when the caller supplied a token.
    ///
    /// The callback may race the producer's own completion or a reset; the
    /// caller is responsible for making the callback a no-op in both cases.
    pub(crate) fn register(token: CancellationToken, callback: impl FnOnce() + Send + 'static) -> Self {
        let task = tokio::spawn(async move {
            token.cancelled_owned().await;
            tracing::trace!("cancellation signal observed, completing cycle as canceled");
            callback();
        });
        Self {
            handle: task.abort_handle(),
        }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
