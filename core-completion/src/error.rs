//! Error taxonomy for the completion primitive.
//!
//! Only one error kind ever reaches the consumer: [`CompletionError`],
//! returned from `get_result`. The producer's original error is carried
//! through unwrapped so its message and source chain survive verbatim.
//! Contract violations (stale token, double completion, double registration)
//! are panics, not errors; see the crate docs.

use thiserror::Error;

use crate::contract::CompletionStatus;

/// Boxed error payload accepted by `set_exception`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome error surfaced to the consumer by `get_result`.
#[derive(Error, Debug)]
pub enum CompletionError {
    /// The cycle was completed by `set_canceled` (or the cancellation
    /// bridge).
    #[error("operation was canceled")]
    Canceled,

    /// The cycle was completed by `set_exception`; the original error is
    /// re-raised as-is.
    #[error("{0}")]
    Failed(#[source] BoxError),
}

impl CompletionError {
    /// True for the cancellation kind.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Stored classification of a completed-with-error cycle.
///
/// Cancellation is a sub-case of failure with its own tag rather than a
/// separate storage slot, so `get_status` can report `Canceled` vs `Faulted`
/// without inspecting the payload.
#[derive(Debug)]
pub(crate) enum CapturedError {
    Canceled,
    Failed(BoxError),
}

impl CapturedError {
    pub(crate) fn status(&self) -> CompletionStatus {
        match self {
            Self::Canceled => CompletionStatus::Canceled,
            Self::Failed(_) => CompletionStatus::Faulted,
        }
    }
}

impl From<CapturedError> for CompletionError {
    fn from(captured: CapturedError) -> Self {
        match captured {
            CapturedError::Canceled => Self::Canceled,
            CapturedError::Failed(error) => Self::Failed(error),
        }
    }
}
