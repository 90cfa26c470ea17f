//! Pre-completed awaitables.
//!
//! Producers that already know the outcome don't need a full
//! [`CompletionSource`](crate::CompletionSource) cycle; these constructors
//! yield immediately-settled futures with the same `Result` surface.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{BoxError, CompletionError};

/// An already-settled awaitable.
pub struct Ready<T> {
    outcome: Option<Result<T, CompletionError>>,
}

impl<T> Future for Ready<T> {
    type Output = Result<T, CompletionError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = self
            .get_mut()
            .outcome
            .take()
            .expect("Ready polled after completion");
        Poll::Ready(outcome)
    }
}

impl<T> Unpin for Ready<T> {}

/// A completed void awaitable.
pub fn completed() -> Ready<()> {
    from_value(())
}

/// An awaitable already holding `value`.
pub fn from_value<T>(value: T) -> Ready<T> {
    Ready {
        outcome: Some(Ok(value)),
    }
}

/// An awaitable already failed with `error`.
pub fn from_error<T>(error: impl Into<BoxError>) -> Ready<T> {
    Ready {
        outcome: Some(Err(CompletionError::Failed(error.into()))),
    }
}

/// An awaitable already canceled.
pub fn canceled<T>() -> Ready<T> {
    Ready {
        outcome: Some(Err(CompletionError::Canceled)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_is_ok_immediately() {
        assert!(completed().await.is_ok());
        assert_eq!(from_value(5u32).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn canceled_and_failed_carry_their_kind() {
        assert!(canceled::<u32>().await.unwrap_err().is_canceled());
        let error = from_error::<u32>("no route").await.unwrap_err();
        assert!(!error.is_canceled());
        assert_eq!(error.to_string(), "no route");
    }
}
