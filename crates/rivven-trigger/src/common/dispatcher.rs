//! Handler dispatch
//!
//! The dispatcher calls the registered [`ChangeHandler`] once per batch and
//! classifies how the call ended. It never touches lease state.
//!
//! | Handler outcome | Classification |
//! |-----------------|----------------|
//! | `Ok(())` | success |
//! | `Err(HandlerError::retryable(..))` | retryable failure |
//! | `Err(HandlerError::permanent(..))` | non-retryable failure |
//! | exceeded the handler timeout | retryable failure |
//! | panicked | non-retryable failure |

use crate::common::{ChangeBatch, TriggerError};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error returned by a handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    retryable: bool,
    message: String,
}

impl HandlerError {
    /// A transient failure; the same batch will be offered again.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A failure that retrying cannot fix (bad data, failed validation).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<TriggerError> for HandlerError {
    fn from(err: TriggerError) -> Self {
        Self {
            retryable: err.is_retriable(),
            message: err.to_string(),
        }
    }
}

impl From<HandlerError> for TriggerError {
    fn from(err: HandlerError) -> Self {
        TriggerError::handler(err.retryable, err.message)
    }
}

/// Receives ordered change batches
///
/// Delivery is at-least-once: after a lease handoff, changes already seen may
/// arrive again.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, batch: &ChangeBatch) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<H: ChangeHandler + ?Sized> ChangeHandler for Arc<H> {
    async fn handle(&self, batch: &ChangeBatch) -> std::result::Result<(), HandlerError> {
        (**self).handle(batch).await
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`ChangeHandler`].
///
/// The closure receives its own copy of the batch.
///
/// ```rust
/// use rivven_trigger::common::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|batch| async move {
///     if batch.is_empty() {
///         return Err(HandlerError::permanent("empty batch"));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ChangeBatch) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ChangeHandler for FnHandler<F>
where
    F: Fn(ChangeBatch) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, batch: &ChangeBatch) -> std::result::Result<(), HandlerError> {
        (self.f)(batch.clone()).await
    }
}

/// How one dispatch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    HandlerFailure { retryable: bool, message: String },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Invokes the handler for each batch
#[derive(Clone)]
pub struct ChangeDispatcher {
    handler: Arc<dyn ChangeHandler>,
    timeout: Duration,
}

impl ChangeDispatcher {
    pub fn new(handler: Arc<dyn ChangeHandler>, timeout: Duration) -> Self {
        Self { handler, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deliver one batch.
    pub async fn dispatch(&self, batch: &ChangeBatch) -> DispatchOutcome {
        let call = AssertUnwindSafe(self.handler.handle(batch)).catch_unwind();

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(()))) => {
                debug!(
                    "Handler accepted {} changes for {}",
                    batch.len(),
                    batch.partition
                );
                DispatchOutcome::Success
            }
            Ok(Ok(Err(e))) => {
                warn!(
                    "Handler failed for {} (retryable: {}): {}",
                    batch.partition,
                    e.is_retryable(),
                    e
                );
                DispatchOutcome::HandlerFailure {
                    retryable: e.retryable,
                    message: e.message,
                }
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!("Handler panicked for {}: {}", batch.partition, message);
                DispatchOutcome::HandlerFailure {
                    retryable: false,
                    message: format!("handler panicked: {}", message),
                }
            }
            Err(_) => {
                warn!(
                    "Handler for {} exceeded {:?}, cancelling",
                    batch.partition, self.timeout
                );
                DispatchOutcome::HandlerFailure {
                    retryable: true,
                    message: format!("handler timed out after {:?}", self.timeout),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ChangeOperation, ChangeRecord, PartitionKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn batch(n: i64) -> ChangeBatch {
        ChangeBatch {
            partition: PartitionKey::new("dbo.T", "g"),
            changes: (1..=n)
                .map(|v| ChangeRecord {
                    operation: ChangeOperation::Insert,
                    version: v,
                    payload: serde_json::json!({"Id": v}),
                    primary_key: vec![serde_json::json!(v)],
                })
                .collect(),
            bound_version: n,
        }
    }

    fn dispatcher(handler: impl ChangeHandler + 'static) -> ChangeDispatcher {
        ChangeDispatcher::new(Arc::new(handler), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_success_calls_once_per_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let d = dispatcher(handler_fn(move |batch| {
            let seen = seen.clone();
            async move {
                assert_eq!(batch.len(), 3);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        assert!(d.dispatch(&batch(3)).await.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let d = dispatcher(handler_fn(|_| async {
            Err(HandlerError::retryable("deadlock victim"))
        }));
        assert_eq!(
            d.dispatch(&batch(1)).await,
            DispatchOutcome::HandlerFailure {
                retryable: true,
                message: "deadlock victim".into()
            }
        );

        let d = dispatcher(handler_fn(|_| async {
            Err(HandlerError::permanent("bad row"))
        }));
        assert_eq!(
            d.dispatch(&batch(1)).await,
            DispatchOutcome::HandlerFailure {
                retryable: false,
                message: "bad row".into()
            }
        );
    }

    #[tokio::test]
    async fn test_panic_is_not_retryable() {
        struct Panicking;

        #[async_trait]
        impl ChangeHandler for Panicking {
            async fn handle(&self, _: &ChangeBatch) -> std::result::Result<(), HandlerError> {
                panic!("assertion failed");
            }
        }

        match dispatcher(Panicking).dispatch(&batch(1)).await {
            DispatchOutcome::HandlerFailure { retryable, message } => {
                assert!(!retryable);
                assert!(message.contains("assertion failed"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let d = ChangeDispatcher::new(
            Arc::new(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })),
            Duration::from_secs(1),
        );

        match d.dispatch(&batch(1)).await {
            DispatchOutcome::HandlerFailure { retryable, message } => {
                assert!(retryable);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_error_conversions() {
        let err: HandlerError = TriggerError::source_unavailable("x").into();
        assert!(err.is_retryable());

        let err: TriggerError = HandlerError::permanent("bad").into();
        assert!(matches!(
            err,
            TriggerError::Handler {
                retryable: false,
                ..
            }
        ));
    }
}
