use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellation handle with an attached cause.
///
/// Wraps a [`CancellationToken`] so that whoever cancels the engine can also
/// record *why* it was cancelled. The first cause wins; later calls still
/// trip the token but do not overwrite it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    cause: Arc<OnceLock<Error>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with a cause. Idempotent.
    pub fn cancel(&self, cause: Error) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// Completes when the handle has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded cause, if any. A cancelled token with no recorded cause
    /// reports a generic cancellation.
    pub fn cause(&self) -> Option<Error> {
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }

        if self.token.is_cancelled() {
            return Some(Error::Other("cancelled".into()));
        }

        None
    }
}
