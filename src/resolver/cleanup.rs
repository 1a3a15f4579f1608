//! LIFO cleanup stack for scope resolvers.

use crate::error::{DiError, DiResult};
use crate::provider::{AsyncTeardown, Teardown};

/// One registered cleanup callback.
pub(crate) enum CleanupCallback {
    Sync(Teardown),
    Async(AsyncTeardown),
}

/// LIFO stack of cleanup callbacks registered during resolution.
///
/// Draining preserves strict LIFO order across sync and async kinds. Errors
/// raised by callbacks are captured; the caller re-raises the first one only
/// when no original error is already in flight.
#[derive(Default)]
pub(crate) struct CleanupBag {
    callbacks: Vec<CleanupCallback>,
}

impl CleanupBag {
    pub(crate) fn push_sync(&mut self, teardown: Teardown) {
        self.callbacks.push(CleanupCallback::Sync(teardown));
    }

    pub(crate) fn push_async(&mut self, teardown: AsyncTeardown) {
        self.callbacks.push(CleanupCallback::Async(teardown));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<CleanupCallback> {
        std::mem::take(&mut self.callbacks)
    }
}

/// Drains callbacks LIFO on the sync path. An async callback cannot run
/// here; it is recorded as an `AsyncDependencyInSyncContext` error and the
/// remaining sync callbacks still run.
pub(crate) fn drain_sync(callbacks: Vec<CleanupCallback>) -> Option<DiError> {
    let mut first_error = None;
    for callback in callbacks.into_iter().rev() {
        let result = match callback {
            CleanupCallback::Sync(teardown) => teardown(),
            CleanupCallback::Async(_) => Err(DiError::async_in_sync(
                "async cleanup callback encountered during sync scope exit; \
                 use aclose() instead",
            )),
        };
        if let Err(error) = result {
            first_error.get_or_insert(error);
        }
    }
    first_error
}

/// Drains callbacks LIFO on the async path, awaiting async teardowns.
pub(crate) async fn drain_async(callbacks: Vec<CleanupCallback>) -> Option<DiError> {
    let mut first_error = None;
    for callback in callbacks.into_iter().rev() {
        let result = match callback {
            CleanupCallback::Sync(teardown) => teardown(),
            CleanupCallback::Async(teardown) => teardown().await,
        };
        if let Err(error) = result {
            first_error.get_or_insert(error);
        }
    }
    first_error
}
