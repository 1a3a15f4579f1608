//! Internal shared plumbing.

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by async payloads, handles, and cleanup callbacks.
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

macro_rules! di_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::debug!($($arg)*);
    }};
}

macro_rules! di_trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::trace!($($arg)*);
    }};
}

macro_rules! di_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::warn!($($arg)*);
        #[cfg(not(feature = "logging"))]
        {
            // Drop-with-pending-cleanup warnings still surface without the
            // logging feature.
            eprintln!("[diwire] {}", format_args!($($arg)*));
        }
    }};
}

pub(crate) use {di_debug, di_trace, di_warn};
