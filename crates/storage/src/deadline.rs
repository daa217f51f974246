//! Deadlines for storage calls.
//!
//! Dropping a future cancels it; these helpers attach a deadline so that an
//! expired call surfaces as [`Cancelled`](ErrorKind::Cancelled) instead of
//! hanging or looking like an outage.

use crate::error::{ErrorKind, Result};
use std::future::Future;
use std::time::Duration;

/// Run `fut`, failing with [`ErrorKind::Cancelled`] if it has not finished
/// within `timeout`.
pub async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_elapsed) => exn::bail!(ErrorKind::Cancelled),
    }
}
