//! Shared helpers for integration tests

use std::future::Future;
use std::time::Duration;

/// Default timeout for async test operations.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a future with a timeout, panicking with a readable message if it
/// does not complete in time.
pub async fn with_timeout<F, T>(name: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(DEFAULT_TEST_TIMEOUT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("'{}' timed out after {:?}", name, DEFAULT_TEST_TIMEOUT),
    }
}
