//! Comma-separated endpoint lists with first-success fallback.
//!
//! Broker and console URLs are configured as ordered, comma-separated
//! lists. Connection bootstrap and every management read walk the list in
//! order and stop at the first endpoint that answers; only when all of
//! them refuse does the call fail.

use crate::error::BrokerError;
use std::fmt::Display;
use std::future::Future;
use tracing::warn;

/// Split a comma-separated endpoint list, dropping empty entries.
pub fn split(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run `attempt` against each endpoint in order, returning the first
/// success. Failures short of the last endpoint are logged and skipped.
///
/// The error from the final endpoint is reported; `wrap` turns it into the
/// caller's taxonomy (construction uses `ConnectFailed`, management reads
/// use `ManagementUnavailable`).
pub async fn first_success<T, E, F, Fut, W>(
    endpoints: &[String],
    mut attempt: F,
    wrap: W,
) -> Result<T, BrokerError>
where
    E: Display,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    W: FnOnce(String) -> BrokerError,
{
    if endpoints.is_empty() {
        return Err(wrap("no endpoints configured".to_string()));
    }

    let mut last_error = String::new();
    for endpoint in endpoints {
        match attempt(endpoint.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Endpoint attempt failed, falling through");
                last_error = e.to_string();
            }
        }
    }

    Err(wrap(last_error))
}

#[cfg(test)]
#[path = "endpoints_tests.rs"]
mod tests;
