//! Shared helpers for streaming integration tests.

#![allow(dead_code)]

pub mod mock_ws;

use std::time::Duration;

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
