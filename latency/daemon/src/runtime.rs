//! Async runtime for the binary
//!
//! Trace sources are read through `tokio::fs`, which parks every read on
//! the blocking pool. A read waiting on an idle trace pipe never returns, so
//! the runtime is shut down with a bounded wait instead of being dropped.

use anyhow::{Context, Result};
use std::{future::Future, time::Duration};
use tokio::runtime::Runtime;

/// How long shutdown waits for reads still parked on a source
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Build the multi-threaded runtime the capture runs on
pub fn build() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pktlat")
        .build()
        .context("Failed to launch async runtime")
}

/// Drive `future` to completion, then stop the runtime
///
/// Blocking reads that are still waiting after `grace` are abandoned.
pub fn run_to_completion<F: Future>(rt: Runtime, future: F, grace: Duration) -> F::Output {
    let output = rt.block_on(future);
    rt.shutdown_timeout(grace);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_shutdown_does_not_wait_for_parked_reads() {
        let rt = build().unwrap();
        let start = Instant::now();

        let value = run_to_completion(
            rt,
            async {
                // Stands in for a read on a trace pipe that never sees data
                tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
                7
            },
            Duration::from_millis(50),
        );

        assert_eq!(value, 7);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
