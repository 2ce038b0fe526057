//! Execution time measurement.
use std::{future::Future, time::Duration};
use tokio::time::Instant;

/// The outcome of a timed invocation along with how long it took.
#[derive(Debug)]
pub struct TimedResult<T, E> {
    result: Result<T, E>,
    elapsed: Duration,
}

impl<T, E> TimedResult<T, E> {
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Elapsed time in fractional milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }

    pub fn successful(&self) -> bool {
        self.result.is_ok()
    }

    pub fn result(&self) -> &Result<T, E> {
        &self.result
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Awaits `future`, measuring the time until it resolves.
pub async fn time<F, T, E>(future: F) -> TimedResult<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = future.await;

    TimedResult {
        result,
        elapsed: start.elapsed(),
    }
}
