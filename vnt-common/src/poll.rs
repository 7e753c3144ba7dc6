use std::{future::Future, time::Duration};

use tokio::time::{sleep, Instant};

/// Error returned by [`Poller::until`].
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    /// The condition was not met within the configured bound.
    #[error("condition not met after {elapsed:?}")]
    Timeout { elapsed: Duration },
    /// The probe itself failed.
    #[error(transparent)]
    Inner(E),
}

/// A fixed-interval poller with an overall bound.
///
/// There is no backoff: the probe runs immediately, then once every `interval` until it yields a
/// value or `timeout` has elapsed. The last probe always happens at the deadline, so a timeout is
/// reported within one interval of the configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Poller {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Runs `probe` until it returns `Ok(Some(_))`. Errors from the probe abort the loop.
    pub async fn until<T, E, F, Fut>(&self, mut probe: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let start = Instant::now();

        loop {
            if let Some(value) = probe().await.map_err(PollError::Inner)? {
                return Ok(value);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(PollError::Timeout { elapsed });
            }

            sleep(self.interval.min(self.timeout - elapsed)).await;
        }
    }
}
