use std::future::Future;
use std::time::Duration;
use std::time::SystemTime;

use pin_project::pin_project;

/// Resolves to the output of whichever future completes first, polling
/// `first` before `second`.
#[pin_project]
pub struct Race<A, B, T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    #[pin]
    first: A,
    #[pin]
    second: B,
}

impl<A, B, T> Race<A, B, T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    pub fn between(first: A, second: B) -> Self {
        Race { first, second }
    }
}

impl<A, B, T> Future for Race<A, B, T>
where
    A: Future<Output = T>,
    B: Future<Output = T>,
{
    type Output = T;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();

        match this.first.poll(cx) {
            std::task::Poll::Pending => this.second.poll(cx),
            ready => ready,
        }
    }
}

/// Resolves to `Some(output)` or, once `timeout` has elapsed, to `None`.
pub async fn deadline<F: Future>(task: F, timeout: Duration) -> Option<F::Output> {
    use futures::FutureExt;

    Race::between(
        task.map(Some),
        futures_timer::Delay::new(timeout).map(|_| None),
    )
    .await
}

pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
