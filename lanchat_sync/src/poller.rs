use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs `tick` every `period` until `shutdown` fires. The first tick runs
/// immediately. A slow tick delays the next one instead of bunching them up.
pub fn spawn_repeating<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(poller = name, period_ms = period.as_millis() as u64, "poller started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        tracing::debug!(poller = name, "poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let counter = ticks.clone();
        let handle = spawn_repeating("test", Duration::from_secs(3), shutdown.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Ticks at 0s, 3s and 6s.
        tokio::time::sleep(Duration::from_millis(7000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
