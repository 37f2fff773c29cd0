//! Serializes calls against the remote API and retries transient failures
//! with a shared, adaptive sleep between calls.
//!
//! Every paced call holds the single admission slot from the pre-call sleep
//! until the remote call returns, so one [`Pacer`] never has two calls in
//! flight. Transient failures double the sleep (up to `max_sleep`), finished
//! calls decay it back towards `min_sleep`.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MIN_SLEEP: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DECAY_CONSTANT: u32 = 1;
pub const MIN_SLEEP_FLOOR: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerConfig {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    /// Bigger is slower: each finished call keeps `(2^c - 1) / 2^c` of the sleep.
    pub decay_constant: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_sleep: DEFAULT_MIN_SLEEP,
            max_sleep: DEFAULT_MAX_SLEEP,
            decay_constant: DEFAULT_DECAY_CONSTANT,
        }
    }
}

impl PacerConfig {
    /// Floors `min_sleep` at [`MIN_SLEEP_FLOOR`] and keeps `max_sleep` above it.
    pub fn normalized(self) -> Self {
        let min_sleep = self.min_sleep.max(MIN_SLEEP_FLOOR);
        Self {
            min_sleep,
            max_sleep: self.max_sleep.max(min_sleep),
            decay_constant: self.decay_constant.clamp(1, 30),
        }
    }
}

/// What one attempt of a paced operation produced.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
    Fatal(E),
}

impl<T, E> Attempt<T, E> {
    pub fn from_result(result: Result<T, E>, is_retryable: impl FnOnce(&E) -> bool) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(err) if is_retryable(&err) => Attempt::Retry(err),
            Err(err) => Attempt::Fatal(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum PacerError<E> {
    #[error("{0}")]
    Fatal(E),
    #[error("transient failure on a call that is not retried: {0}")]
    NotRetried(E),
    #[error("call cancelled after {retries} transient failures")]
    Cancelled { retries: u32, last_error: Option<E> },
}

impl<E> PacerError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            PacerError::Fatal(err) | PacerError::NotRetried(err) => Some(err),
            PacerError::Cancelled { last_error, .. } => last_error,
        }
    }
}

#[derive(Debug)]
struct PaceState {
    sleep: Duration,
    failures: u32,
}

impl PaceState {
    fn decay(&mut self, config: &PacerConfig) {
        let keep = (1u128 << config.decay_constant) - 1;
        let nanos = (self.sleep.as_nanos() * keep) >> config.decay_constant;
        let decayed = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        self.sleep = decayed.max(config.min_sleep);
        self.failures = 0;
    }

    fn back_off(&mut self, config: &PacerConfig) {
        self.sleep = self.sleep.saturating_mul(2).min(config.max_sleep);
        self.failures = self.failures.saturating_add(1);
    }
}

pub struct Pacer {
    config: PacerConfig,
    state: Mutex<PaceState>,
    cancel: CancellationToken,
}

impl Pacer {
    pub fn new(config: PacerConfig) -> Self {
        let config = config.normalized();
        Self {
            state: Mutex::new(PaceState {
                sleep: config.min_sleep,
                failures: 0,
            }),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Bounds the retry loop by `token`: once cancelled, waiting callers stop
    /// with [`PacerError::Cancelled`] instead of sleeping again.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sleep applied before the next call. Waits for any in-flight call.
    pub async fn current_sleep(&self) -> Duration {
        self.state.lock().await.sleep
    }

    /// Runs `op` until it succeeds or fails fatally, retrying transient
    /// failures with exponential backoff. Only cancellation ends the retry loop.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, PacerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut retries = 0u32;
        let mut last_error = None;
        loop {
            match self.pace_once(&mut op).await {
                None => {
                    warn!(retries, "paced call cancelled");
                    return Err(PacerError::Cancelled {
                        retries,
                        last_error,
                    });
                }
                Some(Attempt::Done(value)) => return Ok(value),
                Some(Attempt::Fatal(err)) => return Err(PacerError::Fatal(err)),
                Some(Attempt::Retry(err)) => {
                    retries = retries.saturating_add(1);
                    last_error = Some(err);
                }
            }
        }
    }

    /// Like [`call`](Self::call) but issues `op` exactly once. For calls whose
    /// side effects cannot be repeated; the backoff bookkeeping still applies.
    pub async fn call_no_retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, PacerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        match self.pace_once(&mut op).await {
            None => Err(PacerError::Cancelled {
                retries: 0,
                last_error: None,
            }),
            Some(Attempt::Done(value)) => Ok(value),
            Some(Attempt::Fatal(err)) => Err(PacerError::Fatal(err)),
            Some(Attempt::Retry(err)) => Err(PacerError::NotRetried(err)),
        }
    }

    async fn pace_once<T, E, F, Fut>(&self, op: &mut F) -> Option<Attempt<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut state = self.admit().await?;

        if state.sleep > self.config.min_sleep || state.failures > 0 {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(state.sleep) => {}
            }
        }

        let outcome = op().await;
        match &outcome {
            Attempt::Retry(_) => {
                state.back_off(&self.config);
                debug!(
                    failures = state.failures,
                    sleep_ms = state.sleep.as_millis() as u64,
                    "transient failure, backing off"
                );
            }
            Attempt::Done(_) | Attempt::Fatal(_) => state.decay(&self.config),
        }
        Some(outcome)
    }

    async fn admit(&self) -> Option<MutexGuard<'_, PaceState>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            guard = self.state.lock() => Some(guard),
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(PacerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn pacer(min_ms: u64, max_ms: u64) -> Pacer {
        Pacer::new(PacerConfig {
            min_sleep: Duration::from_millis(min_ms),
            max_sleep: Duration::from_millis(max_ms),
            decay_constant: 1,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_at_the_floor_does_not_sleep() {
        let pacer = pacer(10, 1_000);
        let start = Instant::now();

        let value: Result<u32, PacerError<&str>> = pacer.call(|| async { Attempt::Done(7) }).await;

        assert_eq!(value.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_doubles_after_each_transient_failure_up_to_the_ceiling() {
        let pacer = pacer(10, 100);
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result: Result<&str, PacerError<&str>> = pacer
            .call(|| {
                let calls = Arc::clone(&calls);
                async move {
                    let mut calls = calls.lock().unwrap();
                    calls.push(Instant::now());
                    if calls.len() <= 5 {
                        Attempt::Retry("busy")
                    } else {
                        Attempt::Done("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        let calls = calls.lock().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
        // One success halves the ceiling value.
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn successes_decay_towards_but_never_below_the_floor() {
        let pacer = pacer(10, 1_000);
        let mut attempts = 0;
        let _: Result<(), PacerError<()>> = pacer
            .call(|| {
                attempts += 1;
                let attempt = if attempts <= 4 {
                    Attempt::Retry(())
                } else {
                    Attempt::Done(())
                };
                async move { attempt }
            })
            .await;
        // 10 -> 160 after four failures, halved by the success.
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(80));

        let mut observed = Vec::new();
        for _ in 0..5 {
            let _: Result<(), PacerError<()>> = pacer.call(|| async { Attempt::Done(()) }).await;
            observed.push(pacer.current_sleep().await);
        }
        assert_eq!(
            observed,
            vec![
                Duration::from_millis(40),
                Duration::from_millis(20),
                Duration::from_millis(10),
                Duration::from_millis(10),
                Duration::from_millis(10),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slower_decay_constant_keeps_more_of_the_sleep() {
        let pacer = Pacer::new(PacerConfig {
            min_sleep: Duration::from_millis(10),
            max_sleep: Duration::from_millis(1_000),
            decay_constant: 2,
        });
        let mut attempts = 0;
        let _: Result<(), PacerError<()>> = pacer
            .call(|| {
                attempts += 1;
                let attempt = if attempts <= 3 {
                    Attempt::Retry(())
                } else {
                    Attempt::Done(())
                };
                async move { attempt }
            })
            .await;

        // 10 -> 20 -> 40 -> 80, then one success keeps three quarters.
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_returned_without_retrying() {
        let pacer = pacer(10, 1_000);
        let mut attempts = 0;

        let result: Result<(), PacerError<&str>> = pacer
            .call(|| {
                attempts += 1;
                async { Attempt::Fatal("denied") }
            })
            .await;

        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(PacerError::Fatal("denied"))));
    }

    #[tokio::test(start_paused = true)]
    async fn call_no_retry_reports_transient_failure_and_raises_sleep() {
        let pacer = pacer(10, 1_000);
        let mut attempts = 0;

        let result: Result<(), PacerError<&str>> = pacer
            .call_no_retry(|| {
                attempts += 1;
                async { Attempt::Retry("throttled") }
            })
            .await;

        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(PacerError::NotRetried("throttled"))));
        assert_eq!(pacer.current_sleep().await, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_an_endless_retry_loop() {
        let token = CancellationToken::new();
        let pacer = Arc::new(pacer(10, 100).with_cancellation(token.clone()));

        let task = {
            let pacer = Arc::clone(&pacer);
            tokio::spawn(async move {
                pacer
                    .call(|| async { Attempt::<(), _>::Retry("unavailable") })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();

        let result = task.await.unwrap();
        match result {
            Err(PacerError::Cancelled {
                retries,
                last_error,
            }) => {
                assert!(retries > 5);
                assert_eq!(last_error, Some("unavailable"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pacer_issues_no_calls() {
        let pacer = pacer(10, 100);
        pacer.cancellation().cancel();
        let mut attempts = 0;

        let result: Result<(), PacerError<()>> = pacer
            .call(|| {
                attempts += 1;
                async { Attempt::Done(()) }
            })
            .await;

        assert_eq!(attempts, 0);
        assert!(matches!(
            result,
            Err(PacerError::Cancelled { retries: 0, last_error: None })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_two_calls_at_once() {
        let pacer = Arc::new(Pacer::new(PacerConfig {
            min_sleep: Duration::from_millis(1),
            max_sleep: Duration::from_millis(4),
            decay_constant: 1,
        }));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for n in 0..16usize {
            let pacer = Arc::clone(&pacer);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let total = Arc::clone(&total);
            tasks.push(tokio::spawn(async move {
                let mut attempt = 0usize;
                pacer
                    .call(|| {
                        attempt += 1;
                        let retry = n % 3 == 0 && attempt == 1;
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        let total = Arc::clone(&total);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            total.fetch_add(1, Ordering::SeqCst);
                            if retry {
                                Attempt::<(), ()>::Retry(())
                            } else {
                                Attempt::Done(())
                            }
                        }
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // 16 callers, six of them retried once.
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn attempt_from_result_uses_the_predicate() {
        let retry: Attempt<(), u16> = Attempt::from_result(Err(429), |code| *code == 429);
        let fatal: Attempt<(), u16> = Attempt::from_result(Err(404), |code| *code == 429);
        let done: Attempt<u8, u16> = Attempt::from_result(Ok(1), |_| true);

        assert!(matches!(retry, Attempt::Retry(429)));
        assert!(matches!(fatal, Attempt::Fatal(404)));
        assert!(matches!(done, Attempt::Done(1)));
    }

    #[test]
    fn config_keeps_the_ceiling_above_the_floor() {
        let pacer = Pacer::new(PacerConfig {
            min_sleep: Duration::from_millis(50),
            max_sleep: Duration::from_millis(5),
            decay_constant: 0,
        });
        assert_eq!(pacer.config().max_sleep, Duration::from_millis(50));
        assert_eq!(pacer.config().decay_constant, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_floor_still_backs_off() {
        let pacer = Pacer::new(PacerConfig {
            min_sleep: Duration::ZERO,
            max_sleep: Duration::from_millis(100),
            decay_constant: 1,
        });
        assert_eq!(pacer.config().min_sleep, MIN_SLEEP_FLOOR);

        for _ in 0..5 {
            let _: Result<(), PacerError<()>> =
                pacer.call_no_retry(|| async { Attempt::Retry(()) }).await;
        }

        assert_eq!(pacer.current_sleep().await, Duration::from_millis(32));
    }
}
