//! # Metadata Provider Rate Limiter
//!
//! Token bucket shared by every caller of the metadata provider.
//!
//! ## Overview
//!
//! - The bucket starts full at `capacity` tokens and gains one token every
//!   `refill_interval`, never exceeding `capacity`.
//! - Callers submit a request through a bounded intake channel. A single
//!   background loop moves requests into a pending heap ordered by priority
//!   (high first) and arrival (FIFO within a priority), and grants the head of
//!   the heap whenever a token is available.
//! - The loop is event driven: it wakes only on a refill tick, an incoming
//!   request, or shutdown.
//! - A granted caller runs its provider call itself. Transient failures
//!   (rate-limited, timed out, connection reset) are retried with exponential
//!   backoff; each retry waits for a fresh token. Anything else fails at once.
//!
//! Over any window of `W`, at most `capacity + ceil(W / refill_interval)`
//! calls are started.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_metadata::rate_limiter::{Priority, RateLimiter};
//!
//! let limiter = RateLimiter::new(config.rate_limit.clone());
//! let movie = limiter
//!     .execute_with_rate_limit(Priority::Low, &cancel, || provider.get_movie(603))
//!     .await?;
//! ```

use bridge_traits::error::BridgeError;
use bridge_traits::time::Clock;
use core_library::repositories::UsageRepository;
use core_runtime::config::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MetadataError, Result};

// ============================================================================
// Requests
// ============================================================================

/// Scheduling priority of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Background matching
    Low = 0,
    #[default]
    Normal = 1,
    /// Interactive lookups
    High = 2,
}

struct Request {
    priority: Priority,
    seq: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Request {}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Request {
    // BinaryHeap is a max-heap: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// State
// ============================================================================

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub available_tokens: u32,
    pub pending: usize,
    pub millis_since_refill: u64,
    /// Tokens handed to callers.
    pub executed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Requests whose caller went away before being granted.
    pub abandoned: u64,
}

struct BucketState {
    capacity: u32,
    tokens: u32,
    last_refill: Instant,
    pending: BinaryHeap<Request>,
    executed: u64,
    retried: u64,
    failed: u64,
    abandoned: u64,
}

impl BucketState {
    fn new(capacity: u32, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
            pending: BinaryHeap::new(),
            executed: 0,
            retried: 0,
            failed: 0,
            abandoned: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = (self.tokens + 1).min(self.capacity);
        self.last_refill = now;
    }

    /// Grant pending requests while tokens remain. A request whose receiver
    /// is gone is skipped without spending a token.
    fn dispatch(&mut self) {
        while self.tokens > 0 {
            let Some(request) = self.pending.pop() else {
                break;
            };
            if request.grant.send(()).is_ok() {
                self.tokens -= 1;
                self.executed += 1;
            } else {
                self.abandoned += 1;
            }
        }
    }

    fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            available_tokens: self.tokens,
            pending: self.pending.len(),
            millis_since_refill: self.last_refill.elapsed().as_millis() as u64,
            executed: self.executed,
            retried: self.retried,
            failed: self.failed,
            abandoned: self.abandoned,
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

struct UsageRecorder {
    repository: Arc<dyn UsageRepository>,
    clock: Arc<dyn Clock>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    intake: mpsc::Sender<Request>,
    state: Arc<Mutex<BucketState>>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
    dispatch_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    usage: Option<UsageRecorder>,
}

impl RateLimiter {
    /// Create the limiter and spawn its dispatch loop on the current runtime.
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let state = Arc::new(Mutex::new(BucketState::new(config.capacity, now)));
        let (intake, intake_rx) = mpsc::channel(config.intake_capacity.max(1));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_dispatch_loop(
            state.clone(),
            intake_rx,
            config.clone(),
            now,
            shutdown.clone(),
        ));

        info!(
            capacity = config.capacity,
            refill_ms = config.refill_interval.as_millis() as u64,
            "Rate limiter started"
        );

        Self {
            config,
            intake,
            state,
            next_seq: AtomicU64::new(0),
            shutdown,
            dispatch_handle: std::sync::Mutex::new(Some(handle)),
            usage: None,
        }
    }

    /// Persist aggregate usage after every call.
    pub fn with_usage_repository(
        mut self,
        repository: Arc<dyn UsageRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        self.usage = Some(UsageRecorder { repository, clock });
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Run `operation` once a token is granted, retrying transient failures.
    ///
    /// # Errors
    ///
    /// - [`MetadataError::QueueFull`] when the intake stays full for
    ///   `intake_timeout`
    /// - [`MetadataError::Timeout`] when the whole call, retries included,
    ///   exceeds `request_timeout`
    /// - [`MetadataError::Cancelled`] when `cancel` fires before an attempt or
    ///   during a backoff
    /// - [`MetadataError::RetriesExhausted`] after `max_retries` transient
    ///   failures
    /// - [`MetadataError::Provider`] for a permanent provider error
    pub async fn execute_with_rate_limit<T, F, Fut>(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BridgeError>>,
    {
        let deadline = self.config.request_timeout;
        let mut attempts = 0u32;

        let result = match tokio::time::timeout(
            deadline,
            self.run_with_retries(priority, cancel, operation, &mut attempts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(?priority, timeout_ms = deadline.as_millis() as u64, "Rate limited request timed out");
                Err(MetadataError::Timeout(deadline))
            }
        };

        if result.is_err() && !matches!(result, Err(MetadataError::Cancelled)) {
            self.state.lock().await.failed += 1;
        }
        self.record_usage(attempts, result.is_err());

        result
    }

    async fn run_with_retries<T, F, Fut>(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
        mut operation: F,
        attempts: &mut u32,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BridgeError>>,
    {
        let mut retry = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(MetadataError::Cancelled);
            }

            self.acquire(priority, cancel).await?;
            *attempts += 1;

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => MetadataError::Provider(err),
            };

            if !err.is_transient() {
                debug!(error = %err, "Permanent provider error, not retrying");
                return Err(err);
            }

            if retry >= self.config.max_retries {
                warn!(attempts = *attempts, error = %err, "Provider retries exhausted");
                return Err(MetadataError::RetriesExhausted {
                    attempts: *attempts,
                    last: err.to_string(),
                });
            }

            let backoff = self.config.backoff_for(retry);
            retry += 1;
            self.state.lock().await.retried += 1;
            debug!(
                retry,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Transient provider error, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(MetadataError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Wait for one token.
    async fn acquire(&self, priority: Priority, cancel: &CancellationToken) -> Result<()> {
        let (grant_tx, grant_rx) = oneshot::channel();
        let request = Request {
            priority,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            grant: grant_tx,
        };

        match tokio::time::timeout(self.config.intake_timeout, self.intake.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(MetadataError::Shutdown),
            Err(_) => {
                warn!(?priority, "Rate limiter intake full");
                return Err(MetadataError::QueueFull);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(MetadataError::Cancelled),
            granted = grant_rx => granted.map_err(|_| MetadataError::Shutdown),
        }
    }

    fn record_usage(&self, attempts: u32, failed: bool) {
        let Some(usage) = &self.usage else {
            return;
        };
        if attempts == 0 {
            return;
        }

        let repository = usage.repository.clone();
        let now = usage.clock.unix_timestamp();
        let retries = u64::from(attempts.saturating_sub(1));
        let failures = u64::from(failed);

        tokio::spawn(async move {
            if let Err(e) = repository
                .record(u64::from(attempts), retries, failures, now)
                .await
            {
                warn!(error = %e, "Failed to record rate limiter usage");
            }
        });
    }

    pub async fn stats(&self) -> RateLimiterStats {
        self.state.lock().await.stats()
    }

    /// Stop the dispatch loop. Waiting callers receive
    /// [`MetadataError::Shutdown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.dispatch_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rate limiter dispatch loop ended abnormally");
            }
        }
        info!("Rate limiter stopped");
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_dispatch_loop(
    state: Arc<Mutex<BucketState>>,
    mut intake: mpsc::Receiver<Request>,
    config: RateLimitConfig,
    started: Instant,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(started + config.refill_interval, config.refill_interval);
    let pending_limit = config.intake_capacity.max(1);

    loop {
        let accepting = state.lock().await.pending.len() < pending_limit;

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            tick = ticker.tick() => {
                state.lock().await.refill(tick);
            }

            request = intake.recv(), if accepting => match request {
                Some(request) => state.lock().await.pending.push(request),
                None => break,
            },
        }

        state.lock().await.dispatch();
    }

    let mut guard = state.lock().await;
    let dropped = guard.pending.len();
    guard.pending.clear();
    debug!(dropped, "Rate limiter dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config(capacity: u32, refill_ms: u64) -> RateLimitConfig {
        RateLimitConfig::new(capacity, Duration::from_millis(refill_ms))
            .with_retries(3, Duration::from_millis(100))
    }

    async fn ok_now(started: Instant) -> std::result::Result<Duration, BridgeError> {
        Ok(Instant::now() - started)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_one_per_refill() {
        let limiter = Arc::new(RateLimiter::new(config(2, 250)));
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute_with_rate_limit(Priority::Normal, &cancel, || ok_now(started))
                    .await
            }));
        }

        let mut elapsed = Vec::new();
        for handle in handles {
            elapsed.push(handle.await.unwrap().unwrap().as_millis() as u64);
        }
        elapsed.sort_unstable();

        let expected = [0, 0, 250, 500, 750];
        for (actual, expected) in elapsed.iter().zip(expected) {
            assert!(
                actual.abs_diff(expected) <= 5,
                "executions at {:?}, expected {:?}",
                elapsed,
                expected
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_never_exceeds_bucket_bound() {
        let capacity = 3u64;
        let refill_ms = 100u64;
        let limiter = Arc::new(RateLimiter::new(config(capacity as u32, refill_ms)));
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute_with_rate_limit(Priority::Normal, &cancel, || ok_now(started))
                    .await
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap().unwrap().as_millis() as u64);
        }
        times.sort_unstable();

        for i in 0..times.len() {
            for j in i..times.len() {
                let window = times[j] - times[i];
                let bound = capacity + window.div_ceil(refill_ms);
                assert!(
                    (j - i + 1) as u64 <= bound,
                    "{} calls in {}ms window",
                    j - i + 1,
                    window
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_served_first() {
        let limiter = Arc::new(RateLimiter::new(config(1, 100)));
        let cancel = CancellationToken::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Drain the bucket.
        limiter
            .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
            .await
            .unwrap();

        let spawn = |priority: Priority, name: &'static str| {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            tokio::spawn(async move {
                limiter
                    .execute_with_rate_limit(priority, &cancel, || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(name);
                            Ok(())
                        }
                    })
                    .await
            })
        };

        let low = spawn(Priority::Low, "low");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let normal = spawn(Priority::Normal, "normal");
        let high = spawn(Priority::High, "high");

        for handle in [low, normal, high] {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priority_is_fifo() {
        let limiter = Arc::new(RateLimiter::new(config(1, 100)));
        let cancel = CancellationToken::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        limiter
            .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for n in 0..4 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute_with_rate_limit(Priority::Normal, &cancel, || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(n);
                            Ok(())
                        }
                    })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let limiter = RateLimiter::new(config(10, 100));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = limiter
            .execute_with_rate_limit(Priority::Low, &cancel, || {
                let n = calls.fetch_add(1, AtomicOrdering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BridgeError::OperationFailed(
                            "HTTP 429 Too Many Requests".to_string(),
                        ))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);

        let stats = limiter.stats().await;
        assert_eq!(stats.executed, 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_fail_immediately() {
        let limiter = RateLimiter::new(config(10, 100));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = limiter
            .execute_with_rate_limit(Priority::Low, &cancel, || {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                async { Err(BridgeError::OperationFailed("401 invalid api key".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(MetadataError::Provider(_))));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(limiter.stats().await.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let limiter = RateLimiter::new(
            config(10, 100).with_retries(2, Duration::from_millis(50)),
        );
        let cancel = CancellationToken::new();

        let result: Result<()> = limiter
            .execute_with_rate_limit(Priority::Low, &cancel, || async {
                Err(BridgeError::OperationFailed("connection reset by peer".to_string()))
            })
            .await;

        match result {
            Err(MetadataError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other.err()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new(1, Duration::from_secs(3600))
                .with_request_timeout(Duration::from_secs(1)),
        );
        let cancel = CancellationToken::new();

        limiter
            .execute_with_rate_limit(Priority::High, &cancel, || async { Ok(()) })
            .await
            .unwrap();

        let result = limiter
            .execute_with_rate_limit(Priority::High, &cancel, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(MetadataError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_intake_full_after_bounded_wait() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::new(1, Duration::from_secs(3600))
                .with_intake(1, Duration::from_millis(50)),
        ));
        let cancel = CancellationToken::new();

        limiter
            .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
            .await
            .unwrap();

        // One request fills the pending heap, the next one the intake channel.
        let mut waiting = Vec::new();
        for _ in 0..2 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            waiting.push(tokio::spawn(async move {
                limiter
                    .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let result = limiter
            .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(MetadataError::QueueFull)));

        for handle in waiting {
            handle.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_attempt_spends_no_token() {
        let limiter = RateLimiter::new(config(1, 100));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = limiter
            .execute_with_rate_limit(Priority::Low, &cancel, || async { Ok(()) })
            .await;

        assert!(matches!(result, Err(MetadataError::Cancelled)));
        assert_eq!(limiter.stats().await.available_tokens, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let limiter = RateLimiter::new(
            config(10, 100).with_retries(5, Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = limiter
            .execute_with_rate_limit(Priority::Low, &cancel, || async {
                Err(BridgeError::OperationFailed("request timed out".to_string()))
            })
            .await;

        assert!(matches!(result, Err(MetadataError::Cancelled)));
        assert!(Instant::now() - started < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new(config(2, 100));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.stats().await.available_tokens, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_waiters() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(
            1,
            Duration::from_secs(3600),
        )));
        let cancel = CancellationToken::new();

        limiter
            .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
            .await
            .unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                limiter
                    .execute_with_rate_limit(Priority::Normal, &cancel, || async { Ok(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.shutdown().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(MetadataError::Shutdown)
        ));
    }
}
