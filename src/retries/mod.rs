/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Retry strategy seam and the default token-bucket strategy.
//!
//! The per-request pipeline acquires a [`RetryToken`] before its first
//! attempt, asks the strategy to [`schedule_retry`](RetryStrategy::schedule_retry)
//! after each retryable failure (the future resolves once backoff has
//! elapsed and bucket capacity was granted), and reports the final outcome
//! through [`record_success`](RetryStrategy::record_success) or
//! [`release_token`](RetryStrategy::release_token).

pub mod classifiers;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ErrorKind, TransferError};
use crate::rt::sleep::{AsyncSleep, SharedAsyncSleep};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);
const DEFAULT_BUCKET_CAPACITY: usize = 500;
const RETRY_COST: u32 = 5;
const TIMEOUT_RETRY_COST: u32 = 10;

/// State carried across the attempts of one sub-request.
#[derive(Debug)]
pub struct RetryToken {
    partition: String,
    attempts: u32,
    permit: Option<OwnedSemaphorePermit>,
}

impl RetryToken {
    /// Creates a token for the given partition key.
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            attempts: 1,
            permit: None,
        }
    }

    /// The partition this token was acquired for.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// How many attempts have been made under this token.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Future returned by [`RetryStrategy::acquire_token`].
#[must_use]
pub struct AcquireTokenFuture(BoxFuture<Result<RetryToken, TransferError>>);

impl AcquireTokenFuture {
    /// Boxes the provided future.
    pub fn new(
        future: impl Future<Output = Result<RetryToken, TransferError>> + Send + 'static,
    ) -> Self {
        Self(Box::pin(future))
    }

    /// A future that is immediately ready with `result`.
    pub fn ready(result: Result<RetryToken, TransferError>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl Future for AcquireTokenFuture {
    type Output = Result<RetryToken, TransferError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Future returned by [`RetryStrategy::schedule_retry`].
///
/// Resolves with the token once the attempt may proceed, or with an error
/// when the strategy declines (attempts or bucket exhausted). The declining
/// error never replaces the failure that triggered the retry.
#[must_use]
pub struct ScheduleRetryFuture(BoxFuture<Result<RetryToken, TransferError>>);

impl ScheduleRetryFuture {
    /// Boxes the provided future.
    pub fn new(
        future: impl Future<Output = Result<RetryToken, TransferError>> + Send + 'static,
    ) -> Self {
        Self(Box::pin(future))
    }

    /// A future that is immediately ready with `result`.
    pub fn ready(result: Result<RetryToken, TransferError>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl Future for ScheduleRetryFuture {
    type Output = Result<RetryToken, TransferError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Pluggable retry policy.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Acquires a token before the first attempt for `partition`.
    fn acquire_token(&self, partition: &str) -> AcquireTokenFuture;

    /// Schedules a retry after a failure of class `error_kind`.
    fn schedule_retry(&self, token: RetryToken, error_kind: ErrorKind) -> ScheduleRetryFuture;

    /// Reports that the request under `token` ultimately succeeded.
    fn record_success(&self, token: RetryToken);

    /// Returns a token whose request failed terminally.
    fn release_token(&self, token: RetryToken) {
        drop(token);
    }
}

/// Shareable handle to a [`RetryStrategy`].
#[derive(Clone, Debug)]
pub struct SharedRetryStrategy(Arc<dyn RetryStrategy>);

impl SharedRetryStrategy {
    /// Wraps a strategy for sharing.
    pub fn new(strategy: impl RetryStrategy + 'static) -> Self {
        Self(Arc::new(strategy))
    }
}

impl RetryStrategy for SharedRetryStrategy {
    fn acquire_token(&self, partition: &str) -> AcquireTokenFuture {
        self.0.acquire_token(partition)
    }

    fn schedule_retry(&self, token: RetryToken, error_kind: ErrorKind) -> ScheduleRetryFuture {
        self.0.schedule_retry(token, error_kind)
    }

    fn record_success(&self, token: RetryToken) {
        self.0.record_success(token)
    }

    fn release_token(&self, token: RetryToken) {
        self.0.release_token(token)
    }
}

/// Token bucket that throttles retries across all requests of a client.
#[derive(Clone, Debug)]
pub(crate) struct TokenBucket {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
}

impl TokenBucket {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            max_permits: capacity,
        }
    }

    /// Tries to take `cost` permits; `None` when the bucket is too empty.
    pub(crate) fn acquire(&self, cost: u32) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_many_owned(cost).ok()
    }

    pub(crate) fn add_permits(&self, amount: usize) {
        let available = self.semaphore.available_permits();
        if available >= self.max_permits {
            return;
        }
        self.semaphore
            .add_permits(amount.min(self.max_permits - available));
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

pub(crate) fn calculate_exponential_backoff(
    base: f64,
    initial_backoff: Duration,
    retry_attempts: u32,
    max_backoff: Duration,
) -> Duration {
    let backoff = base * initial_backoff.as_secs_f64() * 2f64.powi(retry_attempts as i32);
    Duration::from_secs_f64(backoff.min(max_backoff.as_secs_f64()))
}

/// Default strategy: capped attempt count, exponential backoff with jitter,
/// and a token bucket that starves retries when the endpoint keeps failing.
#[derive(Debug)]
pub struct StandardRetryStrategy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    token_bucket: TokenBucket,
    sleep: SharedAsyncSleep,
    use_static_base: bool,
}

impl StandardRetryStrategy {
    /// Starts building a strategy.
    pub fn builder() -> StandardRetryStrategyBuilder {
        StandardRetryStrategyBuilder::default()
    }

    fn cost_for(error_kind: ErrorKind) -> u32 {
        match error_kind {
            ErrorKind::Transport => TIMEOUT_RETRY_COST,
            _ => RETRY_COST,
        }
    }
}

impl RetryStrategy for StandardRetryStrategy {
    fn acquire_token(&self, partition: &str) -> AcquireTokenFuture {
        AcquireTokenFuture::ready(Ok(RetryToken::new(partition)))
    }

    fn schedule_retry(&self, mut token: RetryToken, error_kind: ErrorKind) -> ScheduleRetryFuture {
        if token.attempts >= self.max_attempts {
            debug!(
                attempts = token.attempts,
                max_attempts = self.max_attempts,
                "out of attempts, not retrying"
            );
            return ScheduleRetryFuture::ready(Err(TransferError::new(
                ErrorKind::Internal,
                "retry attempts exhausted",
            )));
        }
        let permit = match self.token_bucket.acquire(Self::cost_for(error_kind)) {
            Some(permit) => permit,
            None => {
                debug!("retry token bucket exhausted, not retrying");
                return ScheduleRetryFuture::ready(Err(TransferError::new(
                    ErrorKind::Internal,
                    "retry capacity exhausted",
                )));
            }
        };
        // Tokens spent on this retry must not flow back into the bucket
        // when the previous permit is replaced.
        if let Some(previous) = token.permit.replace(permit) {
            previous.forget();
        }
        let base = if self.use_static_base {
            1.0
        } else {
            fastrand::f64()
        };
        let backoff = calculate_exponential_backoff(
            base,
            self.initial_backoff,
            token.attempts - 1,
            self.max_backoff,
        );
        debug!(attempts = token.attempts, ?backoff, ?error_kind, "retrying after backoff");
        let sleep = self.sleep.clone();
        ScheduleRetryFuture::new(async move {
            sleep.sleep(backoff).await;
            token.attempts += 1;
            Ok(token)
        })
    }

    fn record_success(&self, mut token: RetryToken) {
        // Dropping the held permit returns its tokens to the bucket.
        token.permit.take();
        self.token_bucket.add_permits(1);
    }

    fn release_token(&self, mut token: RetryToken) {
        // Terminal failure: the spent tokens stay spent.
        if let Some(permit) = token.permit.take() {
            permit.forget();
        }
    }
}

/// Builder for [`StandardRetryStrategy`].
#[derive(Debug, Default)]
pub struct StandardRetryStrategyBuilder {
    max_attempts: Option<u32>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    bucket_capacity: Option<usize>,
    sleep: Option<SharedAsyncSleep>,
    use_static_base: bool,
}

impl StandardRetryStrategyBuilder {
    /// Maximum total attempts per sub-request (first try included).
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Backoff before the first retry.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Upper bound for any single backoff.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Token bucket capacity.
    pub fn bucket_capacity(mut self, capacity: usize) -> Self {
        self.bucket_capacity = Some(capacity);
        self
    }

    /// Timer used for backoff sleeps.
    pub fn sleep(mut self, sleep: SharedAsyncSleep) -> Self {
        self.sleep = Some(sleep);
        self
    }

    /// Disables jitter so backoff durations are deterministic.
    pub fn use_static_base(mut self, value: bool) -> Self {
        self.use_static_base = value;
        self
    }

    /// Builds the strategy.
    pub fn build(self) -> StandardRetryStrategy {
        StandardRetryStrategy {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: self.initial_backoff.unwrap_or(DEFAULT_INITIAL_BACKOFF),
            max_backoff: self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
            token_bucket: TokenBucket::new(
                self.bucket_capacity.unwrap_or(DEFAULT_BUCKET_CAPACITY),
            ),
            sleep: self
                .sleep
                .unwrap_or_else(crate::rt::sleep::default_async_sleep),
            use_static_base: self.use_static_base,
        }
    }
}

impl Default for StandardRetryStrategy {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        for (attempt, expected_secs) in [(0, 1), (1, 2), (2, 4), (3, 8)] {
            assert_eq!(
                Duration::from_secs(expected_secs),
                calculate_exponential_backoff(1.0, initial, attempt, max)
            );
        }
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = calculate_exponential_backoff(
            1.0,
            Duration::from_secs(1),
            30,
            Duration::from_secs(20),
        );
        assert_eq!(Duration::from_secs(20), backoff);
    }

    #[tokio::test]
    async fn retries_until_attempts_exhausted() {
        let strategy = StandardRetryStrategy::builder()
            .max_attempts(3)
            .initial_backoff(Duration::from_millis(1))
            .use_static_base(true)
            .build();
        let token = strategy.acquire_token("bucket.s3").await.unwrap();
        let token = strategy
            .schedule_retry(token, ErrorKind::ServerTransient)
            .await
            .expect("first retry granted");
        let token = strategy
            .schedule_retry(token, ErrorKind::ServerTransient)
            .await
            .expect("second retry granted");
        assert_eq!(3, token.attempts());
        assert!(strategy
            .schedule_retry(token, ErrorKind::ServerTransient)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bucket_exhaustion_denies_retry() {
        let strategy = StandardRetryStrategy::builder()
            .max_attempts(10)
            .bucket_capacity(12)
            .initial_backoff(Duration::from_millis(1))
            .use_static_base(true)
            .build();
        // Transport retries cost 10 tokens; the second cannot be paid for.
        let token = strategy.acquire_token("p").await.unwrap();
        let token = strategy
            .schedule_retry(token, ErrorKind::Transport)
            .await
            .expect("first retry granted");
        assert!(strategy
            .schedule_retry(token, ErrorKind::Transport)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn success_returns_tokens_to_bucket() {
        let strategy = StandardRetryStrategy::builder()
            .max_attempts(10)
            .bucket_capacity(10)
            .initial_backoff(Duration::from_millis(1))
            .use_static_base(true)
            .build();
        let token = strategy.acquire_token("p").await.unwrap();
        let token = strategy
            .schedule_retry(token, ErrorKind::Throttling)
            .await
            .unwrap();
        assert_eq!(5, strategy.token_bucket.available_permits());
        strategy.record_success(token);
        // Permit released plus the success reward, capped at capacity.
        assert_eq!(10, strategy.token_bucket.available_permits());
    }

    #[tokio::test]
    async fn terminal_failure_keeps_tokens_spent() {
        let strategy = StandardRetryStrategy::builder()
            .max_attempts(10)
            .bucket_capacity(10)
            .initial_backoff(Duration::from_millis(1))
            .use_static_base(true)
            .build();
        let token = strategy.acquire_token("p").await.unwrap();
        let token = strategy
            .schedule_retry(token, ErrorKind::Throttling)
            .await
            .unwrap();
        strategy.release_token(token);
        assert_eq!(5, strategy.token_bucket.available_permits());
    }
}
