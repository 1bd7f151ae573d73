use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};

use crate::connectors::Connector;
use crate::error::SourceError;
use crate::ids::{PaperId, Source};
use crate::model::{Direction, PaperMetadata, SearchQuery};

/// Per-source rate ceiling and retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls allowed in flight at once against the source.
    pub max_concurrent: usize,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Minimum spacing between the starts of two calls.
    pub min_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            min_interval: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Published or observed limits for each source. `keyed` means an API key raises the quota.
    pub fn for_source(source: Source, keyed: bool) -> Self {
        let base = Self::default();
        match source {
            Source::ArXiv => Self {
                max_concurrent: 1,
                min_interval: Duration::from_secs(3),
                ..base
            },
            Source::PubMed => Self {
                max_concurrent: 3,
                min_interval: Duration::from_millis(if keyed { 100 } else { 340 }),
                ..base
            },
            Source::SemanticScholar => Self {
                max_concurrent: 2,
                base_delay: Duration::from_secs(1),
                min_interval: Duration::from_millis(if keyed { 100 } else { 1000 }),
                ..base
            },
            Source::GoogleScholar => Self {
                max_concurrent: 1,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                min_interval: Duration::from_secs(5),
                ..base
            },
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Exponential delay for the given failed attempt (1-based), capped, with equal jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let exp = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let ms = exp.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }
}

struct Limiter {
    policy: RetryPolicy,
    permits: Semaphore,
    next_slot: Mutex<Instant>,
}

impl Limiter {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            permits: Semaphore::new(policy.max_concurrent.max(1)),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Reserve the next start slot, then wait for it outside the lock.
    async fn wait_for_slot(&self) {
        let wait = {
            let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.policy.min_interval;
            slot - now
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

/// Wraps every outbound connector call with the source's concurrency ceiling,
/// request spacing, retry schedule and an overall deadline.
pub struct RetryExecutor {
    limiters: HashMap<Source, Limiter>,
}

impl RetryExecutor {
    /// Sources without an explicit policy use [`RetryPolicy::for_source`] unkeyed.
    pub fn new(policies: HashMap<Source, RetryPolicy>) -> Self {
        let limiters = Source::ALL
            .into_iter()
            .map(|source| {
                let policy = policies
                    .get(&source)
                    .copied()
                    .unwrap_or_else(|| RetryPolicy::for_source(source, false));
                (source, Limiter::new(policy))
            })
            .collect();
        Self { limiters }
    }

    #[cfg(test)]
    pub fn policy(&self, source: Source) -> Option<RetryPolicy> {
        self.limiters.get(&source).map(|l| l.policy)
    }

    /// Run `op` against `source`. The deadline covers every attempt and every backoff;
    /// non-transient failures are returned as-is on the first occurrence.
    pub async fn execute<T, F, Fut>(
        &self,
        source: Source,
        deadline: Duration,
        op: F,
    ) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        match timeout(deadline, self.run(source, op)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} call exceeded deadline of {:?}", source, deadline);
                Err(SourceError::Timeout(deadline))
            }
        }
    }

    async fn run<T, F, Fut>(&self, source: Source, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let limiter = self
            .limiters
            .get(&source)
            .ok_or_else(|| SourceError::invalid(format!("no rate policy for {}", source)))?;
        let policy = limiter.policy;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = {
                // The permit covers one attempt only; backoff sleeps do not hold it.
                let _permit = limiter.permits.acquire().await.map_err(|e| SourceError::Upstream {
                    origin: source,
                    attempts,
                    last_cause: e.to_string(),
                })?;
                limiter.wait_for_slot().await;
                op().await
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };
            if attempts > policy.max_retries {
                tracing::warn!("{} gave up after {} attempt(s): {}", source, attempts, err);
                return Err(SourceError::Upstream {
                    origin: source,
                    attempts,
                    last_cause: err.to_string(),
                });
            }
            let delay = err.retry_after().unwrap_or_else(|| policy.backoff(attempts));
            tracing::debug!(
                "{} attempt {} failed ({}), retrying in {:?}",
                source,
                attempts,
                err,
                delay
            );
            sleep(delay).await;
        }
    }
}

/// A connector handed to another connector as a delegate. Every call it forwards is
/// charged against the delegate's own source limits, not the caller's.
pub struct Throttled {
    inner: Arc<dyn Connector>,
    executor: Arc<RetryExecutor>,
    deadline: Duration,
}

impl Throttled {
    pub fn new(inner: Arc<dyn Connector>, executor: Arc<RetryExecutor>, deadline: Duration) -> Self {
        Self {
            inner,
            executor,
            deadline,
        }
    }
}

#[async_trait]
impl Connector for Throttled {
    fn source(&self) -> Source {
        self.inner.source()
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError> {
        self.executor
            .execute(self.source(), self.deadline, || self.inner.search(query))
            .await
    }

    async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        self.executor
            .execute(self.source(), self.deadline, || self.inner.fetch_metadata(id))
            .await
    }

    async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
        self.executor
            .execute(self.source(), self.deadline, || self.inner.fetch_fulltext(id))
            .await
    }

    async fn fetch_citations(
        &self,
        id: &PaperId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError> {
        self.executor
            .execute(self.source(), self.deadline, || {
                self.inner.fetch_citations(id, direction, limit)
            })
            .await
    }
}
