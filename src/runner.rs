// src/runner.rs

//! Job-execution loop on top of the key pool.
//!
//! Each job keeps one key for its duration, fails over when the remote call
//! reports a quota or auth problem, and backs off on transient errors
//! without touching pool state. Every wait races the caller's
//! [`CancellationToken`].

use crate::config::{AppConfig, QuotaPolicy};
use crate::error::{AppError, Result};
use crate::generator::{CallError, ContentGenerator, GenerationRequest, GenerationResponse};
use crate::key_pool::{JobId, KeyAssignment, KeyLease, KeyPool, KeyStatus};
use crate::retry::RetryPolicy;
use crate::tokenizer::estimate_request_cost;
use secrecy::SecretString;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

const DEFAULT_LEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub retry: RetryPolicy,
    pub quota_policy: QuotaPolicy,
    pub exclusive_leases: bool,
    pub max_concurrent_jobs: usize,
    /// How often a job re-checks for a free key while all are leased.
    pub lease_poll_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            quota_policy: QuotaPolicy::Permanent,
            exclusive_leases: true,
            max_concurrent_jobs: 4,
            lease_poll_interval: DEFAULT_LEASE_POLL_INTERVAL,
        }
    }
}

impl From<&AppConfig> for RunnerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            quota_policy: config.pool.quota_policy,
            exclusive_leases: config.pool.exclusive_leases,
            max_concurrent_jobs: config.runner.max_concurrent_jobs,
            lease_poll_interval: DEFAULT_LEASE_POLL_INTERVAL,
        }
    }
}

/// A successfully generated job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub job_id: JobId,
    pub key_index: usize,
    pub attempts: u32,
    pub tokens: u64,
    pub text: String,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub result: Result<JobOutput>,
}

enum Headroom {
    Ready(usize),
    WaitOn(usize),
}

/// The key a single attempt runs with.
enum HeldKey<'a> {
    Leased(KeyLease<'a>),
    Shared(KeyAssignment),
}

impl HeldKey<'_> {
    fn index(&self) -> usize {
        match self {
            Self::Leased(lease) => lease.index(),
            Self::Shared(assignment) => assignment.index,
        }
    }

    fn key(&self) -> &SecretString {
        match self {
            Self::Leased(lease) => lease.key(),
            Self::Shared(assignment) => &assignment.key,
        }
    }
}

pub struct JobRunner {
    pool: Arc<KeyPool>,
    generator: Arc<dyn ContentGenerator>,
    options: RunnerOptions,
}

impl JobRunner {
    pub fn new(pool: Arc<KeyPool>, generator: Arc<dyn ContentGenerator>, options: RunnerOptions) -> Self {
        Self {
            pool,
            generator,
            options,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Runs one job to completion, failure or cancellation. The job's
    /// assignment is dropped from the pool either way.
    #[instrument(skip_all, fields(job_id = job.get()))]
    pub async fn run_job(
        &self,
        job: JobId,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<JobOutput> {
        let cost = estimate_request_cost(request);
        let result = match self.pool.assign_key_to_job(job) {
            Ok(assignment) => {
                debug!(key.index = assignment.index, estimated_cost = cost, "Job started");
                self.attempt_loop(job, request, cost, cancel).await
            }
            Err(e) => Err(e),
        };
        self.pool.complete_job(job);

        match &result {
            Ok(output) => info!(
                key.index = output.key_index,
                attempts = output.attempts,
                tokens = output.tokens,
                "Job completed"
            ),
            Err(e) => e.log(Some(job.get())),
        }
        result
    }

    async fn attempt_loop(
        &self,
        job: JobId,
        request: &GenerationRequest,
        cost: u64,
        cancel: &CancellationToken,
    ) -> Result<JobOutput> {
        let policy = &self.options.retry;
        let mut failover: Option<usize> = None;
        let mut last_error: Option<CallError> = None;
        let mut attempt = 0;

        while attempt < policy.max_attempts {
            attempt += 1;

            let held = self
                .select_key(job, failover.take(), cost, cancel)
                .await
                .map_err(|e| with_cause(job, &last_error, e))?;
            let index = held.index();

            debug!(attempt, key.index = index, "Calling content generator");
            let outcome = self.call(job, held.key(), request, cancel).await;
            drop(held);
            let outcome = match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => {
                    self.pool.settle_usage(index, cost, 0)?;
                    Err(err)
                }
                Err(cancelled) => {
                    self.pool.settle_usage(index, cost, 0)?;
                    return Err(cancelled);
                }
            };

            match outcome {
                Ok(response) => return self.record_success(job, index, attempt, cost, response),
                Err(err) if err.is_key_failure() => {
                    warn!(attempt, key.index = index, error = %err, "Key rejected by provider; failing over");
                    self.report_key_failure(index, &err)?;
                    failover = match self.pool.get_next_available_key(Some(index)) {
                        Ok(next) => Some(next.index),
                        Err(AppError::PoolExhausted) if self.pool.healthy_count() == 0 => {
                            return Err(AppError::JobFailed {
                                job_id: job.get(),
                                cause: err,
                                source: Box::new(AppError::PoolExhausted),
                            });
                        }
                        Err(_) => None,
                    };
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!(attempt, key.index = index, error = %err, "Remote call failed; retrying with the same key");
                    last_error = Some(err);
                    if policy.has_attempts_left(attempt) {
                        self.sleep(job, policy.delay_for_attempt(attempt), cancel).await?;
                    }
                }
            }
        }

        Err(AppError::RetriesExhausted {
            job_id: job.get(),
            attempts: attempt,
            last_error: last_error
                .unwrap_or_else(|| CallError::Transient("no attempt was made".to_string())),
        })
    }

    /// Resolves the key for the next attempt and books the estimated cost
    /// against it. Every pass re-reads pool state, so a key that failed or
    /// filled up while this job slept is never used.
    async fn select_key(
        &self,
        job: JobId,
        failover: Option<usize>,
        cost: u64,
        cancel: &CancellationToken,
    ) -> Result<HeldKey<'_>> {
        let mut preferred = failover;
        loop {
            let candidate = match preferred.take() {
                Some(index) if self.pool.status(index)? != KeyStatus::Failed => index,
                _ => self.pool.get_key_for_job(job)?.index,
            };

            if self.options.exclusive_leases {
                if let Some(lease) = self.try_lease(candidate, cost)? {
                    return Ok(HeldKey::Leased(lease));
                }
            } else {
                match self.reserve(candidate, cost)? {
                    Headroom::Ready(index) => match self.pool.healthy_key_at(index) {
                        Ok(assignment) => return Ok(HeldKey::Shared(assignment)),
                        Err(AppError::KeyFailed { .. }) => {
                            self.pool.settle_usage(index, cost, 0)?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                    Headroom::WaitOn(index) => {
                        self.wait_for_window(job, index, cost, cancel).await?;
                        continue;
                    }
                }
            }

            match self.window_to_wait_on(cost)? {
                Some(index) => self.wait_for_window(job, index, cost, cancel).await?,
                None => {
                    debug!(key.index = candidate, "All healthy keys with headroom are leased; waiting");
                    self.sleep(job, self.options.lease_poll_interval, cancel).await?;
                }
            }
        }
    }

    /// Books `cost` on `index`, or on the best alternative with headroom.
    fn reserve(&self, index: usize, cost: u64) -> Result<Headroom> {
        if self.pool.reserve_usage(index, cost)? {
            return Ok(Headroom::Ready(index));
        }
        let best = self.pool.get_best_key_for_cost(cost, None)?;
        if best != index && self.pool.reserve_usage(best, cost)? {
            debug!(key.from = index, key.to = best, "Switching to a key with quota headroom");
            return Ok(Headroom::Ready(best));
        }
        Ok(Headroom::WaitOn(best))
    }

    /// Leases `index` if it is free and has headroom, else any other free
    /// key with headroom. `None` when nothing can be leased right now.
    fn try_lease(&self, index: usize, cost: u64) -> Result<Option<KeyLease<'_>>> {
        match self.pool.lease_key(index) {
            Ok(lease) => {
                if self.pool.reserve_usage(index, cost)? {
                    return Ok(Some(lease));
                }
            }
            Err(AppError::KeysBusy | AppError::KeyFailed { .. }) => {}
            Err(e) => return Err(e),
        }

        match self.pool.acquire_key_for_cost(cost, Some(index)) {
            Ok(lease) => {
                debug!(key.from = index, key.to = lease.index(), "Preferred key unavailable; leased another");
                Ok(Some(lease))
            }
            Err(AppError::KeysBusy | AppError::PoolExhausted) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// When no healthy key has room for `cost`, the key whose window
    /// resets soonest. `None` means some key has room but is leased.
    fn window_to_wait_on(&self, cost: u64) -> Result<Option<usize>> {
        let best = self.pool.get_best_key_for_cost(cost, None)?;
        if self.pool.can_handle(best, cost)? {
            Ok(None)
        } else {
            Ok(Some(best))
        }
    }

    async fn wait_for_window(&self, job: JobId, index: usize, cost: u64, cancel: &CancellationToken) -> Result<()> {
        let wait = self.pool.window_remaining(index)?;
        info!(
            key.index = index,
            wait_ms = wait.as_millis() as u64,
            estimated_cost = cost,
            "No key has quota headroom; waiting for the window to reset"
        );
        self.sleep(job, wait, cancel).await
    }

    async fn call(
        &self,
        job: JobId,
        key: &SecretString,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<GenerationResponse, CallError>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled { job_id: job.get() }),
            outcome = self.generator.generate(key, request) => Ok(outcome),
        }
    }

    fn report_key_failure(&self, index: usize, err: &CallError) -> Result<()> {
        match (err, self.options.quota_policy) {
            (CallError::Quota(_), QuotaPolicy::Windowed) => self.pool.saturate_window(index),
            _ => self.pool.mark_key_failed(index, &err.to_string()),
        }
    }

    fn record_success(
        &self,
        job: JobId,
        index: usize,
        attempts: u32,
        estimated_cost: u64,
        response: GenerationResponse,
    ) -> Result<JobOutput> {
        let tokens = response.total_tokens.unwrap_or(estimated_cost);
        self.pool.increment_usage(index)?;
        self.pool.settle_usage(index, estimated_cost, tokens)?;
        Ok(JobOutput {
            job_id: job,
            key_index: index,
            attempts,
            tokens,
            text: response.text,
        })
    }

    async fn sleep(&self, job: JobId, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled { job_id: job.get() }),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs every job concurrently, at most `max_concurrent_jobs` at once.
    /// Returns one outcome per job, ordered by job id; a failed job never
    /// affects the others.
    pub async fn run_all(
        self: Arc<Self>,
        jobs: Vec<(JobId, GenerationRequest)>,
        cancel: CancellationToken,
    ) -> Vec<JobOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_jobs.max(1)));
        let expected: Vec<JobId> = jobs.iter().map(|(job, _)| *job).collect();
        let mut tasks = JoinSet::new();

        info!(jobs = jobs.len(), concurrency = self.options.max_concurrent_jobs, "Starting job run");
        for (job, request) in jobs {
            let runner = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(
                async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => runner.run_job(job, &request, &cancel).await,
                        Err(_) => Err(AppError::internal("job semaphore closed")),
                    };
                    JobOutcome { job_id: job, result }
                }
                .in_current_span(),
            );
        }

        let mut outcomes = Vec::with_capacity(expected.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Job task aborted"),
            }
        }

        let finished: HashSet<JobId> = outcomes.iter().map(|o| o.job_id).collect();
        for job in expected.into_iter().filter(|job| !finished.contains(job)) {
            outcomes.push(JobOutcome {
                job_id: job,
                result: Err(AppError::internal("job task aborted before reporting")),
            });
        }

        outcomes.sort_by_key(|o| o.job_id);
        outcomes
    }
}

/// Wraps a pool error with the remote failure that led to it, if any.
fn with_cause(job: JobId, last_error: &Option<CallError>, err: AppError) -> AppError {
    match (last_error, err) {
        (Some(cause), err @ AppError::PoolExhausted) => AppError::JobFailed {
            job_id: job.get(),
            cause: cause.clone(),
            source: Box::new(err),
        },
        (_, err) => err,
    }
}
