//! Orchestrator Loop (C8): the worker-scoped scheduler tying the Lease
//! Manager, Priority Queue, Trigger Resolver, Run Store, and Handler
//! Registry together.
//!
//! Each tick pulls due triggers and ready retries off their respective
//! sources, races a lease acquisition per candidate, and dispatches a
//! bounded number of handler executions concurrently. The concurrency
//! cap, completion-signaling channel, and cancellation-with-drain-deadline
//! shutdown sequence follow the same shape as a long-lived worker loop
//! managing a pool of concurrent jobs.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbit_db::models::{ErrorKind, Run, Trigger};
use orbit_db::queries::leases as lease_db;

use crate::clock::Clock;
use crate::error::{CoreError, ErrCtx};
use crate::handler::{HandlerOutcome, HandlerRegistry, RunView, TriggerView};
use crate::lease::{self, LeaseOutcome, SCHEDULED_TRIGGER};
use crate::priority_queue::PriorityQueue;
use crate::resolver;
use crate::run_store;
use crate::trigger_store;

/// Worker-scoped orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick_interval: StdDuration,
    pub max_concurrent_runs_per_worker: usize,
    pub lease_duration: Duration,
    pub worker_id: String,
    /// How long `shutdown` waits for in-flight runs to finish before giving
    /// up and leaving them `running` for the next start's orphan recovery.
    pub shutdown_grace: StdDuration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(5),
            max_concurrent_runs_per_worker: 10,
            lease_duration: Duration::seconds(300),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            shutdown_grace: StdDuration::from_secs(10),
        }
    }
}

/// Outcome of running the orchestrator loop until cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorResult {
    Cancelled,
}

/// Completion signal sent from a spawned dispatch task back to the loop.
struct RunDone {
    trigger_id: Uuid,
}

/// `delay = min(max_delay?, base_delay * multiplier^attempt) * jitter`,
/// `jitter` supplied by the caller so the formula itself is a pure,
/// exhaustively testable function (property 4: 1000 trials land in the
/// expected envelope).
pub fn compute_retry_delay_seconds(
    base_delay_seconds: i32,
    backoff_multiplier: f64,
    attempt: i32,
    max_delay_seconds: Option<i32>,
    jitter: f64,
) -> f64 {
    let raw = base_delay_seconds as f64 * backoff_multiplier.powi(attempt.max(0));
    let capped = match max_delay_seconds {
        Some(max) => raw.min(max as f64),
        None => raw,
    };
    capped * jitter
}

/// `jitter(0.8..=1.2)` drawn from the process RNG.
fn random_jitter() -> f64 {
    0.8 + 0.4 * rand::random::<f64>()
}

/// The worker-scoped orchestrator. One instance per worker process; the
/// queue, handler registry, and pool are shared with whatever else in
/// the process reads them (e.g. the HTTP surface).
pub struct Orchestrator {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    queue: Arc<PriorityQueue>,
    handlers: Arc<HandlerRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        clock: Arc<dyn Clock>,
        queue: Arc<PriorityQueue>,
        handlers: Arc<HandlerRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            clock,
            queue,
            handlers,
            config,
        }
    }

    /// Recover runs left `running` by a worker that crashed without
    /// releasing its lease: any such run whose lease is gone or expired is
    /// routed through the same retry-or-terminal path a handler failure
    /// takes, never silently resumed in place.
    pub async fn recover_orphaned_runs(&self) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let stalled = run_store::fetch_stalled(&self.pool, now, 500).await?;
        let mut recovered = 0;
        for run in stalled {
            let lease_alive = match run.lease_id {
                Some(lease_id) => lease_db::get(&self.pool, lease_id)
                    .await
                    .map_err(|e| CoreError::internal(e.to_string(), crate::error::ErrCtx::run(run.id)))?
                    .is_some_and(|l| l.is_alive(now)),
                None => false,
            };
            if lease_alive {
                continue;
            }
            self.conclude_failed_run(&run, ErrorKind::Timeout, "worker crashed or lease expired before completion")
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Run the loop until `cancel` fires, then drain in-flight dispatches
    /// up to `shutdown_grace` before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<OrchestratorResult, CoreError> {
        self.recover_orphaned_runs().await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_runs_per_worker));
        let (tx, mut rx) = mpsc::channel::<RunDone>(self.config.max_concurrent_runs_per_worker * 2);
        let mut in_flight: usize = 0;
        let mut ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    tracing::info!(worker_id = %self.config.worker_id, "orchestrator cancelled, draining in-flight runs");
                    let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
                    while in_flight > 0 {
                        match tokio::time::timeout_at(deadline, rx.recv()).await {
                            Ok(Some(_done)) => in_flight -= 1,
                            _ => break,
                        }
                    }
                    if in_flight > 0 {
                        tracing::warn!(
                            worker_id = %self.config.worker_id,
                            remaining = in_flight,
                            "shutdown grace period expired with runs still in flight"
                        );
                    }
                    return Ok(OrchestratorResult::Cancelled);
                }
            }

            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                tracing::debug!(trigger_id = %done.trigger_id, "run dispatch completed");
            }

            if in_flight >= self.config.max_concurrent_runs_per_worker {
                continue;
            }

            let capacity = self.config.max_concurrent_runs_per_worker - in_flight;
            let mut due = self.claim_due_triggers(capacity).await?;
            let remaining = capacity - due.len();
            if remaining > 0 {
                due.extend(self.claim_ready_retries(remaining).await?);
            }
            let remaining = capacity - due.len();
            if remaining > 0 {
                due.extend(self.claim_pending_manual_runs(remaining).await?);
            }

            for (trigger, run) in due {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                in_flight += 1;
                self.spawn_dispatch(trigger, run, permit, tx.clone());
            }
        }
    }

    /// Pop up to `capacity` due triggers off the queue and attempt a lease
    /// on each; only leased triggers get a run record and are returned for
    /// dispatch.
    async fn claim_due_triggers(&self, capacity: usize) -> Result<Vec<(Trigger, Run)>, CoreError> {
        let mut dispatchable = Vec::new();
        for _ in 0..capacity {
            let Some(trigger) = self.queue.pop().await? else {
                break;
            };
            let outcome = lease::acquire(
                &self.pool,
                self.clock.as_ref(),
                SCHEDULED_TRIGGER,
                &trigger.id.to_string(),
                self.config.lease_duration,
                &self.config.worker_id,
                None,
                false,
                0,
                None,
            )
            .await?;
            let LeaseOutcome::Acquired(acquired) = outcome else {
                // Another worker already owns this trigger's lease; let it
                // go, the filler will re-offer it later if it becomes due
                // again.
                continue;
            };
            if !trigger_store::try_increment_current_runs(&self.pool, trigger.id).await? {
                // Lost the concurrency-cap race between fetch_due and here;
                // give the lease back rather than dispatch over the cap.
                let _ = lease::release(&self.pool, self.clock.as_ref(), acquired.lease_id, &self.config.worker_id).await;
                continue;
            }

            let now = self.clock.now();
            let run = run_store::create(&self.pool, trigger.id, now, trigger.task_parameters.clone(), trigger.max_retries).await?;
            run_store::mark_queued(&self.pool, run.id, acquired.lease_id).await?;

            if let Err(e) = self.advance_schedule(&trigger, now).await {
                tracing::warn!(trigger_id = %trigger.id, error = %e, "failed to advance trigger schedule");
            }

            dispatchable.push((trigger, run));
        }
        Ok(dispatchable)
    }

    /// Pop up to `capacity` runs whose `next_retry_at` has elapsed and
    /// attempt a lease + concurrency slot for each, mirroring
    /// `claim_due_triggers` but sourced from the Run Store's retry queue
    /// instead of the Priority Queue. A run whose trigger is at its
    /// concurrency cap or whose lease is still held by another worker is
    /// left `retrying`; the next tick retries the claim.
    async fn claim_ready_retries(&self, capacity: usize) -> Result<Vec<(Trigger, Run)>, CoreError> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let ready = run_store::fetch_ready_retries(&self.pool, now, capacity as i64).await?;

        let mut dispatchable = Vec::new();
        for run in ready {
            let trigger = match trigger_store::get(&self.pool, run.trigger_id).await {
                Ok(t) => t,
                Err(CoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !matches!(trigger.status, orbit_db::models::TriggerStatus::Active) {
                continue;
            }

            let outcome = lease::acquire(
                &self.pool,
                self.clock.as_ref(),
                SCHEDULED_TRIGGER,
                &trigger.id.to_string(),
                self.config.lease_duration,
                &self.config.worker_id,
                None,
                false,
                0,
                None,
            )
            .await?;
            let LeaseOutcome::Acquired(acquired) = outcome else {
                continue;
            };

            if !trigger_store::try_increment_current_runs(&self.pool, trigger.id).await? {
                let _ = lease::release(&self.pool, self.clock.as_ref(), acquired.lease_id, &self.config.worker_id).await;
                continue;
            }

            run_store::mark_queued(&self.pool, run.id, acquired.lease_id).await?;
            dispatchable.push((trigger, run));
        }
        Ok(dispatchable)
    }

    /// Pop up to `capacity` unleased `pending` runs and attempt a lease +
    /// concurrency slot for each, mirroring `claim_ready_retries` but sourced
    /// from runs created by [`manual_fire`] rather than a schedule or a
    /// retry. Left `pending` (and re-tried next tick) if the trigger is
    /// inactive, at its concurrency cap, or another worker holds its lease.
    async fn claim_pending_manual_runs(&self, capacity: usize) -> Result<Vec<(Trigger, Run)>, CoreError> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let pending = run_store::fetch_pending_unleased(&self.pool, now, capacity as i64).await?;

        let mut dispatchable = Vec::new();
        for run in pending {
            let trigger = match trigger_store::get(&self.pool, run.trigger_id).await {
                Ok(t) => t,
                Err(CoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !matches!(trigger.status, orbit_db::models::TriggerStatus::Active) {
                continue;
            }

            let outcome = lease::acquire(
                &self.pool,
                self.clock.as_ref(),
                SCHEDULED_TRIGGER,
                &trigger.id.to_string(),
                self.config.lease_duration,
                &self.config.worker_id,
                None,
                false,
                0,
                None,
            )
            .await?;
            let LeaseOutcome::Acquired(acquired) = outcome else {
                continue;
            };

            if !trigger_store::try_increment_current_runs(&self.pool, trigger.id).await? {
                let _ = lease::release(&self.pool, self.clock.as_ref(), acquired.lease_id, &self.config.worker_id).await;
                continue;
            }

            run_store::mark_queued(&self.pool, run.id, acquired.lease_id).await?;
            dispatchable.push((trigger, run));
        }
        Ok(dispatchable)
    }

    /// Compute and persist this trigger's next fire time via the
    /// Resolver, guarded by its optimistic `version`.
    async fn advance_schedule(&self, trigger: &Trigger, now: chrono::DateTime<Utc>) -> Result<(), CoreError> {
        use orbit_db::models::TriggerKind;
        let next = match trigger.kind {
            TriggerKind::TimeBased => resolver::next_fire_time_based(trigger, now)?,
            TriggerKind::Interval => Some(resolver::next_fire_interval(trigger, now)?),
            // Event, dependency, conditional, manual, and webhook triggers
            // are one-shot per activation; they have no self-driven next
            // fire time.
            TriggerKind::Event | TriggerKind::Dependency | TriggerKind::Conditional | TriggerKind::Manual | TriggerKind::Webhook => None,
        };
        trigger_store::bump_fire(&self.pool, trigger.id, trigger.version, next, now).await?;
        Ok(())
    }

    /// Spawn the handler dispatch for a freshly leased trigger. Always
    /// reports completion on `tx` and always releases the lease, on every
    /// return path through the `match` below.
    fn spawn_dispatch(&self, trigger: Trigger, run: Run, permit: tokio::sync::OwnedSemaphorePermit, tx: mpsc::Sender<RunDone>) {
        let pool = self.pool.clone();
        let clock = Arc::clone(&self.clock);
        let handlers = Arc::clone(&self.handlers);
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let trigger_id = trigger.id;

            let Some(lease_id) = run.lease_id else {
                tracing::error!(run_id = %run.id, "queued run has no lease_id");
                let _ = tx.send(RunDone { trigger_id }).await;
                return;
            };

            let succeeded = dispatch_and_conclude(&pool, clock.as_ref(), &trigger, &run, lease_id, handlers.as_ref(), &worker_id).await;

            let _ = lease::release(&pool, clock.as_ref(), lease_id, &worker_id).await;
            let _ = trigger_store::decrement_current_runs(&pool, trigger_id, succeeded).await;
            let _ = tx.send(RunDone { trigger_id }).await;
        });
    }

    /// Conclude a run that was found orphaned at startup, applying the
    /// same retry-or-terminal decision a live handler failure would.
    ///
    /// The worker that owned this run never reached `spawn_dispatch`'s
    /// cleanup, so its `current_runs` slot on the trigger is still held;
    /// release it here the same way a live dispatch's failure path does,
    /// or it leaks for the trigger's lifetime.
    async fn conclude_failed_run(&self, run: &Run, kind: ErrorKind, message: &str) -> Result<(), CoreError> {
        let trigger = trigger_store::get(&self.pool, run.trigger_id).await?;
        finish_with_retry_decision(&self.pool, self.clock.as_ref(), &trigger, run, kind, message, None).await?;
        trigger_store::decrement_current_runs(&self.pool, run.trigger_id, false).await?;
        Ok(())
    }
}

/// Accept a manual fire for `trigger_id`: insert a `pending` run scheduled
/// for `now`, independent of the trigger's own schedule. The run is not
/// dispatched inline -- the next worker tick's `claim_pending_manual_runs`
/// picks it up, same as any other capacity-gated dispatch -- so this
/// returns as soon as the row is durable, matching the `202 Accepted`
/// contract of the manual-fire HTTP operation.
pub async fn manual_fire(pool: &PgPool, clock: &dyn Clock, trigger_id: Uuid) -> Result<Run, CoreError> {
    let trigger = trigger_store::get(pool, trigger_id).await?;
    if !matches!(trigger.status, orbit_db::models::TriggerStatus::Active) {
        return Err(CoreError::conflict(
            "trigger must be active to fire manually",
            ErrCtx::trigger(trigger_id),
        ));
    }
    let now = clock.now();
    run_store::create(pool, trigger.id, now, trigger.task_parameters.clone(), trigger.max_retries).await
}

/// Whether the lease this dispatch was granted is still held by `worker_id`.
/// If not -- another worker acquired it after it expired mid-execution --
/// the run is marked `cancelled` and its result discarded rather than
/// overwriting whatever the new owner is doing.
async fn lease_lost_during_execution(pool: &PgPool, clock: &dyn Clock, run: &Run, lease_id: Uuid, worker_id: &str) -> bool {
    match lease::is_owned_by(pool, clock, lease_id, worker_id).await {
        Ok(true) => false,
        Ok(false) => {
            tracing::warn!(run_id = %run.id, "lease ownership lost during execution; discarding result as cancelled");
            let _ = run_store::mark_cancelled(pool, run.id).await;
            true
        }
        Err(e) => {
            tracing::warn!(run_id = %run.id, error = %e, "failed to verify lease ownership; proceeding optimistically");
            false
        }
    }
}

/// Run the handler for `run` against `trigger`, enforcing
/// `max_exec_seconds` via a timeout plus cooperative cancellation, then
/// record the outcome (completed, retried, or terminally failed).
///
/// Before writing a terminal status for a successful or failed result,
/// re-verifies that `lease_id` is still held by `worker_id` -- a handler
/// that outlives its lease may finish after another worker has already
/// picked the trigger back up.
async fn dispatch_and_conclude(
    pool: &PgPool,
    clock: &dyn Clock,
    trigger: &Trigger,
    run: &Run,
    lease_id: Uuid,
    handlers: &HandlerRegistry,
    worker_id: &str,
) -> bool {
    if let Err(e) = run_store::mark_started(pool, run.id, worker_id).await {
        tracing::error!(run_id = %run.id, error = %e, "failed to mark run started");
        return false;
    }
    // mark_started bumped attempt by one; reflect that locally so the
    // retry decision below sees the attempt just consumed.
    let mut run = run.clone();
    run.attempt += 1;

    let Some(handler) = handlers.get(&trigger.task_type) else {
        let _ = finish_with_retry_decision(
            pool,
            clock,
            trigger,
            &run,
            ErrorKind::NoHandler,
            &format!("no handler registered for task_type {:?}", trigger.task_type),
            None,
        )
        .await;
        return false;
    };

    let trigger_view = TriggerView::from(trigger);
    let run_view = RunView {
        run_id: run.id,
        attempt: run.attempt,
        max_exec_seconds: trigger.max_exec_seconds,
    };
    let cancel = CancellationToken::new();
    let exec = handler.execute(&trigger_view, &run_view, cancel.child_token());

    let outcome = tokio::time::timeout(StdDuration::from_secs(trigger.max_exec_seconds as u64), exec).await;

    match outcome {
        Ok(HandlerOutcome::Ok(result)) => {
            if lease_lost_during_execution(pool, clock, &run, lease_id, worker_id).await {
                return false;
            }
            if let Err(e) = run_store::mark_completed(pool, run.id, result).await {
                tracing::error!(run_id = %run.id, error = %e, "failed to mark run completed");
                return false;
            }
            true
        }
        Ok(HandlerOutcome::Err(failure)) => {
            if lease_lost_during_execution(pool, clock, &run, lease_id, worker_id).await {
                return false;
            }
            let _ = finish_with_retry_decision(pool, clock, trigger, &run, failure.kind, &failure.message, failure.details).await;
            false
        }
        Err(_elapsed) => {
            cancel.cancel();
            let _ = finish_with_retry_decision(
                pool,
                clock,
                trigger,
                &run,
                ErrorKind::Timeout,
                &format!("run exceeded max_exec_seconds ({})", trigger.max_exec_seconds),
                None,
            )
            .await;
            false
        }
    }
}

/// `NO_HANDLER` is terminal on first sight -- no amount of retrying
/// registers a handler that doesn't exist -- every other failure kind
/// retries up to `trigger.max_retries` before becoming terminal.
async fn finish_with_retry_decision(
    pool: &PgPool,
    clock: &dyn Clock,
    trigger: &Trigger,
    run: &Run,
    kind: ErrorKind,
    message: &str,
    details: Option<serde_json::Value>,
) -> Result<(), CoreError> {
    if kind == ErrorKind::NoHandler || run.attempt > trigger.max_retries {
        run_store::mark_failed(pool, run.id, kind, message, details).await?;
        return Ok(());
    }

    // `run.attempt` was bumped by `mark_started` to the 1-based count of the
    // attempt that just failed; the backoff exponent is the 0-based index
    // of that attempt, i.e. `run.attempt - 1`.
    let delay_seconds = compute_retry_delay_seconds(
        trigger.base_delay_seconds,
        trigger.backoff_multiplier,
        run.attempt - 1,
        trigger.max_delay_seconds,
        random_jitter(),
    );
    let next_retry_at = clock.now() + Duration::milliseconds((delay_seconds * 1000.0) as i64);
    run_store::schedule_retry(pool, run.id, next_retry_at, message, delay_seconds).await?;
    Ok(())
}
