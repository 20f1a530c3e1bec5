use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arsenal_common::descriptor::BoundArgs;
use arsenal_common::{
    fingerprint, CoreConfig, DescriptorRegistry, InvocationRequest, InvocationState, InvokeError,
    InvokeResult, Outcome, ToolDescriptor,
};
use arsenal_runner::{baseline_env, LineHook, RunSpec, Runner};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Phase, ProgressBroker, ProgressEvent};
use crate::cache::{CacheStats, Lookup, ProducerHandle, ResultCache};
use crate::invocation::{InvocationRecord, StatusView};
use crate::lock;
use crate::pool::{PoolStats, WorkerPool};

/// What `submit` hands back: the handle to poll, wait on, stream or
/// cancel.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub handle: Uuid,
    pub fingerprint: String,
    pub state: InvocationState,
    pub cached: bool,
}

/// The contract boundary for submitting work: validate, canonicalise,
/// fingerprint, consult the cache, enqueue, hand back a handle.
pub struct Dispatcher {
    config: CoreConfig,
    registry: DescriptorRegistry,
    cache: ResultCache,
    pool: WorkerPool,
    broker: Arc<ProgressBroker>,
    runner: Arc<dyn Runner>,
    records: Mutex<HashMap<Uuid, Arc<InvocationRecord>>>,
    attempts: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: CoreConfig,
        registry: DescriptorRegistry,
        runner: Arc<dyn Runner>,
    ) -> InvokeResult<Self> {
        let cache = ResultCache::new(config.cache.clone()).map_err(InvokeError::internal)?;
        let pool = WorkerPool::new(
            config.max_global_concurrency,
            config.queue_capacity,
            config.admission_policy,
            config.class_caps.clone(),
        )
        .map_err(InvokeError::internal)?;
        let broker = Arc::new(ProgressBroker::new(
            256,
            Duration::from_millis(config.grace_period_ms.max(1)),
        ));
        info!(
            workers = config.max_global_concurrency,
            queue_capacity = config.queue_capacity,
            tools = registry.len(),
            "dispatcher ready"
        );
        Ok(Dispatcher {
            config,
            registry,
            cache,
            pool,
            broker,
            runner,
            records: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn submit(&self, request: InvocationRequest) -> InvokeResult<SubmitReceipt> {
        let descriptor = self.registry.get(&request.tool)?;
        let bound = descriptor.bind_args(&request.args, self.config.workspace_root.as_deref())?;
        let stdin = match &request.options.stdin {
            Some(encoded) => Some(STANDARD.decode(encoded).map_err(|err| {
                InvokeError::BadRequest(format!("stdin is not valid base64: {}", err))
            })?),
            None => None,
        };
        let fingerprint = fingerprint(&descriptor, &bound, stdin.as_deref());
        let timeout = Duration::from_millis(
            request
                .options
                .timeout_ms
                .unwrap_or(descriptor.default_timeout_ms),
        );

        self.sweep_records();
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        match self.cache.reserve(fingerprint.clone(), request.options.cache) {
            Lookup::Hit(outcome) => {
                let record = InvocationRecord::new(
                    fingerprint,
                    &request.tool,
                    &request.correlation_id,
                    attempt,
                    true,
                );
                self.broker.open(record.id);
                self.broker.emit(record.id, Phase::Queued, "queued", None);
                record.resolve(Ok(outcome));
                emit_terminal(&self.broker, &record);
                info!(
                    tool = %record.tool,
                    fingerprint = %record.fingerprint.short(),
                    "served from cache"
                );
                let receipt = receipt_of(&record);
                lock(&self.records).insert(record.id, record);
                Ok(receipt)
            }
            Lookup::Join(flight) => {
                let record = InvocationRecord::new(
                    fingerprint,
                    &request.tool,
                    &request.correlation_id,
                    attempt,
                    false,
                );
                self.broker.open(record.id);
                self.broker.emit(record.id, Phase::Queued, "queued", None);
                debug!(
                    tool = %record.tool,
                    fingerprint = %record.fingerprint.short(),
                    "joined in-flight invocation"
                );
                {
                    let record = record.clone();
                    let broker = self.broker.clone();
                    flight.attach(Box::new(move |result| {
                        record.resolve(result.clone());
                        emit_terminal(&broker, &record);
                    }));
                }
                let receipt = receipt_of(&record);
                lock(&self.records).insert(record.id, record);
                Ok(receipt)
            }
            Lookup::Reserved(producer) => {
                let record = InvocationRecord::new(
                    fingerprint,
                    &request.tool,
                    &request.correlation_id,
                    attempt,
                    false,
                );
                self.broker.open(record.id);
                self.broker.emit(record.id, Phase::Queued, "queued", None);

                let producer_cell = Arc::new(Mutex::new(Some(producer)));
                let job = {
                    let cell = producer_cell.clone();
                    let cache = self.cache.clone();
                    let broker = self.broker.clone();
                    let runner = self.runner.clone();
                    let ctx = JobCtx {
                        record: record.clone(),
                        descriptor: descriptor.clone(),
                        bound,
                        stdin,
                        timeout,
                        grace: Duration::from_millis(self.config.grace_period_ms),
                        capture_limit: self.config.capture_limit_bytes,
                        workspace_root: self.config.workspace_root.clone(),
                    };
                    Box::new(move || run_job(&cache, &broker, runner.as_ref(), &cell, ctx))
                        as crate::pool::Job
                };

                let admission_deadline = Instant::now() + timeout;
                match self
                    .pool
                    .submit(&descriptor.class, attempt, Some(admission_deadline), job)
                {
                    Ok(()) => {
                        let receipt = receipt_of(&record);
                        lock(&self.records).insert(record.id, record);
                        Ok(receipt)
                    }
                    Err(err) => {
                        if let Some(producer) = lock(&producer_cell).take() {
                            self.cache.abandon(producer, err.clone());
                        }
                        record.resolve(Err(err.clone()));
                        emit_terminal(&self.broker, &record);
                        warn!(tool = %record.tool, "admission refused: {}", err);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Blocks until the invocation is terminal, or fails with
    /// `deadline-exceeded`. None for an unknown or retired handle.
    pub fn wait(
        &self,
        handle: Uuid,
        deadline: Option<Instant>,
    ) -> Option<InvokeResult<Arc<Outcome>>> {
        self.sweep_records();
        let record = lock(&self.records).get(&handle).cloned()?;
        Some(record.wait(deadline))
    }

    pub fn status(&self, handle: Uuid) -> Option<StatusView> {
        self.sweep_records();
        lock(&self.records)
            .get(&handle)
            .map(|record| record.snapshot())
    }

    /// Idempotent. Queued work is dequeued and resolved `cancelled`;
    /// running work is signalled through its cancel token and the
    /// runner terminates it. False only for an unknown handle.
    pub fn cancel(&self, handle: Uuid) -> bool {
        let record = match lock(&self.records).get(&handle) {
            Some(record) => record.clone(),
            None => return false,
        };
        if record.state().is_terminal() {
            return true;
        }
        record.cancel.cancel();
        if self.pool.cancel(record.attempt) {
            record.resolve(Err(InvokeError::Cancelled));
            emit_terminal(&self.broker, &record);
            info!(tool = %record.tool, handle = %record.id, "cancelled while queued");
        } else {
            info!(tool = %record.tool, handle = %record.id, "cancellation signalled");
        }
        true
    }

    pub fn subscribe(
        &self,
        handle: Uuid,
    ) -> Option<(Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>)> {
        self.broker.subscribe(handle)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.registry.names()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Terminal records outlive their invocation by the grace window
    /// so late status polls and subscribers still land; swept lazily
    /// on submit and on every lookup, so an idle daemon retires them
    /// too.
    fn sweep_records(&self) {
        let grace = Duration::from_millis(self.config.grace_period_ms.max(1));
        lock(&self.records).retain(|_, record| match record.finished_at() {
            Some(at) => at.elapsed() < grace,
            None => true,
        });
    }
}

struct JobCtx {
    record: Arc<InvocationRecord>,
    descriptor: Arc<ToolDescriptor>,
    bound: BoundArgs,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    grace: Duration,
    capture_limit: usize,
    workspace_root: Option<PathBuf>,
}

fn run_job(
    cache: &ResultCache,
    broker: &Arc<ProgressBroker>,
    runner: &dyn Runner,
    producer_cell: &Mutex<Option<ProducerHandle>>,
    ctx: JobCtx,
) {
    let Some(producer) = lock(producer_cell).take() else {
        return;
    };

    match catch_unwind(AssertUnwindSafe(|| execute(broker, runner, &ctx))) {
        Ok(Ok(outcome)) => {
            let outcome = cache.publish(producer, outcome);
            ctx.record.resolve(Ok(outcome));
        }
        Ok(Err(err)) => {
            cache.abandon(producer, err.clone());
            ctx.record.resolve(Err(err));
        }
        Err(_) => {
            let err = InvokeError::internal("worker panicked while executing the invocation");
            error!(tool = %ctx.record.tool, "invocation panicked");
            cache.abandon(producer, err.clone());
            ctx.record.resolve(Err(err));
        }
    }
    emit_terminal(broker, &ctx.record);
}

fn execute(broker: &Arc<ProgressBroker>, runner: &dyn Runner, ctx: &JobCtx) -> InvokeResult<Outcome> {
    if ctx.record.cancel.is_cancelled() {
        debug!(tool = %ctx.record.tool, "cancelled before start");
        return Err(InvokeError::Cancelled);
    }
    ctx.record.mark_running();
    broker.emit(ctx.record.id, Phase::Running, "running", None);

    let env = baseline_env(ctx.workspace_root.as_deref(), &ctx.descriptor.env)
        .map_err(InvokeError::internal)?;
    let working_dir = ctx
        .descriptor
        .working_dir
        .clone()
        .or_else(|| ctx.workspace_root.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    let spec = RunSpec {
        program: ctx.descriptor.program.clone(),
        args: ctx.descriptor.render_argv(&ctx.bound),
        working_dir,
        env,
        stdin: ctx.stdin.clone(),
        timeout: ctx.timeout,
        grace: ctx.grace,
        capture_limit: ctx.capture_limit,
    };

    let hook: LineHook = {
        let broker = broker.clone();
        let id = ctx.record.id;
        Arc::new(move |line: String| broker.emit(id, Phase::Progress, line, None))
    };

    let run = runner.run(spec, &ctx.record.cancel, Some(hook));
    info!(
        tool = %ctx.record.tool,
        fingerprint = %ctx.record.fingerprint.short(),
        termination = run.termination.as_str(),
        exit_code = ?run.exit_code,
        duration_ms = run.duration_ms,
        "invocation finished"
    );

    Ok(Outcome {
        fingerprint: ctx.record.fingerprint.clone(),
        tool: ctx.record.tool.clone(),
        exit_code: run.exit_code,
        termination: run.termination,
        signal: run.signal,
        stdout: run.stdout,
        stderr: run.stderr,
        started_at: run.started_at,
        ended_at: run.ended_at,
        duration_ms: run.duration_ms,
        peak_rss_kb: run.peak_rss_kb,
    })
}

fn receipt_of(record: &InvocationRecord) -> SubmitReceipt {
    SubmitReceipt {
        handle: record.id,
        fingerprint: record.fingerprint.to_string(),
        state: record.state(),
        cached: record.cached,
    }
}

fn emit_terminal(broker: &ProgressBroker, record: &InvocationRecord) {
    let payload = record.outcome().map(|outcome| {
        serde_json::json!({
            "exit_code": outcome.exit_code,
            "termination": outcome.termination,
        })
    });
    broker.emit(record.id, Phase::Terminal, record.state().as_str(), payload);
}
