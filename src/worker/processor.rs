use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::WorkerContext;
use crate::generator::{GenerateError, Generator};
use crate::job::{RetryConfig, Step, StepOutput, TaskRecord, WorkItem, WorkerResult, failure_text};
use crate::store::{ResultStore, StatusStore, task_result_key};

/// What to do after a failed generator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then call again.
    Retry { delay_ms: u64 },
    /// Record the failure; no further attempts.
    GiveUp,
}

/// Decide whether a failure that followed `retries_so_far` retries earns another attempt.
pub fn decide(policy: &RetryConfig, retries_so_far: u32, err: &GenerateError) -> RetryDecision {
    if !err.is_transient() || retries_so_far >= policy.max_retries {
        return RetryDecision::GiveUp;
    }
    let backoff = policy.delay_for_attempt(retries_so_far + 1);
    RetryDecision::Retry {
        delay_ms: backoff.max(err.retry_after_ms().unwrap_or(0)),
    }
}

/// Adds one to the job's progress counter when dropped, on every exit path
/// including panics, unless disarmed.
struct ProgressGuard {
    store: Arc<dyn StatusStore>,
    job_id: String,
    armed: bool,
}

impl ProgressGuard {
    fn new(store: Arc<dyn StatusStore>, job_id: &str) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.store.increment_progress(&self.job_id) {
            tracing::error!(job_id = %self.job_id, error = %e, "Failed to increment progress");
        }
    }
}

/// Runs one work item against the generator, one call per step.
pub struct Processor<G> {
    generator: Arc<G>,
    status: Arc<dyn StatusStore>,
    results: Arc<dyn ResultStore>,
    retry: RetryConfig,
    call_timeout: Duration,
    steps: Vec<Step>,
}

impl<G: Generator> Processor<G> {
    pub fn new(
        generator: Arc<G>,
        status: Arc<dyn StatusStore>,
        results: Arc<dyn ResultStore>,
        retry: RetryConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            generator,
            status,
            results,
            retry,
            call_timeout,
            steps: vec![Step::new("generated_text", "")],
        }
    }

    /// Prompts run for every row, in order. More than one step turns on
    /// sequence mode: each row carries one output per step. An empty list is ignored.
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        if !steps.is_empty() {
            self.steps = steps;
        }
        self
    }

    /// Process `item` and return its result. Every error ends up inside the
    /// returned [`WorkerResult`]; the result is persisted under
    /// `task-result-<task_id>` and the job's progress counter moves by exactly one.
    ///
    /// Returns `None` when `cancel` fires first. Nothing is persisted and
    /// progress does not move for an aborted item.
    pub async fn process(
        &self,
        ctx: &WorkerContext,
        item: &WorkItem,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Option<WorkerResult> {
        let progress = ProgressGuard::new(Arc::clone(&self.status), &item.job_id);

        tokio::select! {
            _ = cancel.cancelled() => {
                progress.disarm();
                tracing::debug!(job_id = %item.job_id, index = item.index, "Item aborted by cancellation");
                None
            }
            result = self.run_steps(ctx, item) => {
                self.persist(task_id, &result);
                Some(result)
            }
        }
    }

    /// Runs every step in order. Once a step fails the rest are marked skipped
    /// and the row is an error carrying the failed step's kind.
    async fn run_steps(&self, ctx: &WorkerContext, item: &WorkItem) -> WorkerResult {
        let mut outputs: Vec<StepOutput> = Vec::with_capacity(self.steps.len());
        let mut failed: Option<(&str, GenerateError)> = None;
        let mut retries = 0;

        for step in &self.steps {
            if let Some((failed_column, _)) = &failed {
                outputs.push(StepOutput::skipped(step.column.as_str(), failed_column));
                continue;
            }
            let (outcome, step_retries) = self.run_attempts(ctx, item, step).await;
            retries += step_retries;
            match outcome {
                Ok(text) => outputs.push(StepOutput::new(step.column.as_str(), text)),
                Err(err) => {
                    outputs.push(StepOutput::new(step.column.as_str(), failure_text(err.kind(), &err.to_string())));
                    failed = Some((step.column.as_str(), err));
                }
            }
        }

        let first = outputs.first().map(|o| o.text.clone()).unwrap_or_default();
        let mut result = match failed {
            None => WorkerResult::success(item, first, &ctx.model, retries),
            Some((_, err)) => {
                let mut result = WorkerResult::failure(item, err.kind(), &err.to_string(), &ctx.model, retries);
                result.output = first;
                result
            }
        };
        if self.steps.len() > 1 {
            result.outputs = outputs;
        }
        result
    }

    /// One step with retries. Returns the final outcome and how many retries it took.
    async fn run_attempts(
        &self,
        ctx: &WorkerContext,
        item: &WorkItem,
        step: &Step,
    ) -> (Result<String, GenerateError>, u32) {
        let mut retries = 0;
        loop {
            ctx.limiter.acquire(&ctx.identity).await;

            let call = self.generator.generate(&item.payload, &step.instruction, &ctx.model);
            let outcome = match timeout(self.call_timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GenerateError::Timeout),
            };

            let err = match outcome {
                Ok(text) => {
                    tracing::debug!(
                        job_id = %item.job_id,
                        index = item.index,
                        step = %step.column,
                        worker = %ctx.identity,
                        model = %ctx.model,
                        retries,
                        "Step generated",
                    );
                    return (Ok(text), retries);
                }
                Err(err) => err,
            };

            match decide(&self.retry, retries, &err) {
                RetryDecision::Retry { delay_ms } => {
                    retries += 1;
                    tracing::warn!(
                        job_id = %item.job_id,
                        index = item.index,
                        step = %step.column,
                        worker = %ctx.identity,
                        attempt = retries,
                        max = self.retry.max_retries,
                        delay_ms,
                        error = %err,
                        "Transient generator failure, retrying",
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        job_id = %item.job_id,
                        index = item.index,
                        step = %step.column,
                        worker = %ctx.identity,
                        retries,
                        transient = err.is_transient(),
                        error = %err,
                        "Step failed",
                    );
                    return (Err(err), retries);
                }
            }
        }
    }

    fn persist(&self, task_id: &str, result: &WorkerResult) {
        let key = task_result_key(task_id);
        let written = TaskRecord::new(task_id, result.clone())
            .encode()
            .map_err(Into::into)
            .and_then(|bytes| self.results.put_result(&key, &bytes));
        if let Err(e) = written {
            tracing::error!(
                job_id = %result.job_id,
                index = result.index,
                key = %key,
                error = %e,
                "Failed to persist task result",
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::{ErrorKind, Payload, ResultStatus};
    use crate::store::MemoryStore;
    use crate::worker::RateLimiter;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Generator that replays a fixed script, then keeps answering `fallback`.
    pub(crate) struct ScriptedGenerator {
        script: Mutex<VecDeque<Result<String, GenerateError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(script: Vec<Result<String, GenerateError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Generator for ScriptedGenerator {
        async fn generate(&self, payload: &Payload, _instruction: &str, _model: &str) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| Ok(format!("ok {}", payload.len())))
        }
    }

    struct SlowGenerator;

    impl Generator for SlowGenerator {
        async fn generate(&self, _payload: &Payload, _instruction: &str, _model: &str) -> Result<String, GenerateError> {
            sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    struct PanickingGenerator;

    impl Generator for PanickingGenerator {
        async fn generate(&self, _payload: &Payload, _instruction: &str, _model: &str) -> Result<String, GenerateError> {
            panic!("generator blew up");
        }
    }

    fn ctx() -> WorkerContext {
        WorkerContext {
            identity: "worker-1".into(),
            model: "model-a".into(),
            limiter: Arc::new(RateLimiter::new(Duration::from_millis(10))),
        }
    }

    fn item() -> WorkItem {
        let mut payload = Payload::new();
        payload.insert("first_name".into(), json!("Ada"));
        WorkItem {
            index: 7,
            payload,
            job_id: "job-1".into(),
        }
    }

    fn processor<G: Generator>(generator: G, store: &Arc<MemoryStore>, max_retries: u32) -> Processor<G> {
        Processor::new(
            Arc::new(generator),
            store.clone(),
            store.clone(),
            RetryConfig {
                max_retries,
                base_delay_ms: 100,
            },
            Duration::from_secs(5),
        )
    }

    async fn run<G: Generator>(p: &Processor<G>) -> WorkerResult {
        p.process(&ctx(), &item(), "t1", &CancellationToken::new())
            .await
            .expect("not cancelled")
    }

    /// Echoes the step instruction, failing on any instruction listed in `fail`.
    struct StepGenerator {
        fail: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl Generator for StepGenerator {
        async fn generate(&self, _payload: &Payload, instruction: &str, _model: &str) -> Result<String, GenerateError> {
            self.seen.lock().push(instruction.to_string());
            if self.fail.iter().any(|f| *f == instruction) {
                return Err(GenerateError::ApiError {
                    status: 400,
                    message: "bad request".into(),
                });
            }
            Ok(format!("re: {instruction}"))
        }
    }

    fn sequence() -> Vec<Step> {
        vec![
            Step::new("initial_email", "first"),
            Step::new("followup_1", "second"),
            Step::new("followup_2", "third"),
        ]
    }

    fn transient() -> Result<String, GenerateError> {
        Err(GenerateError::Connection("reset by peer".into()))
    }

    #[test]
    fn decide_respects_policy() {
        let policy = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
        };
        let err = GenerateError::Timeout;
        assert_eq!(decide(&policy, 0, &err), RetryDecision::Retry { delay_ms: 100 });
        assert_eq!(decide(&policy, 2, &err), RetryDecision::Retry { delay_ms: 400 });
        assert_eq!(decide(&policy, 3, &err), RetryDecision::GiveUp);

        let quota = GenerateError::QuotaExhausted("per day".into());
        assert_eq!(decide(&policy, 0, &quota), RetryDecision::GiveUp);

        let hinted = GenerateError::RateLimited { retry_after_ms: 5000 };
        assert_eq!(decide(&policy, 0, &hinted), RetryDecision::Retry { delay_ms: 5000 });
    }

    #[tokio::test(start_paused = true)]
    async fn success_persists_result_and_counts_progress() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(ScriptedGenerator::new(vec![Ok("Hey Ada".into())]), &store, 3);

        let result = run(&p).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.output, "Hey Ada");
        assert_eq!(result.model_used, "model-a");
        assert_eq!(result.index, 7);
        assert_eq!(store.progress("job-1").unwrap(), Some(1));

        let raw = store.get_result("task-result-t1").unwrap().unwrap();
        let record: TaskRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.job_id, "job-1");
        assert_eq!(record.result, result);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_below_limit_eventually_succeed() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            ScriptedGenerator::new(vec![transient(), transient(), transient(), Ok("finally".into())]),
            &store,
            3,
        );

        let result = run(&p).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.output, "finally");
        assert_eq!(result.retry_count, Some(3));
        assert_eq!(p.generator.calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.progress("job-1").unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_at_limit_surface_error() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            ScriptedGenerator::new(vec![transient(), transient(), transient(), transient()]),
            &store,
            3,
        );

        let result = run(&p).await;

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::Connection));
        assert_eq!(result.retry_count, Some(3));
        assert!(result.output.starts_with("ERROR: connection error"));
        assert_eq!(p.generator.calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.progress("job-1").unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            ScriptedGenerator::new(vec![transient(), transient(), Ok("done".into())]),
            &store,
            3,
        );
        let start = tokio::time::Instant::now();
        run(&p).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exhaustion_is_not_retried() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            ScriptedGenerator::new(vec![Err(GenerateError::QuotaExhausted("requests per day".into()))]),
            &store,
            3,
        );

        let result = run(&p).await;

        assert_eq!(result.error_kind, Some(ErrorKind::QuotaExhausted));
        assert!(result.output.starts_with("DAILY_LIMIT_HIT: "));
        assert_eq!(result.retry_count, Some(0));
        assert_eq!(p.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generator_times_out() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(SlowGenerator, &store, 0);

        let result = run(&p).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.output, "ERROR: request timed out");
        assert_eq!(store.progress("job-1").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn panic_still_counts_progress_once() {
        let store = Arc::new(MemoryStore::default());
        let p = Arc::new(processor(PanickingGenerator, &store, 3));

        let handle = tokio::spawn(async move { run(&*p).await });
        let err = handle.await.unwrap_err();

        assert!(err.is_panic());
        assert_eq!(store.progress("job-1").unwrap(), Some(1));
        assert!(store.get_result("task-result-t1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_runs_every_step_in_order() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            StepGenerator {
                fail: Vec::new(),
                seen: Mutex::new(Vec::new()),
            },
            &store,
            3,
        )
        .with_steps(sequence());

        let result = run(&p).await;

        assert!(result.is_success());
        assert_eq!(*p.generator.seen.lock(), vec!["first", "second", "third"]);
        assert_eq!(result.output, "re: first");
        let texts: Vec<(&str, &str)> = result
            .outputs
            .iter()
            .map(|o| (o.column.as_str(), o.text.as_str()))
            .collect();
        assert_eq!(
            texts,
            vec![
                ("initial_email", "re: first"),
                ("followup_1", "re: second"),
                ("followup_2", "re: third")
            ]
        );
        assert_eq!(store.progress("job-1").unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_skips_the_rest() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            StepGenerator {
                fail: vec!["second"],
                seen: Mutex::new(Vec::new()),
            },
            &store,
            3,
        )
        .with_steps(sequence());

        let result = run(&p).await;

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::Api));
        assert_eq!(result.output, "re: first");
        assert_eq!(*p.generator.seen.lock(), vec!["first", "second"]);
        assert!(result.outputs[1].text.starts_with("ERROR: "));
        assert_eq!(result.outputs[2].text, "SKIPPED: followup_1 failed");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_step_skips_every_followup() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            StepGenerator {
                fail: vec!["first"],
                seen: Mutex::new(Vec::new()),
            },
            &store,
            3,
        )
        .with_steps(sequence());

        let result = run(&p).await;

        assert!(result.output.starts_with("ERROR: "));
        assert_eq!(result.outputs[1].text, "SKIPPED: initial_email failed");
        assert_eq!(result.outputs[2].text, "SKIPPED: initial_email failed");
        assert_eq!(p.generator.seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_summed_across_steps() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(
            ScriptedGenerator::new(vec![transient(), Ok("a".into()), transient(), transient(), Ok("b".into())]),
            &store,
            3,
        )
        .with_steps(vec![Step::new("one", ""), Step::new("two", "")]);

        let result = run(&p).await;

        assert!(result.is_success());
        assert_eq!(result.retry_count, Some(3));
        assert_eq!(result.outputs[1].text, "b");
    }

    #[test]
    fn empty_step_list_is_ignored() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(ScriptedGenerator::new(Vec::new()), &store, 0).with_steps(Vec::new());
        assert_eq!(p.steps.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_flight_leaves_no_trace() {
        let store = Arc::new(MemoryStore::default());
        let p = processor(SlowGenerator, &store, 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = p.process(&ctx(), &item(), "t1", &cancel).await;

        assert!(result.is_none());
        assert_eq!(store.progress("job-1").unwrap(), None);
        assert!(store.get_result("task-result-t1").unwrap().is_none());
    }
}
