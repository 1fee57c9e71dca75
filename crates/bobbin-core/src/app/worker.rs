//! Worker - execution plane
//!
//! # フロー
//! 1. local state を見て claim してよいか判定（paused / closing / concurrency）
//! 2. in-flight を先に +1 してから `JobStore::move_to_active` で claim
//! 3. 取れなければ `JobStore::wait_for_job` で待つ（pause / close で中断）
//! 4. 取れたら job ごとに task を spawn、lock を更新しながら processor を実行
//! 5. 結果を `move_to_completed` / `move_to_failed` で反映、in-flight を -1
//!
//! local pause は store に触れません。新しい claim を止め、in-flight が 0 に
//! なるのを待つだけです。wait は job を持たないので中断して構いませんが、
//! 始まった claim は in-flight に数えられているので必ず drain されます。

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::app::processor::Processor;
use crate::config::WorkerConfig;
use crate::domain::{Job, JobError, JobId, LockToken, WorkerId, millis};
use crate::error::BobbinError;
use crate::ports::{IdGenerator, JobStore, StoreError, SystemClock, UlidGenerator};

/// Settlement retries on transient store errors before giving up.
const SETTLE_ATTEMPTS: u32 = 3;

/// Connection and tuning for a worker.
#[derive(Clone)]
pub struct WorkerOptions {
    pub connection: Arc<dyn JobStore>,
    pub config: WorkerConfig,
}

impl WorkerOptions {
    pub fn new(connection: Arc<dyn JobStore>) -> Self {
        Self {
            connection,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.config.autorun = autorun;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.config.lock_duration_ms = millis(duration);
        self
    }

    pub fn with_lock_renew_time(mut self, duration: Duration) -> Self {
        self.config.lock_renew_ms = Some(millis(duration));
        self
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.config.stalled_interval_ms = millis(interval);
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.config.drain_delay_ms = millis(delay);
        self
    }

    pub fn with_run_retry_delay(mut self, delay: Duration) -> Self {
        self.config.run_retry_delay_ms = millis(delay);
        self
    }
}

/// Worker-private state. Never written to the store.
#[derive(Debug, Clone, Copy, Default)]
struct LocalState {
    paused: bool,
    closing: bool,
    in_flight: usize,
}

struct Inner {
    id: WorkerId,
    queue: String,
    store: Arc<dyn JobStore>,
    processor: Arc<dyn Processor>,
    ids: UlidGenerator,
    config: WorkerConfig,
    state: watch::Sender<LocalState>,
}

/// Claims jobs from one queue and runs them through a processor, up to
/// `concurrency` at a time.
pub struct Worker {
    inner: Arc<Inner>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Build a worker. With `autorun` (the default) the loop starts right away,
    /// so this must be called inside a Tokio runtime.
    pub fn new<P>(
        queue_name: impl Into<String>,
        processor: P,
        options: WorkerOptions,
    ) -> Result<Self, BobbinError>
    where
        P: Processor + 'static,
    {
        options.config.validate()?;

        let ids = UlidGenerator::new(Arc::new(SystemClock));
        let (state, _) = watch::channel(LocalState::default());
        let inner = Arc::new(Inner {
            id: ids.generate_worker_id(),
            queue: queue_name.into(),
            store: options.connection,
            processor: Arc::new(processor),
            ids,
            config: options.config,
            state,
        });

        let worker = Self {
            inner,
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        };
        if worker.inner.config.autorun {
            worker.start()?;
        }
        Ok(worker)
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Start the loop when built with `autorun = false`.
    pub async fn run(&self) -> Result<(), BobbinError> {
        self.start()
    }

    fn start(&self) -> Result<(), BobbinError> {
        if self.inner.state.borrow().closing {
            return Err(BobbinError::Closed(format!("worker {}", self.inner.id)));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BobbinError::AlreadyRunning);
        }

        let join = tokio::spawn(Arc::clone(&self.inner).run_loop());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
        Ok(())
    }

    /// Stop claiming and resolve once every job this worker holds has
    /// settled. Resolves at once when nothing is in flight.
    pub async fn pause(&self) {
        let changed = self.inner.state.send_if_modified(|s| {
            let changed = !s.paused;
            s.paused = true;
            changed
        });
        if changed {
            info!(queue = %self.inner.queue, worker_id = %self.inner.id, "worker paused");
        }
        self.inner.drained().await;
    }

    pub fn resume(&self) {
        let changed = self.inner.state.send_if_modified(|s| {
            let changed = s.paused;
            s.paused = false;
            changed
        });
        if changed {
            info!(queue = %self.inner.queue, worker_id = %self.inner.id, "worker resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.borrow().paused
    }

    /// Jobs claimed by this worker and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.inner.state.borrow().in_flight
    }

    /// Stop claiming, wait for in-flight jobs, then stop background tasks.
    pub async fn close(&self) -> Result<(), BobbinError> {
        self.inner.state.send_modify(|s| s.closing = true);
        self.inner.drained().await;

        let join = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(queue = %self.inner.queue, worker_id = %self.inner.id, error = %e, "worker loop ended abnormally");
            }
            info!(queue = %self.inner.queue, worker_id = %self.inner.id, "worker closed");
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // 走っている loop を止める（in-flight の job は最後まで settle される）
        self.inner.state.send_modify(|s| s.closing = true);
    }
}

/// Wait until `pred` holds; `None` when the sender is gone.
async fn wait_until(
    rx: &mut watch::Receiver<LocalState>,
    pred: impl FnMut(&LocalState) -> bool,
) -> Option<LocalState> {
    rx.wait_for(pred).await.ok().map(|s| *s)
}

/// Counts one claim as in flight until dropped.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0
            .state
            .send_modify(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}

impl Inner {
    async fn drained(&self) {
        let mut rx = self.state.subscribe();
        wait_until(&mut rx, |s| s.in_flight == 0).await;
    }

    /// Reserve an in-flight slot unless paused, closing or full.
    fn reserve(self: &Arc<Self>) -> Option<InFlight> {
        let concurrency = self.config.concurrency;
        let reserved = self.state.send_if_modified(|s| {
            if s.paused || s.closing || s.in_flight >= concurrency {
                return false;
            }
            s.in_flight += 1;
            true
        });
        reserved.then(|| InFlight(Arc::clone(self)))
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            queue = %self.queue,
            worker_id = %self.id,
            concurrency = self.config.concurrency,
            "worker started"
        );
        let stalled = tokio::spawn(Arc::clone(&self).check_stalled());
        let concurrency = self.config.concurrency;
        let mut rx = self.state.subscribe();

        loop {
            let Some(state) =
                wait_until(&mut rx, |s| s.closing || (!s.paused && s.in_flight < concurrency)).await
            else {
                break;
            };
            if state.closing {
                break;
            }
            let Some(slot) = self.reserve() else {
                // pause / close と競合した
                continue;
            };

            match self.claim().await {
                Ok(Some((job, token))) => {
                    tokio::spawn(Arc::clone(&self).execute(job, token, slot));
                }
                Ok(None) => {
                    drop(slot);
                    let waited = tokio::select! {
                        res = self.store.wait_for_job(&self.queue, self.config.drain_delay()) => res.map(|_| ()),
                        // wait は job を持たないので pause / close で捨ててよい
                        _ = wait_until(&mut rx, |s| s.paused || s.closing) => Ok(()),
                    };
                    if let Err(e) = waited {
                        warn!(queue = %self.queue, worker_id = %self.id, error = %e, "wait for job failed");
                        self.backoff(&mut rx).await;
                    }
                }
                Err(e) => {
                    drop(slot);
                    warn!(queue = %self.queue, worker_id = %self.id, error = %e, "claim failed");
                    self.backoff(&mut rx).await;
                }
            }
        }

        if let Err(e) = stalled.await {
            warn!(queue = %self.queue, worker_id = %self.id, error = %e, "stalled checker ended abnormally");
        }
        info!(queue = %self.queue, worker_id = %self.id, "worker loop stopped");
    }

    /// Sleep `run_retry_delay`, cut short by close.
    async fn backoff(&self, rx: &mut watch::Receiver<LocalState>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.run_retry_delay()) => {}
            _ = wait_until(rx, |s| s.closing) => {}
        }
    }

    async fn claim(&self) -> Result<Option<(Job, LockToken)>, StoreError> {
        let token = self.ids.generate_lock_token();
        let job = self
            .store
            .move_to_active(&self.queue, token, self.config.lock_duration())
            .await?;
        Ok(job.map(|job| (job, token)))
    }

    /// Run one claimed job to settlement. `slot` is released at the end.
    async fn execute(self: Arc<Self>, job: Job, token: LockToken, slot: InFlight) {
        let job_id = job.id.clone();
        trace!(queue = %self.queue, worker_id = %self.id, job_id = %job_id, "processing");

        // panic も job の失敗として扱うため別 task で実行する
        let processor = Arc::clone(&self.processor);
        let mut task = tokio::spawn(async move { processor.process(job).await });

        let renew_every = self.config.lock_renew_time();
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = renew.tick() => self.renew_lock(&job_id, token).await,
            }
        };

        let result = joined.unwrap_or_else(|e| {
            if e.is_panic() {
                Err(JobError::new(format!("processor panicked: {}", panic_message(e.into_panic()))))
            } else {
                Err(JobError::new("processor task was cancelled"))
            }
        });

        self.settle(&job_id, token, result).await;
        drop(slot);
    }

    async fn renew_lock(&self, job_id: &JobId, token: LockToken) {
        match self
            .store
            .extend_lock(&self.queue, job_id, token, self.config.lock_duration())
            .await
        {
            Ok(true) => trace!(queue = %self.queue, job_id = %job_id, "lock extended"),
            Ok(false) => warn!(
                queue = %self.queue,
                worker_id = %self.id,
                job_id = %job_id,
                "lock lost while processing"
            ),
            Err(e) => warn!(
                queue = %self.queue,
                worker_id = %self.id,
                job_id = %job_id,
                error = %e,
                "lock renewal failed"
            ),
        }
    }

    async fn settle(&self, job_id: &JobId, token: LockToken, result: Result<Value, JobError>) {
        let mut attempt = 1;
        loop {
            let outcome = match &result {
                Ok(value) => self
                    .store
                    .move_to_completed(&self.queue, job_id, token, value.clone())
                    .await
                    .map(|_| "completed".to_string()),
                Err(err) => self
                    .store
                    .move_to_failed(&self.queue, job_id, token, err)
                    .await
                    .map(|state| state.to_string()),
            };

            match outcome {
                Ok(state) => {
                    match &result {
                        Ok(_) => debug!(queue = %self.queue, job_id = %job_id, "job completed"),
                        Err(err) => debug!(
                            queue = %self.queue,
                            job_id = %job_id,
                            moved_to = %state,
                            reason = %err,
                            "job failed"
                        ),
                    }
                    return;
                }
                Err(StoreError::LockMismatch(_)) => {
                    warn!(
                        queue = %self.queue,
                        worker_id = %self.id,
                        job_id = %job_id,
                        "lock no longer held, result discarded"
                    );
                    return;
                }
                Err(e) if e.is_transient() && attempt < SETTLE_ATTEMPTS => {
                    warn!(queue = %self.queue, job_id = %job_id, error = %e, attempt, "settle failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.run_retry_delay()).await;
                }
                Err(e) => {
                    error!(queue = %self.queue, worker_id = %self.id, job_id = %job_id, error = %e, "settle failed");
                    return;
                }
            }
        }
    }

    async fn check_stalled(self: Arc<Self>) {
        let mut rx = self.state.subscribe();
        let mut ticker = tokio::time::interval(self.config.stalled_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_until(&mut rx, |s| s.closing) => break,
            }

            match self
                .store
                .move_stalled_jobs_to_wait(&self.queue, self.config.max_stalled_count)
                .await
            {
                Ok(stalled) if !stalled.is_empty() => warn!(
                    queue = %self.queue,
                    recovered = ?stalled.recovered,
                    failed = ?stalled.failed,
                    "stalled jobs handled"
                ),
                Ok(_) => {}
                Err(e) => warn!(queue = %self.queue, error = %e, "stalled check failed"),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
