//! In-process task-scheduling host.
//!
//! The host gives the orchestrator durable, replayable execution:
//!
//! - every scheduled activity gets a sequence number at scheduling time,
//!   so a replay of the same control-flow asks for the same numbers;
//! - settled activities are appended to a checkpoint log, and on replay
//!   their recorded outcome is returned instead of running them again;
//! - activities that fail transiently are retried with backoff, and the
//!   number running at once is capped by a semaphore shared by all runs.
//!
//! Cancellation is only observed at suspension points. An activity that is
//! already executing is allowed to finish but its result is dropped.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::activity::{Activity, ActivityOutput};
use crate::config::{HostConfig, RetryPolicy};
use crate::error::{ErrorReport, MrError, Result};
use crate::orchestrator::{self, Phase};
use crate::task::{Task, TaskStatus};
use crate::types::{JobRequest, RunResult};
use crate::worker::ActivityWorker;

const LOG_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventOutcome {
    Completed(ActivityOutput),
    Failed(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub seq: u64,
    pub activity: Activity,
    pub outcome: EventOutcome,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed(RunResult),
    Failed(ErrorReport),
    Cancelled,
}

impl From<Result<RunResult>> for RunOutcome {
    fn from(result: Result<RunResult>) -> Self {
        match result {
            Ok(output) => RunOutcome::Completed(output),
            Err(MrError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed(e.report()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum LogEntry {
    Started { run_id: String, request: JobRequest },
    Event(HistoryEvent),
    Finished { outcome: RunOutcome },
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MrError::Checkpoint("checkpoint lock poisoned".to_string()))
}

/// Append-only record of one run: its request, every settled activity and
/// finally its outcome. Written as JSON lines when a directory is given.
#[derive(Debug)]
pub struct CheckpointLog {
    run_id: String,
    request: JobRequest,
    events: Mutex<BTreeMap<u64, HistoryEvent>>,
    outcome: Mutex<Option<RunOutcome>>,
    path: Option<PathBuf>,
}

impl CheckpointLog {
    pub fn in_memory(run_id: &str, request: JobRequest) -> Self {
        CheckpointLog {
            run_id: run_id.to_string(),
            request,
            events: Mutex::new(BTreeMap::new()),
            outcome: Mutex::new(None),
            path: None,
        }
    }

    /// Starts a fresh log file `<dir>/<run_id>.jsonl`, replacing any old one.
    pub fn create(dir: &Path, run_id: &str, request: JobRequest) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}", run_id, LOG_EXTENSION));
        File::create(&path)?;
        let log = CheckpointLog {
            path: Some(path),
            ..CheckpointLog::in_memory(run_id, request)
        };
        log.append(&LogEntry::Started {
            run_id: log.run_id.clone(),
            request: log.request.clone(),
        })?;
        Ok(log)
    }

    /// Reads a log back. A torn final line (crash mid-write) is cut off so
    /// later appends start on a clean line.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let pieces: Vec<&[u8]> = bytes.split_inclusive(|b| *b == b'\n').collect();

        let mut started = None;
        let mut events = BTreeMap::new();
        let mut outcome = None;
        let mut offset = 0u64;
        for (i, piece) in pieces.iter().enumerate() {
            let line = piece.trim_ascii();
            if line.is_empty() {
                offset += piece.len() as u64;
                continue;
            }
            let entry: LogEntry = match serde_json::from_slice(line) {
                Ok(entry) => entry,
                Err(e) if i + 1 == pieces.len() => {
                    warn!("cutting torn last line of {}: {}", path.display(), e);
                    OpenOptions::new().write(true).open(path)?.set_len(offset)?;
                    break;
                }
                Err(e) => {
                    return Err(MrError::Checkpoint(format!(
                        "{} line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )))
                }
            };
            offset += piece.len() as u64;
            match entry {
                LogEntry::Started { run_id, request } => started = Some((run_id, request)),
                LogEntry::Event(event) => {
                    events.insert(event.seq, event);
                }
                LogEntry::Finished { outcome: o } => outcome = Some(o),
            }
        }

        let (run_id, request) = started.ok_or_else(|| {
            MrError::Checkpoint(format!("{} has no start entry", path.display()))
        })?;
        Ok(CheckpointLog {
            run_id,
            request,
            events: Mutex::new(events),
            outcome: Mutex::new(outcome),
            path: Some(path.to_path_buf()),
        })
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, seq: u64) -> Result<Option<HistoryEvent>> {
        Ok(lock(&self.events)?.get(&seq).cloned())
    }

    pub fn contains(&self, seq: u64) -> bool {
        lock(&self.events)
            .map(|events| events.contains_key(&seq))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        lock(&self.events).map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, event: HistoryEvent) -> Result<()> {
        let mut events = lock(&self.events)?;
        self.append(&LogEntry::Event(event.clone()))?;
        events.insert(event.seq, event);
        Ok(())
    }

    pub fn finish(&self, outcome: RunOutcome) -> Result<()> {
        let mut slot = lock(&self.outcome)?;
        self.append(&LogEntry::Finished {
            outcome: outcome.clone(),
        })?;
        *slot = Some(outcome);
        Ok(())
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        lock(&self.outcome).ok().and_then(|o| o.clone())
    }
}

/// Snapshot of a running orchestration, for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub phase: Phase,
    pub scheduled: usize,
    pub settled: usize,
}

/// Shared between the host and whoever started the run: carries the
/// cancellation flag and the live progress.
#[derive(Debug)]
pub struct RunHandle {
    cancelled: AtomicBool,
    phase: Mutex<Phase>,
    tasks: Mutex<BTreeMap<u64, Task>>,
}

impl Default for RunHandle {
    fn default() -> Self {
        RunHandle {
            cancelled: AtomicBool::new(false),
            phase: Mutex::new(Phase::ResolveInput),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl RunHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(RunHandle::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    pub fn progress(&self) -> RunProgress {
        let phase = self.phase.lock().map(|p| *p).unwrap_or(Phase::Failed);
        let (scheduled, settled) = self
            .tasks
            .lock()
            .map(|tasks| (tasks.len(), tasks.values().filter(|t| t.is_settled()).count()))
            .unwrap_or((0, 0));
        RunProgress {
            phase,
            scheduled,
            settled,
        }
    }

    fn update_task(&self, seq: u64, activity: &str, f: impl FnOnce(&mut Task)) {
        if let Ok(mut tasks) = self.tasks.lock() {
            f(tasks.entry(seq).or_insert_with(|| Task::new(seq, activity)));
        }
    }

    pub fn task(&self, seq: u64) -> Option<Task> {
        self.tasks.lock().ok().and_then(|tasks| tasks.get(&seq).cloned())
    }
}

/// Everything an activity dispatch needs, shared by all futures of a run.
struct Dispatcher {
    run_id: String,
    log: Arc<CheckpointLog>,
    worker: Arc<dyn ActivityWorker>,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
    handle: Arc<RunHandle>,
}

impl Dispatcher {
    async fn dispatch(&self, seq: u64, activity: Activity) -> Result<ActivityOutput> {
        if self.handle.is_cancelled() {
            return Err(MrError::Cancelled);
        }
        let name = activity.name();

        if let Some(event) = self.log.get(seq)? {
            if event.activity != activity {
                return Err(MrError::NonDeterministic {
                    seq,
                    message: format!(
                        "recorded {} but orchestration scheduled {}",
                        event.activity.name(),
                        name
                    ),
                });
            }
            debug!("run {} replaying {} #{}", self.run_id, name, seq);
            self.handle
                .update_task(seq, name, |t| t.set_status(TaskStatus::Replayed));
            return match event.outcome {
                EventOutcome::Completed(output) => Ok(output),
                EventOutcome::Failed(report) => Err(MrError::Recorded(report)),
            };
        }

        self.handle.update_task(seq, name, |_| {});
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| MrError::Cancelled)?;
            if self.handle.is_cancelled() {
                return Err(MrError::Cancelled);
            }
            self.handle.update_task(seq, name, |t| t.start_attempt());
            debug!("run {} dispatching {} #{} attempt {}", self.run_id, name, seq, attempt);
            let result = self.worker.execute(activity.clone()).await;
            drop(permit);

            if self.handle.is_cancelled() {
                debug!("run {} dropping result of {} #{}", self.run_id, name, seq);
                return Err(MrError::Cancelled);
            }
            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "run {} {} #{} attempt {} failed, retrying in {:?}: {}",
                        self.run_id, name, seq, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    break Err(MrError::fatal(
                        name,
                        format!("gave up after {} attempts: {}", attempt, e),
                    ))
                }
                other => break other,
            }
        };

        let outcome = match &result {
            Ok(output) => EventOutcome::Completed(output.clone()),
            Err(e) => {
                error!("run {} {} #{} failed: {}", self.run_id, name, seq, e);
                EventOutcome::Failed(e.report())
            }
        };
        self.log.record(HistoryEvent {
            seq,
            activity,
            outcome,
        })?;
        let status = if result.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.handle.update_task(seq, name, |t| t.set_status(status));
        result
    }
}

/// What the orchestrator sees of the host.
pub struct OrchestrationContext {
    next_seq: AtomicU64,
    dispatcher: Arc<Dispatcher>,
}

impl OrchestrationContext {
    pub fn run_id(&self) -> &str {
        &self.dispatcher.run_id
    }

    /// True while the next activity to schedule already has a recorded
    /// outcome.
    pub fn is_replaying(&self) -> bool {
        self.dispatcher
            .log
            .contains(self.next_seq.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.dispatcher.handle.set_phase(phase);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.dispatcher.handle.is_cancelled() {
            Err(MrError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Schedules an activity. The sequence number is taken now, not when
    /// the returned future is first polled.
    pub fn call_activity(&self, activity: Activity) -> BoxFuture<'static, Result<ActivityOutput>> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let dispatcher = Arc::clone(&self.dispatcher);
        async move { dispatcher.dispatch(seq, activity).await }.boxed()
    }

    /// Fan-in barrier: waits for every task to settle, then yields the
    /// outputs in scheduling order or the first error in scheduling order.
    pub async fn task_all(
        &self,
        tasks: Vec<BoxFuture<'static, Result<ActivityOutput>>>,
    ) -> Result<Vec<ActivityOutput>> {
        let results = future::join_all(tasks).await;
        self.check_cancelled()?;
        results.into_iter().collect()
    }
}

pub struct Host {
    worker: Arc<dyn ActivityWorker>,
    config: HostConfig,
    limiter: Arc<Semaphore>,
}

impl Host {
    pub fn new(worker: Arc<dyn ActivityWorker>, config: HostConfig) -> Result<Self> {
        config.validate()?;
        Ok(Host {
            worker,
            limiter: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Opens the checkpoint log for a new run.
    pub fn open_log(&self, run_id: &str, request: JobRequest) -> Result<Arc<CheckpointLog>> {
        let log = match &self.config.checkpoint_dir {
            Some(dir) => CheckpointLog::create(dir, run_id, request)?,
            None => CheckpointLog::in_memory(run_id, request),
        };
        Ok(Arc::new(log))
    }

    /// Starts a new run and drives it to a terminal state.
    pub async fn run(
        &self,
        run_id: &str,
        request: JobRequest,
        handle: Arc<RunHandle>,
    ) -> RunOutcome {
        match self.open_log(run_id, request) {
            Ok(log) => self.resume(log, handle).await,
            Err(e) => {
                error!("run {} could not open its checkpoint log: {}", run_id, e);
                handle.set_phase(Phase::Failed);
                RunOutcome::Failed(e.report())
            }
        }
    }

    /// Drives the orchestrator over `log`, replaying whatever it already
    /// holds. A log that is already finished just returns its outcome.
    pub async fn resume(&self, log: Arc<CheckpointLog>, handle: Arc<RunHandle>) -> RunOutcome {
        if let Some(outcome) = log.outcome() {
            handle.set_phase(terminal_phase(&outcome));
            return outcome;
        }
        let run_id = log.run_id().to_string();
        if !log.is_empty() {
            info!("run {} resuming from {} recorded activities", run_id, log.len());
        }
        let request = log.request().clone();
        let ctx = OrchestrationContext {
            next_seq: AtomicU64::new(0),
            dispatcher: Arc::new(Dispatcher {
                run_id: run_id.clone(),
                log: Arc::clone(&log),
                worker: Arc::clone(&self.worker),
                limiter: Arc::clone(&self.limiter),
                retry: self.config.retry.clone(),
                handle: Arc::clone(&handle),
            }),
        };

        let outcome = RunOutcome::from(orchestrator::orchestrate(&ctx, &request).await);
        handle.set_phase(terminal_phase(&outcome));
        match &outcome {
            RunOutcome::Completed(result) => info!(
                "run {} completed: {} lines, {} unique words",
                run_id, result.input_count, result.unique_words
            ),
            RunOutcome::Failed(report) => error!("run {} failed: {}", run_id, report),
            RunOutcome::Cancelled => info!("run {} cancelled", run_id),
        }
        if let Err(e) = log.finish(outcome.clone()) {
            error!("run {} could not record its outcome: {}", run_id, e);
        }
        outcome
    }

    /// Checkpoint logs in the checkpoint directory that never finished.
    pub fn recover(&self) -> Result<Vec<Arc<CheckpointLog>>> {
        let Some(dir) = &self.config.checkpoint_dir else {
            return Ok(vec![]);
        };
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == LOG_EXTENSION))
            .collect();
        paths.sort();

        let mut unfinished = vec![];
        for path in paths {
            match CheckpointLog::load(&path) {
                Ok(log) if log.outcome().is_none() => unfinished.push(Arc::new(log)),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }
        Ok(unfinished)
    }
}

fn terminal_phase(outcome: &RunOutcome) -> Phase {
    match outcome {
        RunOutcome::Completed(_) => Phase::Completed,
        RunOutcome::Failed(_) => Phase::Failed,
        RunOutcome::Cancelled => Phase::Cancelled,
    }
}
