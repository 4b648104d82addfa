// crates/core/src/lifecycle.rs
//! Wires executors into job state and hub events.
//!
//! `JobService` owns the [`JobManager`], the executor handles of running jobs
//! and the outputs of completed jobs that nobody has consumed yet. Each
//! admitted job gets a driver task that starts the executor, relays its
//! output and finalizes the job when the process exits.
//!
//! Lock order is manager, then handles, outputs or the hub. Events that
//! describe a job's state are pushed while the manager lock is held, so no
//! push can land after the channel was ended. No lock is held across an
//! `.await`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::executor::{ExecutionRequest, Executor, ExecutorEvent, ExecutorHandle, RunningProcess};
use crate::history::{HistorySink, NoopHistory, ProgressThrottle};
use crate::hub::Hub;
use crate::job::{FailureKind, JobId, JobSnapshot, JobSpec, JobStatus, OutputFile};
use crate::manager::{JobManager, ManagerStats, QueueInfo};
use crate::output::{cleanup_temp, find_output, remove_output};
use crate::progress::{parse_progress, ProgressUpdate};

/// Stderr lines kept for the error message of a failed job.
const STDERR_TAIL_LINES: usize = 20;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("JobService mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Identifies one admission of a job. A ticket whose version no longer
/// matches the job's is stale and may not write terminal state.
#[derive(Debug, Clone)]
struct Ticket {
    id: JobId,
    version: u64,
    request: ExecutionRequest,
}

/// Where a driver is in its process's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    /// Process started, no output yet.
    Spawned,
    /// At least one output line seen.
    Streaming,
    /// Exit observed; later events are ignored.
    Exited,
}

/// Per-job driver state, advanced by executor events.
struct JobDriver {
    ticket: Ticket,
    phase: DriverPhase,
    throttle: ProgressThrottle,
    stderr_tail: VecDeque<String>,
}

impl JobDriver {
    fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            phase: DriverPhase::Spawned,
            throttle: ProgressThrottle::default(),
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    /// Apply one event. Returns the exit code once the process has exited.
    fn on_event(&mut self, service: &JobService, event: ExecutorEvent) -> Option<Option<i32>> {
        if self.phase == DriverPhase::Exited {
            tracing::debug!(job_id = %self.ticket.id, ?event, "Event after exit ignored");
            return None;
        }
        match event {
            ExecutorEvent::Stdout(line) => {
                self.phase = DriverPhase::Streaming;
                self.on_line(service, &line);
                None
            }
            ExecutorEvent::Stderr(line) => {
                self.phase = DriverPhase::Streaming;
                self.on_line(service, &line);
                if self.stderr_tail.len() == STDERR_TAIL_LINES {
                    self.stderr_tail.pop_front();
                }
                self.stderr_tail.push_back(line);
                None
            }
            ExecutorEvent::Exited(code) => {
                self.phase = DriverPhase::Exited;
                Some(code)
            }
        }
    }

    fn on_line(&mut self, service: &JobService, line: &str) {
        let update = parse_progress(line);
        if update.is_empty() {
            return;
        }
        if !service.apply_progress(&self.ticket, &update) {
            return;
        }
        if let Some(floor) = update.percent.and_then(|p| self.throttle.admit(p)) {
            service.history.record_progress(&self.ticket.id, floor);
        }
    }

    fn error_message(&self, code: Option<i32>) -> String {
        let tail: Vec<&str> = self
            .stderr_tail
            .iter()
            .map(String::as_str)
            .filter(|l| !l.trim().is_empty())
            .collect();
        if tail.is_empty() {
            match code {
                Some(c) => format!("executor exited with code {c}"),
                None => "executor was terminated by a signal".to_string(),
            }
        } else {
            tail.join("\n")
        }
    }
}

pub struct JobService {
    manager: Mutex<JobManager>,
    hub: Arc<Hub>,
    executor: Arc<dyn Executor>,
    history: Arc<dyn HistorySink>,
    handles: Mutex<HashMap<JobId, ExecutorHandle>>,
    outputs: Mutex<HashMap<JobId, OutputFile>>,
    /// Outputs handed over by `take_output`; GC must leave them alone.
    consumed: Mutex<HashMap<JobId, PathBuf>>,
}

impl JobService {
    pub fn new(manager: JobManager, hub: Arc<Hub>, executor: Arc<dyn Executor>) -> Arc<Self> {
        Self::with_history(manager, hub, executor, Arc::new(NoopHistory))
    }

    pub fn with_history(
        manager: JobManager,
        hub: Arc<Hub>,
        executor: Arc<dyn Executor>,
        history: Arc<dyn HistorySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: Mutex::new(manager),
            hub,
            executor,
            history,
            handles: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            consumed: Mutex::new(HashMap::new()),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        lock(&self.manager).snapshot(id)
    }

    pub fn stats(&self) -> ManagerStats {
        lock(&self.manager).stats()
    }

    pub fn queue_info(&self) -> QueueInfo {
        lock(&self.manager).queue_info()
    }

    pub fn user_jobs(&self, user_id: &str) -> Vec<JobSnapshot> {
        lock(&self.manager).user_jobs(user_id)
    }

    /// True while the job's executor handle is held.
    pub fn has_handle(&self, id: &JobId) -> bool {
        lock(&self.handles).contains_key(id)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Create and enqueue a job. Work starts asynchronously; must be called
    /// inside a tokio runtime.
    pub fn submit(self: &Arc<Self>, spec: JobSpec) -> Result<JobSnapshot, JobError> {
        let (snapshot, admitted) = {
            let mut manager = lock(&self.manager);
            let snapshot = manager.create_job(spec)?;
            self.hub
                .push(snapshot.id.as_str(), json!({ "status": JobStatus::Waiting }), "status");
            let admitted = manager.enqueue(&snapshot.id)?;
            (snapshot, admitted)
        };
        tracing::info!(
            job_id = %snapshot.id,
            user_id = %snapshot.user_id,
            job_type = %snapshot.job_type,
            "Job submitted"
        );
        crate::metrics::record_submitted();
        self.start(admitted);
        Ok(lock(&self.manager).snapshot(&snapshot.id).unwrap_or(snapshot))
    }

    /// Cancel a waiting or running job. Returns false if it had already
    /// reached a terminal status.
    pub async fn cancel(self: &Arc<Self>, id: &JobId, reason: Option<String>) -> Result<bool, JobError> {
        let (transition, handle, was_running, tmp) = {
            let mut manager = lock(&self.manager);
            let job = manager
                .get(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            let was_running = job.status == JobStatus::Running;
            let tmp = (job.tmp_dir.clone(), job.tmp_id.clone());
            let transition = manager.cancel_job(id, reason.clone());
            let handle = if transition.applied {
                lock(&self.handles).remove(id)
            } else {
                None
            };
            (transition, handle, was_running, tmp)
        };
        if !transition.applied {
            return Ok(false);
        }

        if let Some(handle) = handle {
            let delivered = handle.terminate();
            tracing::debug!(job_id = %id, delivered, "Termination requested");
        }
        // A running job's driver cleans up once the process has exited.
        if !was_running {
            self.cleanup_files(id, &tmp.0, &tmp.1, None).await;
        }

        tracing::info!(job_id = %id, was_running, reason = ?reason, "Job canceled");
        self.hub.push(
            id.as_str(),
            json!({ "reason": reason.as_deref().unwrap_or("canceled") }),
            "canceled",
        );
        self.hub.end(id.as_str(), JobStatus::Canceled.as_str());
        self.finished(id, JobStatus::Canceled);
        self.start(transition.admitted);
        Ok(true)
    }

    /// Clamp and apply a new global limit; admits jobs if it was raised.
    pub fn set_max_concurrent(self: &Arc<Self>, n: usize) -> usize {
        let (value, admitted) = lock(&self.manager).set_max_concurrent(n);
        tracing::info!(max_concurrent = value, requested = n, "Concurrency limit changed");
        self.start(admitted);
        value
    }

    /// Hand over a completed job's output. The caller owns the file from
    /// here on; it will no longer be deleted by GC.
    pub fn take_output(&self, id: &JobId) -> Option<OutputFile> {
        let output = lock(&self.outputs).remove(id)?;
        lock(&self.consumed).insert(id.clone(), output.path.clone());
        Some(output)
    }

    pub fn output(&self, id: &JobId) -> Option<OutputFile> {
        lock(&self.outputs).get(id).cloned()
    }

    /// Drop a terminal job: delete its unconsumed output and remaining temp
    /// files, forget its hub channel and remove it from the table. An output
    /// handed over by [`Self::take_output`] is kept.
    pub async fn release(&self, id: &JobId) -> Result<JobSnapshot, JobError> {
        let job = lock(&self.manager).remove(id)?;
        let output = lock(&self.outputs).remove(id);
        let consumed = lock(&self.consumed).remove(id);
        if let Some(out) = &output {
            if let Err(e) = remove_output(&out.path).await {
                tracing::warn!(job_id = %id, path = %out.path.display(), error = %e, "Failed to delete unconsumed output");
            }
        }
        self.cleanup_files(id, &job.tmp_dir, &job.tmp_id, consumed.as_deref())
            .await;
        self.hub.cleanup(id.as_str());
        tracing::debug!(job_id = %id, "Job released");
        Ok(job.snapshot())
    }

    /// Release every terminal job that finished more than `retention` ago.
    pub async fn reap_finished(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let expired = lock(&self.manager).finished_before(cutoff);
        let mut released = 0;
        for id in expired {
            match self.release(&id).await {
                Ok(_) => released += 1,
                Err(e) => tracing::debug!(job_id = %id, error = %e, "Skipping reap"),
            }
        }
        if released > 0 {
            tracing::info!(released, "Reaped finished jobs");
        }
        released
    }

    /// Run [`Self::reap_finished`] every `interval` until `token` is canceled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        service.reap_finished(retention).await;
                    }
                }
            }
        })
    }

    /// Cancel every live job and drop all hub channels.
    pub async fn shutdown(self: &Arc<Self>) {
        let live = lock(&self.manager).live_jobs();
        for id in live {
            if let Err(e) = self.cancel(&id, Some("shutdown".to_string())).await {
                tracing::warn!(job_id = %id, error = %e, "Cancel on shutdown failed");
            }
        }
        let dropped = self.hub.cleanup_all();
        tracing::info!(dropped_channels = dropped, "Job service shut down");
    }

    // ------------------------------------------------------------------------
    // Driver plumbing
    // ------------------------------------------------------------------------

    fn start(self: &Arc<Self>, admitted: Vec<JobId>) {
        if admitted.is_empty() {
            crate::metrics::record_queue(self.stats());
            return;
        }
        for id in admitted {
            let ticket = {
                let manager = lock(&self.manager);
                let ticket = manager
                    .get(&id)
                    .filter(|j| j.status == JobStatus::Running)
                    .map(|job| Ticket {
                        id: job.id.clone(),
                        version: job.version,
                        request: ExecutionRequest::from(job),
                    });
                if let Some(ticket) = &ticket {
                    self.hub
                        .push(ticket.id.as_str(), json!({ "status": JobStatus::Running }), "status");
                }
                ticket
            };
            let Some(ticket) = ticket else {
                continue;
            };
            tracing::info!(job_id = %ticket.id, "Job started");
            tokio::spawn(Arc::clone(self).drive(ticket));
        }
        crate::metrics::record_queue(self.stats());
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        lock(&self.manager)
            .get(&ticket.id)
            .is_some_and(|j| j.status == JobStatus::Running && j.version == ticket.version)
    }

    fn apply_progress(&self, ticket: &Ticket, update: &ProgressUpdate) -> bool {
        let mut manager = lock(&self.manager);
        let current = manager
            .get(&ticket.id)
            .is_some_and(|j| j.version == ticket.version);
        let applied = current && manager.update_progress(&ticket.id, update);
        if applied {
            let payload = serde_json::to_value(update).unwrap_or_default();
            self.hub.push(ticket.id.as_str(), payload, update.event_name());
        }
        applied
    }

    /// Store the handle unless the job moved on while the executor was
    /// starting, in which case the process is asked to stop right away.
    fn attach_handle(&self, ticket: &Ticket, handle: ExecutorHandle) -> bool {
        let manager = lock(&self.manager);
        let current = manager
            .get(&ticket.id)
            .is_some_and(|j| j.status == JobStatus::Running && j.version == ticket.version);
        if current {
            lock(&self.handles).insert(ticket.id.clone(), handle);
        } else {
            drop(manager);
            tracing::info!(job_id = %ticket.id, "Job left running before executor started; terminating");
            handle.terminate();
        }
        current
    }

    async fn drive(self: Arc<Self>, ticket: Ticket) {
        let process = match self.executor.spawn(&ticket.request).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(job_id = %ticket.id, error = %e, "Executor failed to start");
                self.fail(&ticket, FailureKind::SpawnFailure, e.to_string()).await;
                return;
            }
        };
        let RunningProcess { mut events, handle } = process;
        self.attach_handle(&ticket, handle);

        let mut driver = JobDriver::new(ticket);
        let mut exit = None;
        while let Some(event) = events.recv().await {
            if let Some(code) = driver.on_event(&self, event) {
                exit = Some(code);
                break;
            }
        }
        let code = exit.unwrap_or_else(|| {
            tracing::warn!(job_id = %driver.ticket.id, "Executor stream closed without exit status");
            None
        });
        self.finalize(&driver, code).await;
    }

    /// Re-read the job before writing terminal state. A job that is no
    /// longer running under this ticket (canceled meanwhile) only gets its
    /// temp files removed and the scheduler re-run.
    async fn finalize(self: &Arc<Self>, driver: &JobDriver, code: Option<i32>) {
        let ticket = &driver.ticket;
        if !self.is_current(ticket) {
            tracing::info!(job_id = %ticket.id, exit_code = ?code, "Exit after cancellation; skipping finalization");
            self.drop_handle(&ticket.id);
            self.cleanup_request(ticket, None).await;
            let admitted = lock(&self.manager).schedule();
            self.start(admitted);
            return;
        }

        match code {
            Some(0) => {
                let req = &ticket.request;
                match find_output(&req.tmp_dir, &req.tmp_id, req.job_type).await {
                    Ok(Some(output)) => self.complete(ticket, output).await,
                    Ok(None) => {
                        let msg = format!(
                            "executor exited successfully but no {} output named {}* was found in {}",
                            req.job_type,
                            req.tmp_id,
                            req.tmp_dir.display()
                        );
                        tracing::error!(job_id = %ticket.id, "{msg}");
                        self.fail(ticket, FailureKind::OutputIntegrity, msg).await;
                    }
                    Err(e) => {
                        let msg = format!("cannot read {}: {e}", req.tmp_dir.display());
                        tracing::error!(job_id = %ticket.id, error = %e, "Output discovery failed");
                        self.fail(ticket, FailureKind::OutputIntegrity, msg).await;
                    }
                }
            }
            code => {
                let msg = driver.error_message(code);
                tracing::warn!(job_id = %ticket.id, exit_code = ?code, error = %msg, "Executor failed");
                self.fail(ticket, FailureKind::NonZeroExit, msg).await;
            }
        }
    }

    async fn complete(self: &Arc<Self>, ticket: &Ticket, output: OutputFile) {
        let transition = lock(&self.manager).complete_job(&ticket.id, Some(output.clone()));
        self.drop_handle(&ticket.id);
        if !transition.applied {
            self.cleanup_request(ticket, None).await;
            self.start(transition.admitted);
            return;
        }

        self.cleanup_request(ticket, Some(&output)).await;
        lock(&self.outputs).insert(ticket.id.clone(), output.clone());
        tracing::info!(
            job_id = %ticket.id,
            size = output.size,
            file = %output.file_name(),
            "Job completed"
        );
        self.hub.push(
            ticket.id.as_str(),
            json!({ "size": output.size, "filename": output.file_name() }),
            "completed",
        );
        self.hub.end(ticket.id.as_str(), JobStatus::Completed.as_str());
        self.finished(&ticket.id, JobStatus::Completed);
        self.start(transition.admitted);
    }

    async fn fail(self: &Arc<Self>, ticket: &Ticket, kind: FailureKind, message: String) {
        let transition = {
            let mut manager = lock(&self.manager);
            let current = manager
                .get(&ticket.id)
                .is_some_and(|j| j.status == JobStatus::Running && j.version == ticket.version);
            if current {
                manager.fail_job(&ticket.id, kind, message.clone())
            } else {
                Default::default()
            }
        };
        self.drop_handle(&ticket.id);
        self.cleanup_request(ticket, None).await;
        if !transition.applied {
            let admitted = lock(&self.manager).schedule();
            self.start(admitted);
            return;
        }

        self.hub.push(
            ticket.id.as_str(),
            json!({ "error": message, "kind": kind }),
            "failed",
        );
        self.hub.end(ticket.id.as_str(), JobStatus::Failed.as_str());
        self.finished(&ticket.id, JobStatus::Failed);
        self.start(transition.admitted);
    }

    fn drop_handle(&self, id: &JobId) {
        lock(&self.handles).remove(id);
    }

    fn finished(&self, id: &JobId, status: JobStatus) {
        crate::metrics::record_finished(status);
        if let Some(snapshot) = self.get(id) {
            self.history.record_finished(&snapshot);
        }
    }

    async fn cleanup_request(&self, ticket: &Ticket, keep: Option<&OutputFile>) {
        let req = &ticket.request;
        self.cleanup_files(&ticket.id, &req.tmp_dir, &req.tmp_id, keep.map(|o| o.path.as_path()))
            .await;
    }

    async fn cleanup_files(
        &self,
        id: &JobId,
        tmp_dir: &Path,
        tmp_id: &str,
        keep: Option<&Path>,
    ) {
        match cleanup_temp(tmp_dir, tmp_id, keep).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(job_id = %id, removed = n, "Temp files removed"),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Temp cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::hub::HubEvent;
    use crate::job::JobType;
    use crate::testing::{FakeExecutor, Script};
    use std::path::Path;
    use tokio::sync::{mpsc, Notify};

    const DOWNLOAD_LINE: &str = "[download]  50.0% of 10.00MiB at 1.50MiB/s ETA 00:05";

    fn spec(dir: &Path, id: &str, user: &str, source: &str) -> JobSpec {
        JobSpec {
            id: Some(JobId::new(id)),
            job_type: JobType::Best,
            user_id: user.into(),
            concurrency_cap: 1,
            tmp_id: format!("tmp-{id}"),
            tmp_dir: dir.to_path_buf(),
            source: source.into(),
        }
    }

    fn service(max: usize, executor: FakeExecutor) -> (Arc<JobService>, Arc<FakeExecutor>) {
        let executor = Arc::new(executor);
        let svc = JobService::new(
            JobManager::new(max),
            Arc::new(Hub::default()),
            Arc::clone(&executor) as Arc<dyn Executor>,
        );
        (svc, executor)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_status(svc: &JobService, id: &str, status: JobStatus) -> JobSnapshot {
        let id = JobId::new(id);
        wait_until(|| svc.get(&id).is_some_and(|j| j.status == status)).await;
        svc.get(&id).unwrap()
    }

    async fn drain_until_end(rx: &mut mpsc::Receiver<HubEvent>) -> Vec<HubEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("hub event in time")
                .expect("channel open until end");
            let end = event.is_end();
            events.push(event);
            if end {
                return events;
            }
        }
    }

    fn names(events: &[HubEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event.as_str()).collect()
    }

    fn leftover(dir: &Path, prefix: &str) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .is_ok_and(|e| e.file_name().to_string_lossy().starts_with(prefix))
            })
            .count()
    }

    #[tokio::test]
    async fn test_successful_job_streams_events_and_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::success("mp4")
            .stdout(DOWNLOAD_LINE)
            .stdout("[Merger] Merging formats into \"tmp-a.mp4\"")
            .file(".f137.mp4.part", 4);
        let (svc, _) = service(2, FakeExecutor::new(script));

        let snap = svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        assert_eq!(snap.status, JobStatus::Running);
        let (_, mut rx) = svc.hub().subscribe("a", None);

        let events = drain_until_end(&mut rx).await;
        assert_eq!(
            names(&events),
            vec!["status", "status", "progress", "merging", "completed", "end"]
        );
        assert_eq!(events[0].payload["status"], "waiting");
        assert_eq!(events[1].payload["status"], "running");
        assert_eq!(events[2].payload["percent"], 50.0);
        assert_eq!(events[2].payload["speed"], "1.50MiB/s");
        assert_eq!(events[2].payload["eta"], "00:05");
        assert_eq!(events[4].payload["filename"], "tmp-a.mp4");
        assert_eq!(events[4].payload["size"], 16);
        assert_eq!(events[5].payload["status"], "completed");

        let job = wait_for_status(&svc, "a", JobStatus::Completed).await;
        assert_eq!(job.progress, Some(100.0));
        assert_eq!(job.output_size, Some(16));
        assert_eq!(job.stage.as_deref(), Some("merging"));

        let output = svc.output(&JobId::new("a")).unwrap();
        assert!(output.path.exists());
        assert_eq!(leftover(dir.path(), "tmp-a"), 1, "partial files removed");
        assert!(!svc.has_handle(&JobId::new("a")));
        assert_eq!(svc.stats().running, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::exit(1)
            .stderr("WARNING: retrying")
            .stderr("ERROR: Unsupported URL")
            .file(".webm.part", 8);
        let (svc, _) = service(1, FakeExecutor::new(script));

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        let (_, mut rx) = svc.hub().subscribe("a", None);
        let events = drain_until_end(&mut rx).await;
        let failed = events.iter().find(|e| e.event == "failed").unwrap();
        assert_eq!(failed.payload["kind"], "nonZeroExit");
        assert!(failed.payload["error"].as_str().unwrap().contains("Unsupported URL"));

        let job = wait_for_status(&svc, "a", JobStatus::Failed).await;
        assert_eq!(job.failure, Some(FailureKind::NonZeroExit));
        assert!(job.error.unwrap().contains("Unsupported URL"));
        assert_eq!(leftover(dir.path(), "tmp-a"), 0);
        assert!(svc.output(&JobId::new("a")).is_none());
    }

    #[tokio::test]
    async fn test_exit_zero_without_output_is_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::exit(0).file(".webm.part", 8);
        let (svc, _) = service(1, FakeExecutor::new(script));

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        let job = wait_for_status(&svc, "a", JobStatus::Failed).await;
        assert_eq!(job.failure, Some(FailureKind::OutputIntegrity));
        assert_eq!(leftover(dir.path(), "tmp-a"), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let executor = FakeExecutor::new(Script::success("mp4")).with_script("broken", Script::spawn_failure());
        let (svc, executor) = service(1, executor);

        svc.submit(spec(dir.path(), "a", "u1", "broken")).unwrap();
        svc.submit(spec(dir.path(), "b", "u2", "ok")).unwrap();

        let a = wait_for_status(&svc, "a", JobStatus::Failed).await;
        assert_eq!(a.failure, Some(FailureKind::SpawnFailure));
        wait_for_status(&svc, "b", JobStatus::Completed).await;
        assert_eq!(executor.spawned(), vec![JobId::new("a"), JobId::new("b")]);
    }

    #[tokio::test]
    async fn test_cancel_running_wins_over_late_success() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let script = Script::success("mp4")
            .stdout(DOWNLOAD_LINE)
            .gated(Arc::clone(&gate))
            .exit_on_terminate(Some(0));
        let (svc, executor) = service(1, FakeExecutor::new(script));
        let id = JobId::new("a");

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        let (_, mut rx) = svc.hub().subscribe("a", None);
        wait_until(|| svc.has_handle(&id)).await;
        std::fs::write(dir.path().join("tmp-a.webm.part"), b"partial").unwrap();

        assert!(svc.cancel(&id, Some("user request".into())).await.unwrap());
        let events = drain_until_end(&mut rx).await;
        let canceled = events.iter().find(|e| e.event == "canceled").unwrap();
        assert_eq!(canceled.payload["reason"], "user request");
        assert_eq!(events.last().unwrap().payload["status"], "canceled");

        // The process exits 0 and writes its output after the cancel; the
        // driver must only clean up.
        wait_until(|| leftover(dir.path(), "tmp-a") == 0).await;
        assert_eq!(executor.terminated(), vec![id.clone()]);
        let job = svc.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.error.as_deref(), Some("user request"));
        assert!(svc.output(&id).is_none());
        assert_eq!(svc.stats().running, 0);

        assert!(!svc.cancel(&id, None).await.unwrap(), "second cancel is a no-op");
    }

    #[tokio::test]
    async fn test_cancel_while_executor_starts_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let spawn_gate = Arc::new(Notify::new());
        let exit_gate = Arc::new(Notify::new());
        let script = Script::success("mp4")
            .stdout(DOWNLOAD_LINE)
            .spawn_gated(Arc::clone(&spawn_gate))
            .gated(Arc::clone(&exit_gate))
            .exit_on_terminate(Some(0));
        let (svc, executor) = service(1, FakeExecutor::new(script));
        let id = JobId::new("a");

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        wait_until(|| executor.spawned().len() == 1).await;
        assert!(!svc.has_handle(&id));

        assert!(svc.cancel(&id, None).await.unwrap());
        assert!(svc.hub().active_channels().is_empty());
        spawn_gate.notify_one();

        wait_until(|| executor.terminated() == vec![id.clone()]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = svc.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.progress, None);
        assert!(!svc.has_handle(&id));
        assert!(svc.output(&id).is_none());
        assert_eq!(leftover(dir.path(), "tmp-a"), 0);
        // Nothing the late process did reopened the ended channel.
        assert!(svc.hub().buffered("a").is_empty());
        assert!(svc.hub().active_channels().is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_taken_output_but_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _) = service(1, FakeExecutor::new(Script::success("mp4")));
        let id = JobId::new("a");

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        wait_for_status(&svc, "a", JobStatus::Completed).await;
        let taken = svc.take_output(&id).unwrap();
        assert!(svc.take_output(&id).is_none());
        let stray = dir.path().join("tmp-a.en.vtt");
        std::fs::write(&stray, b"subs").unwrap();

        svc.release(&id).await.unwrap();
        assert!(taken.path.exists());
        assert!(!stray.exists());
        assert!(svc.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_waiting_cleans_up_and_keeps_runner() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let (svc, _) = service(1, FakeExecutor::new(Script::success("mp4").gated(Arc::clone(&gate))));

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        svc.submit(spec(dir.path(), "b", "u2", "src")).unwrap();
        assert_eq!(svc.get(&JobId::new("b")).unwrap().status, JobStatus::Waiting);
        std::fs::write(dir.path().join("tmp-b.part"), b"x").unwrap();

        assert!(svc.cancel(&JobId::new("b"), None).await.unwrap());
        assert_eq!(leftover(dir.path(), "tmp-b"), 0);
        let b = svc.get(&JobId::new("b")).unwrap();
        assert_eq!(b.status, JobStatus::Canceled);
        assert_eq!(b.error.as_deref(), Some("canceled"));
        assert!(svc.queue_info().waiting.is_empty());

        wait_until(|| svc.has_handle(&JobId::new("a"))).await;
        gate.notify_one();
        wait_for_status(&svc, "a", JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let (svc, _) = service(1, FakeExecutor::default());
        let err = svc.cancel(&JobId::new("ghost"), None).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_raising_limit_starts_waiting_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let (svc, executor) = service(1, FakeExecutor::new(Script::success("mp4").gated(Arc::clone(&gate))));

        for id in ["a", "b", "c"] {
            svc.submit(spec(dir.path(), id, id, "src")).unwrap();
        }
        assert_eq!(svc.stats().running, 1);
        assert_eq!(svc.set_max_concurrent(50), 10);
        assert_eq!(svc.stats().running, 3);
        wait_until(|| executor.spawned().len() == 3).await;
    }

    #[tokio::test]
    async fn test_progress_history_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::success("mp3")
            .stdout("[download]   1.0% of 3MiB")
            .stdout("[download]   1.5% of 3MiB")
            .stdout("[download]   2.0% of 3MiB")
            .stdout("[download]   2.9% of 3MiB")
            .stdout("[download] 100.0% of 3MiB");
        let executor = Arc::new(FakeExecutor::new(script));
        let history = Arc::new(MemoryHistory::new());
        let svc = JobService::with_history(
            JobManager::new(1),
            Arc::new(Hub::default()),
            executor,
            Arc::clone(&history) as Arc<dyn HistorySink>,
        );
        let mut job = spec(dir.path(), "a", "u1", "src");
        job.job_type = JobType::Audio;

        svc.submit(job).unwrap();
        wait_for_status(&svc, "a", JobStatus::Completed).await;
        assert_eq!(history.progress_writes(&JobId::new("a")), vec![1, 2, 100]);
        let finished = history.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_release_deletes_unconsumed_output() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _) = service(2, FakeExecutor::new(Script::success("mp4")));

        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();
        svc.submit(spec(dir.path(), "b", "u2", "src")).unwrap();
        wait_for_status(&svc, "a", JobStatus::Completed).await;
        wait_for_status(&svc, "b", JobStatus::Completed).await;

        let taken = svc.take_output(&JobId::new("b")).unwrap();
        let a_path = svc.output(&JobId::new("a")).unwrap().path;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(svc.reap_finished(Duration::ZERO).await, 2);
        assert!(!a_path.exists());
        assert!(taken.path.exists(), "handed-over output survives GC");
        assert!(svc.get(&JobId::new("a")).is_none());
        assert!(matches!(
            svc.release(&JobId::new("a")).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_release_rejects_live_job() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let (svc, _) = service(1, FakeExecutor::new(Script::success("mp4").gated(Arc::clone(&gate))));
        svc.submit(spec(dir.path(), "a", "u1", "src")).unwrap();

        let err = svc.release(&JobId::new("a")).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        assert_eq!(svc.reap_finished(Duration::ZERO).await, 0);

        svc.shutdown().await;
        assert_eq!(svc.get(&JobId::new("a")).unwrap().status, JobStatus::Canceled);
    }
}
