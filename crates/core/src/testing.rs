// crates/core/src/testing.rs
//! Scripted executor for tests. Each job's behavior is picked by its
//! `source` string, falling back to a default script.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::ExecutorError;
use crate::executor::{ExecutionRequest, Executor, ExecutorEvent, ExecutorHandle, RunningProcess};
use crate::job::JobId;

#[derive(Debug, Clone)]
pub enum ScriptLine {
    Stdout(String),
    Stderr(String),
}

/// Canned behavior for one fake process.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub lines: Vec<ScriptLine>,
    /// Files written as `<tmp_dir>/<tmp_id><suffix>` just before exiting.
    pub files: Vec<(String, usize)>,
    pub exit_code: Option<i32>,
    pub fail_spawn: bool,
    /// When set, the process holds before exiting until notified.
    pub gate: Option<Arc<Notify>>,
    /// When set, `spawn` itself does not return until notified.
    pub spawn_gate: Option<Arc<Notify>>,
    /// Exit code used when terminated while held. `None` ignores the request
    /// and keeps waiting for the gate.
    pub exit_on_terminate: Option<i32>,
}

impl Script {
    /// Exit 0 after writing `<tmp_id>.<ext>`.
    pub fn success(ext: &str) -> Self {
        Self {
            files: vec![(format!(".{ext}"), 16)],
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn spawn_failure() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, line: &str) -> Self {
        self.lines.push(ScriptLine::Stdout(line.to_string()));
        self
    }

    pub fn stderr(mut self, line: &str) -> Self {
        self.lines.push(ScriptLine::Stderr(line.to_string()));
        self
    }

    pub fn file(mut self, suffix: &str, bytes: usize) -> Self {
        self.files.push((suffix.to_string(), bytes));
        self
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn spawn_gated(mut self, gate: Arc<Notify>) -> Self {
        self.spawn_gate = Some(gate);
        self
    }

    pub fn exit_on_terminate(mut self, code: Option<i32>) -> Self {
        self.exit_on_terminate = code;
        self
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct FakeExecutor {
    default: Script,
    scripts: Mutex<HashMap<String, Script>>,
    spawned: Mutex<Vec<JobId>>,
    terminated: Arc<Mutex<Vec<JobId>>>,
}

impl FakeExecutor {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn with_script(self, source: &str, script: Script) -> Self {
        lock(&self.scripts).insert(source.to_string(), script);
        self
    }

    /// Jobs `spawn` was called for, in call order.
    pub fn spawned(&self) -> Vec<JobId> {
        lock(&self.spawned).clone()
    }

    /// Jobs whose process received a termination request.
    pub fn terminated(&self) -> Vec<JobId> {
        lock(&self.terminated).clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn spawn(&self, request: &ExecutionRequest) -> Result<RunningProcess, ExecutorError> {
        let script = lock(&self.scripts)
            .get(&request.source)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        lock(&self.spawned).push(request.job_id.clone());
        if let Some(gate) = &script.spawn_gate {
            gate.notified().await;
        }

        if script.fail_spawn {
            return Err(ExecutorError::Rejected("scripted spawn failure".into()));
        }

        let (tx, rx) = mpsc::channel(64);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let terminated = Arc::clone(&self.terminated);
        let request = request.clone();

        tokio::spawn(async move {
            for line in &script.lines {
                let event = match line {
                    ScriptLine::Stdout(l) => ExecutorEvent::Stdout(l.clone()),
                    ScriptLine::Stderr(l) => ExecutorEvent::Stderr(l.clone()),
                };
                let _ = tx.send(event).await;
            }

            let mut code = script.exit_code;
            if let Some(gate) = &script.gate {
                let mut terminate_rx = terminate_rx;
                let mut listening = true;
                loop {
                    tokio::select! {
                        _ = gate.notified() => break,
                        requested = &mut terminate_rx, if listening => {
                            listening = false;
                            if requested.is_ok() {
                                lock(&terminated).push(request.job_id.clone());
                                if let Some(c) = script.exit_on_terminate {
                                    code = Some(c);
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            for (suffix, bytes) in &script.files {
                let path = request.tmp_dir.join(format!("{}{}", request.tmp_id, suffix));
                let _ = tokio::fs::create_dir_all(&request.tmp_dir).await;
                let _ = tokio::fs::write(&path, vec![0u8; *bytes]).await;
            }
            let _ = tx.send(ExecutorEvent::Exited(code)).await;
        });

        Ok(RunningProcess {
            events: rx,
            handle: ExecutorHandle::new(None, terminate_tx),
        })
    }
}
