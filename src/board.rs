//! Observable state shared between the worker threads and whatever renders
//! it. Workers post updates; readers take snapshots or wait for events.

use crate::error::FixError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Success,
    Warning,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Warning | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub status_message: String,
    pub logs: Vec<String>,
    pub progress: Option<f64>,
    pub progress_label: String,
    pub is_running: bool,
    pub had_errors: bool,
    pub steps: Vec<StepReport>,
}

/// Outcome of one pipeline step as recorded on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub title: String,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            status_message: "Idle".to_string(),
            logs: Vec::new(),
            progress: None,
            progress_label: "Ready".to_string(),
            is_running: false,
            had_errors: false,
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxSnapshot {
    pub status: String,
    pub is_launching: bool,
    pub is_installing_engine: bool,
    pub is_auto_flow: bool,
}

impl Default for SandboxSnapshot {
    fn default() -> Self {
        Self {
            status: "Docker sandbox not running".to_string(),
            is_launching: false,
            is_installing_engine: false,
            is_auto_flow: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardEvent {
    pub id: u64,
    pub ts: String,
    pub event_type: String,
    pub severity: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct BoardState {
    run: RunSnapshot,
    sandbox: SandboxSnapshot,
    next_event_id: u64,
    events: VecDeque<BoardEvent>,
}

/// Handle to the shared state; clones refer to the same board.
#[derive(Clone)]
pub struct Board {
    shared: Arc<(Mutex<BoardState>, Condvar)>,
    events_path: Option<PathBuf>,
}

impl Board {
    pub fn new(events_path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new((Mutex::new(BoardState::default()), Condvar::new())),
            events_path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // A panicking worker must not take the observable state down with it.
        let (lock, _) = &*self.shared;
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records an event and wakes subscribers. The returned copy is for
    /// `persist`, which must run after the guard is dropped.
    fn emit(
        &self,
        state: &mut BoardState,
        event_type: &str,
        severity: &str,
        payload: serde_json::Value,
    ) -> BoardEvent {
        state.next_event_id = state.next_event_id.saturating_add(1);
        let event = BoardEvent {
            id: state.next_event_id,
            ts: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            severity: severity.to_string(),
            payload,
        };
        state.events.push_back(event.clone());
        while state.events.len() > EVENT_CAPACITY {
            let _ = state.events.pop_front();
        }
        let (_, condvar) = &*self.shared;
        condvar.notify_all();
        event
    }

    /// Appends to the events file, best-effort. Never called with the lock held.
    fn persist(&self, event: BoardEvent) {
        if let Some(path) = &self.events_path {
            let _ = append_event_line(path, &event);
        }
    }

    // ---- repair run ----

    /// Starts a new run unless one is active. Clears the previous run's log.
    pub fn try_begin_run(&self) -> bool {
        let event = {
            let mut state = self.lock();
            if state.run.is_running {
                return false;
            }
            state.run = RunSnapshot {
                status: RunStatus::Running,
                status_message: "Starting...".to_string(),
                progress_label: "Starting".to_string(),
                is_running: true,
                ..RunSnapshot::default()
            };
            self.emit(&mut state, "run.started", "info", json!({}))
        };
        self.persist(event);
        true
    }

    pub fn set_status(&self, message: &str, status: RunStatus) {
        let event = {
            let mut state = self.lock();
            state.run.status_message = message.to_string();
            state.run.status = status;
            self.emit(
                &mut state,
                "run.status",
                "info",
                json!({"message": message, "status": status}),
            )
        };
        self.persist(event);
    }

    pub fn log(&self, line: &str) {
        self.push_log(line, "run.log", severity_for_line(line), json!({"line": line}));
    }

    pub fn set_progress(&self, value: Option<f64>, label: &str) {
        let event = {
            let mut state = self.lock();
            state.run.progress = value;
            state.run.progress_label = label.to_string();
            self.emit(
                &mut state,
                "run.progress",
                "info",
                json!({"progress": value, "label": label}),
            )
        };
        self.persist(event);
    }

    pub fn step_succeeded(&self, title: &str) {
        self.lock().run.steps.push(StepReport {
            title: title.to_string(),
            error: None,
            error_code: None,
        });
        self.log(&format!("[ok] {title}"));
    }

    /// Flags the run as having errors and logs the failure together with the
    /// error's stable code.
    pub fn step_failed(&self, title: &str, err: &FixError) {
        let line = format!("[error] {title}: {err}");
        {
            let mut state = self.lock();
            state.run.had_errors = true;
            state.run.steps.push(StepReport {
                title: title.to_string(),
                error: Some(err.to_string()),
                error_code: Some(err.code().to_string()),
            });
        }
        self.push_log(
            &line,
            "run.log",
            "error",
            json!({"line": line, "step": title, "error_code": err.code()}),
        );
    }

    /// Moves the run to its terminal state once every step has executed.
    pub fn finish_run(&self) {
        let event = self.finish_run_locked();
        self.persist(event);
    }

    fn finish_run_locked(&self) -> BoardEvent {
        let mut state = self.lock();
        let had_errors = state.run.had_errors;
        state.run.status = if had_errors {
            RunStatus::Warning
        } else {
            RunStatus::Success
        };
        state.run.status_message = if had_errors {
            "Finished with warnings".to_string()
        } else {
            "Zoom repaired".to_string()
        };
        state.run.progress = None;
        state.run.progress_label = "Done".to_string();
        state.run.is_running = false;
        let status = state.run.status;
        self.emit(
            &mut state,
            "run.finished",
            if had_errors { "warn" } else { "info" },
            json!({"status": status, "had_errors": had_errors}),
        )
    }

    /// Ends the run without completing the step list.
    pub fn fail_run(&self, reason: &str) {
        let event = {
            let mut state = self.lock();
            state.run.logs.push(format!("[error] {reason}"));
            state.run.status = RunStatus::Failed;
            state.run.status_message = reason.to_string();
            state.run.progress = None;
            state.run.progress_label = "Done".to_string();
            state.run.is_running = false;
            state.run.had_errors = true;
            self.emit(
                &mut state,
                "run.finished",
                "error",
                json!({"status": RunStatus::Failed, "reason": reason}),
            )
        };
        self.persist(event);
    }

    pub fn run_snapshot(&self) -> RunSnapshot {
        self.lock().run.clone()
    }

    // ---- sandbox session ----

    /// Claims the sandbox session. Refused while a launch is in flight, and
    /// also while an engine install is in flight when `exclusive_of_install`.
    pub fn try_begin_sandbox(
        &self,
        exclusive_of_install: bool,
        status: &str,
        installing: Option<bool>,
        auto: Option<bool>,
    ) -> bool {
        let event = {
            let mut state = self.lock();
            if state.sandbox.is_launching
                || (exclusive_of_install && state.sandbox.is_installing_engine)
            {
                return false;
            }
            state.sandbox.is_launching = true;
            apply_flags(&mut state.sandbox, installing, auto);
            self.emit_sandbox(&mut state, status)
        };
        self.persist(event);
        true
    }

    pub fn set_sandbox(&self, status: &str, launching: bool, installing: Option<bool>, auto: Option<bool>) {
        let event = {
            let mut state = self.lock();
            state.sandbox.is_launching = launching;
            apply_flags(&mut state.sandbox, installing, auto);
            self.emit_sandbox(&mut state, status)
        };
        self.persist(event);
    }

    /// Replaces the status text and leaves every in-flight flag as it is.
    pub fn set_sandbox_status(&self, status: &str) {
        let event = {
            let mut state = self.lock();
            self.emit_sandbox(&mut state, status)
        };
        self.persist(event);
    }

    fn emit_sandbox(&self, state: &mut BoardState, status: &str) -> BoardEvent {
        state.sandbox.status = status.to_string();
        let payload = serde_json::to_value(&state.sandbox).unwrap_or_else(|_| json!({}));
        self.emit(state, "sandbox.status", "info", payload)
    }

    /// Sandbox output shares the visible log with the repair run.
    pub fn sandbox_log(&self, line: &str) {
        self.push_log(line, "sandbox.log", "info", json!({"line": line}));
    }

    pub fn sandbox_snapshot(&self) -> SandboxSnapshot {
        self.lock().sandbox.clone()
    }

    fn push_log(&self, line: &str, event_type: &str, severity: &str, payload: serde_json::Value) {
        let event = {
            let mut state = self.lock();
            state.run.logs.push(line.to_string());
            self.emit(&mut state, event_type, severity, payload)
        };
        self.persist(event);
    }

    // ---- subscription ----

    /// Events with an id greater than `after_id`, waiting up to `timeout` for
    /// at least one to arrive.
    pub fn wait_events(&self, after_id: u64, timeout: Duration) -> Vec<BoardEvent> {
        let (_, condvar) = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.next_event_id > after_id {
                return state
                    .events
                    .iter()
                    .filter(|event| event.id > after_id)
                    .cloned()
                    .collect();
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            state = match condvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

fn apply_flags(sandbox: &mut SandboxSnapshot, installing: Option<bool>, auto: Option<bool>) {
    if let Some(installing) = installing {
        sandbox.is_installing_engine = installing;
    }
    if let Some(auto) = auto {
        sandbox.is_auto_flow = auto;
    }
}

fn severity_for_line(line: &str) -> &'static str {
    if line.starts_with("[error]") {
        "error"
    } else {
        "info"
    }
}

fn append_event_line(path: &Path, event: &BoardEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut content = serde_json::to_string(event)?;
    content.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(content.as_bytes())
}
