//! Scripted in-memory sandbox.
//!
//! Commands are matched against registered [`ScriptedCommand`]s and replay
//! their steps. Files and directories live in maps. Useful as a stand-in when
//! the real execution environment is unavailable, and for tests.

use crate::error::AppError;
use crate::sandbox::{ProcessEvent, Sandbox, SandboxProcess, SpawnRequest};
use crate::utils::path_utils::resolve_logical_path;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
enum ScriptStep {
    Output(Vec<u8>),
    Delay(Duration),
    Port(u16),
    ReadError(String),
}

/// What a scripted command does when spawned.
#[derive(Debug, Clone)]
pub struct ScriptedCommand {
    steps: Vec<ScriptStep>,
    /// `None` keeps the process alive until it is killed.
    exit_code: Option<i32>,
    spawn_error: Option<String>,
}

impl Default for ScriptedCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCommand {
    /// A command that exits with code 0 after its steps.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            exit_code: Some(0),
            spawn_error: None,
        }
    }

    pub fn output(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.steps.push(ScriptStep::Output(chunk.as_ref().to_vec()));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    /// Emits a sandbox-level port-ready notification.
    pub fn port(mut self, port: u16) -> Self {
        self.steps.push(ScriptStep::Port(port));
        self
    }

    pub fn read_error(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::ReadError(message.into()));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn runs_until_killed(mut self) -> Self {
        self.exit_code = None;
        self
    }

    pub fn rejects_spawn(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::new()
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    scripts: Vec<(String, ScriptedCommand)>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    failing_writes: HashSet<String>,
    spawned: Vec<SpawnRequest>,
    killed: Vec<String>,
}

#[derive(Debug)]
pub struct MemorySandbox {
    workdir: String,
    ready: watch::Sender<bool>,
    state: Arc<StdMutex<MemoryState>>,
}

impl Default for MemorySandbox {
    fn default() -> Self {
        Self::new("/home/project")
    }
}

impl MemorySandbox {
    /// A ready sandbox whose filesystem holds `workdir` and its ancestors.
    pub fn new(workdir: &str) -> Self {
        let workdir = resolve_logical_path("/", workdir, "/");
        let mut state = MemoryState::default();
        insert_with_ancestors(&mut state.dirs, &workdir);
        let (ready, _) = watch::channel(true);
        Self {
            workdir,
            ready,
            state: Arc::new(StdMutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Registers a script for `command`. A script matches the exact line or any
    /// line that starts with it followed by arguments; the longest match wins.
    pub fn script(&self, command: &str, script: ScriptedCommand) -> &Self {
        self.state().scripts.push((command.trim().to_string(), script));
        self
    }

    pub fn fail_writes_to(&self, path: &str) -> &Self {
        let resolved = self.resolve(path);
        self.state().failing_writes.insert(resolved);
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        let resolved = self.resolve(path);
        self.state().files.get(&resolved).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.state().files.clone()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        let resolved = self.resolve(path);
        self.state().dirs.contains(&resolved)
    }

    /// Command lines spawned so far, oldest first.
    pub fn spawned(&self) -> Vec<String> {
        self.state().spawned.iter().map(|r| r.command_line.clone()).collect()
    }

    pub fn spawn_requests(&self) -> Vec<SpawnRequest> {
        self.state().spawned.clone()
    }

    /// Command lines whose processes were killed.
    pub fn killed(&self) -> Vec<String> {
        self.state().killed.clone()
    }

    fn resolve(&self, path: &str) -> String {
        resolve_logical_path(&self.workdir, path, &self.workdir)
    }

    fn find_script(state: &MemoryState, command_line: &str) -> Option<ScriptedCommand> {
        state
            .scripts
            .iter()
            .filter(|(key, _)| {
                command_line == key
                    || command_line
                        .strip_prefix(key.as_str())
                        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, script)| script.clone())
    }
}

fn insert_with_ancestors(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = String::new();
    dirs.insert("/".to_string());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        dirs.insert(current.clone());
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    async fn wait_until_ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SandboxProcess>, AppError> {
        let mut state = self.state();
        state.spawned.push(request.clone());
        let script = Self::find_script(&state, &request.command_line).unwrap_or_else(|| {
            ScriptedCommand::new()
                .output(format!("sh: {}: command not found\n", request.program))
                .exit(127)
        });
        if let Some(message) = script.spawn_error {
            return Err(AppError::ProcessSpawn(message));
        }
        debug!(command = %request.command_line, "Spawning scripted command");
        Ok(Box::new(MemoryProcess {
            command_line: request.command_line,
            steps: script.steps.into(),
            exit_code: script.exit_code,
            resume_at: None,
            killed: false,
            state: Arc::clone(&self.state),
        }))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), AppError> {
        let resolved = self.resolve(path);
        let mut state = self.state();
        if state.failing_writes.contains(&resolved) {
            return Err(AppError::StdIoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("EACCES: permission denied, open '{}'", resolved),
            )));
        }
        if !state.dirs.contains(&parent_of(&resolved)) {
            return Err(AppError::StdIoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("ENOENT: no such file or directory, open '{}'", resolved),
            )));
        }
        state.files.insert(resolved, contents.to_vec());
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), AppError> {
        let resolved = self.resolve(path);
        let mut state = self.state();
        if recursive {
            insert_with_ancestors(&mut state.dirs, &resolved);
        } else if state.dirs.contains(&parent_of(&resolved)) {
            state.dirs.insert(resolved);
        } else {
            return Err(AppError::StdIoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("ENOENT: no such file or directory, mkdir '{}'", resolved),
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryProcess {
    command_line: String,
    steps: VecDeque<ScriptStep>,
    exit_code: Option<i32>,
    /// Pending delay; kept on the struct so a dropped read resumes it.
    resume_at: Option<Instant>,
    killed: bool,
    state: Arc<StdMutex<MemoryState>>,
}

#[async_trait]
impl SandboxProcess for MemoryProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, AppError> {
        loop {
            if self.killed {
                return Ok(None);
            }
            if let Some(deadline) = self.resume_at {
                sleep_until(deadline).await;
                self.resume_at = None;
            }
            match self.steps.pop_front() {
                Some(ScriptStep::Output(bytes)) => return Ok(Some(ProcessEvent::Output(bytes))),
                Some(ScriptStep::Delay(duration)) => self.resume_at = Some(Instant::now() + duration),
                Some(ScriptStep::Port(port)) => {
                    return Ok(Some(ProcessEvent::PortReady {
                        port,
                        url: format!("http://localhost:{}", port),
                    }))
                }
                Some(ScriptStep::ReadError(message)) => return Err(AppError::StreamRead(message)),
                None if self.exit_code.is_some() => return Ok(None),
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn wait(&mut self) -> Result<i32, AppError> {
        if self.killed {
            return Ok(-9);
        }
        match self.exit_code {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> Result<(), AppError> {
        if !self.killed {
            self.killed = true;
            self.state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .killed
                .push(self.command_line.clone());
        }
        Ok(())
    }
}
