use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| AppError::SessionNotFound(s.to_string()))
    }
}

/// How a line should be styled by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Banner,
    /// Echo of submitted input.
    Input,
    Output,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub kind: LineKind,
    pub text: String,
}

impl OutputLine {
    pub fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self::new(LineKind::Output, text)
    }

    pub fn input(command: &str) -> Self {
        Self::new(LineKind::Input, format!("$ {}", command))
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LineKind::Info, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(LineKind::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LineKind::Error, text)
    }
}

/// The command currently occupying a session.
#[derive(Debug)]
pub(crate) struct ActiveRun {
    pub run_id: u64,
    pub cancel: Option<oneshot::Sender<()>>,
}

/// A long-running server process attached to a session.
#[derive(Debug)]
pub(crate) struct DevServer {
    pub run_id: u64,
    pub command: String,
    pub url: Option<String>,
    pub stop: Option<oneshot::Sender<()>>,
}

impl DevServer {
    /// Asks the server task to kill its process. Safe to call more than once.
    pub fn request_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[derive(Debug)]
pub struct TerminalSession {
    id: SessionId,
    name: String,
    output_lines: Vec<OutputLine>,
    command_history: Vec<String>,
    /// `None` when not navigating history.
    history_cursor: Option<usize>,
    pending_input: String,
    current_directory: String,
    is_running: bool,
    pub(crate) active_run: Option<ActiveRun>,
    pub(crate) dev_server: Option<DevServer>,
    pub(crate) bootstrapping: bool,
    pub(crate) queued: VecDeque<String>,
}

impl TerminalSession {
    fn new(name: String, banner: &str, workdir: &str) -> Self {
        Self {
            id: SessionId::new(),
            name,
            output_lines: vec![OutputLine::new(LineKind::Banner, banner)],
            command_history: Vec::new(),
            history_cursor: None,
            pending_input: String::new(),
            current_directory: workdir.to_string(),
            is_running: false,
            active_run: None,
            dev_server: None,
            bootstrapping: false,
            queued: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_lines(&self) -> &[OutputLine] {
        &self.output_lines
    }

    pub fn command_history(&self) -> &[String] {
        &self.command_history
    }

    pub fn history_cursor(&self) -> Option<usize> {
        self.history_cursor
    }

    pub fn pending_input(&self) -> &str {
        &self.pending_input
    }

    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    pub fn dev_server_url(&self) -> Option<&str> {
        self.dev_server.as_ref().and_then(|server| server.url.as_deref())
    }

    pub fn has_dev_server(&self) -> bool {
        self.dev_server.is_some()
    }

    pub(crate) fn push_line(&mut self, line: OutputLine) {
        self.output_lines.push(line);
    }

    pub(crate) fn clear_output(&mut self) {
        self.output_lines.clear();
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.is_running = running;
    }

    pub(crate) fn set_current_directory(&mut self, directory: String) {
        self.current_directory = directory;
    }

    pub(crate) fn record_command(&mut self, command: &str) {
        self.command_history.push(command.to_string());
        self.history_cursor = None;
        self.pending_input.clear();
    }

    pub fn set_pending_input(&mut self, input: impl Into<String>) {
        self.pending_input = input.into();
    }

    /// Recalls the previous history entry into the pending input.
    /// Stops at the oldest entry.
    pub fn history_up(&mut self) -> &str {
        if let Some(last) = self.command_history.len().checked_sub(1) {
            let idx = match self.history_cursor {
                None => last,
                Some(i) => i.saturating_sub(1),
            };
            self.history_cursor = Some(idx);
            self.pending_input = self.command_history[idx].clone();
        }
        &self.pending_input
    }

    /// Moves toward newer entries; past the newest the input is cleared.
    pub fn history_down(&mut self) -> &str {
        match self.history_cursor {
            Some(i) if i + 1 < self.command_history.len() => {
                self.history_cursor = Some(i + 1);
                self.pending_input = self.command_history[i + 1].clone();
            }
            Some(_) => {
                self.history_cursor = None;
                self.pending_input.clear();
            }
            None => {}
        }
        &self.pending_input
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            name: self.name.clone(),
            output_lines: self.output_lines.clone(),
            command_history: self.command_history.clone(),
            history_cursor: self.history_cursor,
            pending_input: self.pending_input.clone(),
            current_directory: self.current_directory.clone(),
            is_running: self.is_running,
            is_bootstrapping: self.bootstrapping,
            dev_server_url: self.dev_server_url().map(str::to_string),
        }
    }
}

/// Point-in-time copy of a session for hosts to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub name: String,
    pub output_lines: Vec<OutputLine>,
    pub command_history: Vec<String>,
    pub history_cursor: Option<usize>,
    pub pending_input: String,
    pub current_directory: String,
    pub is_running: bool,
    pub is_bootstrapping: bool,
    pub dev_server_url: Option<String>,
}

/// Owns every open session; all mutation is keyed by [`SessionId`].
#[derive(Debug)]
pub struct SessionManager {
    sessions: Vec<TerminalSession>,
    active: Option<SessionId>,
    created: usize,
    banner: String,
    workdir: String,
}

impl SessionManager {
    pub fn new(banner: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            sessions: Vec::new(),
            active: None,
            created: 0,
            banner: banner.into(),
            workdir: workdir.into(),
        }
    }

    /// Opens a session with a banner line and makes it active.
    pub fn create_session(&mut self) -> SessionId {
        self.created += 1;
        let session = TerminalSession::new(
            format!("Terminal {}", self.created),
            &self.banner,
            &self.workdir,
        );
        let id = session.id;
        debug!(session_id = %id, name = %session.name, "Created session");
        self.sessions.push(session);
        self.active = Some(id);
        id
    }

    /// Removes a session. Refused with [`AppError::SessionInUse`] while a dev
    /// server is attached unless `confirm_stop` is set; stopping that server is
    /// left to the caller, which receives the removed session.
    pub fn close_session(
        &mut self,
        id: SessionId,
        confirm_stop: bool,
    ) -> Result<TerminalSession, AppError> {
        let idx = self.index_of(id)?;
        if self.sessions[idx].dev_server.is_some() && !confirm_stop {
            return Err(AppError::SessionInUse(id.to_string()));
        }
        let removed = self.sessions.remove(idx);
        if self.active == Some(id) {
            self.active = self.sessions.first().map(|s| s.id);
        }
        debug!(session_id = %id, active = ?self.active, "Closed session");
        Ok(removed)
    }

    pub fn get(&self, id: SessionId) -> Result<&TerminalSession, AppError> {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: SessionId) -> Result<&mut TerminalSession, AppError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    fn index_of(&self, id: SessionId) -> Result<usize, AppError> {
        self.sessions
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    pub fn append_line(&mut self, id: SessionId, line: OutputLine) -> Result<(), AppError> {
        self.get_mut(id)?.push_line(line);
        Ok(())
    }

    pub fn clear(&mut self, id: SessionId) -> Result<(), AppError> {
        self.get_mut(id)?.clear_output();
        Ok(())
    }

    pub fn set_running(&mut self, id: SessionId, running: bool) -> Result<(), AppError> {
        self.get_mut(id)?.set_running(running);
        Ok(())
    }

    pub fn active(&self) -> Option<SessionId> {
        self.active
    }

    pub fn set_active(&mut self, id: SessionId) -> Result<(), AppError> {
        self.index_of(id)?;
        self.active = Some(id);
        Ok(())
    }

    /// Session ids in creation order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn sessions_mut(&mut self) -> impl Iterator<Item = &mut TerminalSession> {
        self.sessions.iter_mut()
    }
}
