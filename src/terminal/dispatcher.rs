use crate::error::AppError;
use crate::sandbox::{split_command_line, SpawnRequest};
use crate::terminal::session::{ActiveRun, LineKind, OutputLine, SessionId, TerminalSession};
use crate::terminal::{Terminal, TerminalEvent};
use crate::utils::path_utils::resolve_logical_path;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

const HELP_TEXT: &[&str] = &[
    "Built-in commands:",
    "  clear, cls     Clear the terminal",
    "  cd <path>      Change directory (.. goes up, / is absolute, ~ is the project)",
    "  pwd            Print the current directory",
    "  help           Show this help",
    "  exit           Close this terminal",
    "Anything else runs in the sandbox, e.g. npm install, npm run dev, ls.",
    "Long-running servers keep running in the background; interrupt to stop them.",
];

/// Commands handled without touching the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    Clear,
    Help,
    Pwd,
    Exit,
    Cd(String),
}

impl Builtin {
    pub fn parse(command: &str) -> Option<Self> {
        let command = command.trim();
        let (word, rest) = match command.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (command, ""),
        };
        match word {
            "clear" | "cls" => Some(Builtin::Clear),
            "help" => Some(Builtin::Help),
            "pwd" => Some(Builtin::Pwd),
            "exit" => Some(Builtin::Exit),
            "cd" => {
                let target = split_command_line(rest)
                    .ok()
                    .and_then(|words| words.into_iter().next())
                    .unwrap_or_else(|| rest.to_string());
                Some(Builtin::Cd(target))
            }
            _ => None,
        }
    }
}

/// What happened to a submitted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input.
    Ignored,
    /// Another command is in flight; the input was dropped.
    Busy,
    /// The session is still bootstrapping; the command runs afterwards.
    Queued,
    Builtin,
    /// Handed to the process bridge.
    Started,
    /// Could not be started; the reason is in the session output.
    Failed,
}

impl Terminal {
    /// Handles one line of input, as on Enter.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn submit(&self, id: SessionId, input: &str) -> Result<SubmitOutcome, AppError> {
        let command = input.trim();
        if command.is_empty() {
            return Ok(SubmitOutcome::Ignored);
        }

        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.get_mut(id)?;

        if session.bootstrapping {
            session.record_command(command);
            session.queued.push_back(command.to_string());
            self.push_line(session, OutputLine::input(command));
            self.push_line(session, OutputLine::info("Queued until project setup finishes."));
            return Ok(SubmitOutcome::Queued);
        }
        if session.is_running() {
            debug!(command = %command, "Rejected input while a command is running");
            return Ok(SubmitOutcome::Busy);
        }

        session.record_command(command);
        match Builtin::parse(command) {
            Some(builtin) => {
                self.run_builtin(session, command, builtin);
                Ok(SubmitOutcome::Builtin)
            }
            None => {
                self.push_line(session, OutputLine::input(command));
                Ok(self.start_command(session, command))
            }
        }
    }

    fn run_builtin(&self, session: &mut TerminalSession, command: &str, builtin: Builtin) {
        if builtin == Builtin::Clear {
            session.clear_output();
            self.emit(TerminalEvent::Cleared {
                session_id: session.id(),
            });
            return;
        }

        self.push_line(session, OutputLine::input(command));
        match builtin {
            Builtin::Help => {
                for line in HELP_TEXT {
                    self.push_line(session, OutputLine::info(*line));
                }
            }
            Builtin::Pwd => {
                let cwd = session.current_directory().to_string();
                self.push_line(session, OutputLine::output(cwd));
            }
            Builtin::Exit => self.emit(TerminalEvent::CloseRequested {
                session_id: session.id(),
            }),
            Builtin::Cd(target) => {
                let workdir = &self.inner.config.workdir;
                let next = resolve_logical_path(session.current_directory(), &target, workdir);
                debug!(from = %session.current_directory(), to = %next, "Changed directory");
                session.set_current_directory(next);
            }
            Builtin::Clear => {}
        }
    }

    /// Starts `command` on the bridge. The caller holds the session lock and
    /// has checked that nothing else is in flight.
    pub(crate) fn start_command(&self, session: &mut TerminalSession, command: &str) -> SubmitOutcome {
        if !self.inner.sandbox.is_ready() {
            warn!(session_id = %session.id(), "Sandbox not ready");
            self.push_line(session, OutputLine::error(AppError::SandboxNotReady.to_terminal_line()));
            self.set_running(session, false);
            return SubmitOutcome::Failed;
        }
        let request = match SpawnRequest::from_command_line(command, session.current_directory()) {
            Ok(request) => request,
            Err(e) => {
                self.push_line(session, OutputLine::error(e.to_terminal_line()));
                return SubmitOutcome::Failed;
            }
        };

        let run_id = self.next_run_id();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        session.active_run = Some(ActiveRun {
            run_id,
            cancel: Some(cancel_tx),
        });
        self.set_running(session, true);

        let terminal = self.clone();
        let id = session.id();
        if self.inner.config.is_server_command(command) {
            debug!(run_id, command = %command, "Starting server command");
            tokio::spawn(terminal.run_server(id, run_id, request, cancel_rx));
        } else {
            debug!(run_id, command = %command, "Starting bounded command");
            tokio::spawn(terminal.run_bounded(id, run_id, request, cancel_rx));
        }
        SubmitOutcome::Started
    }

    /// Starts the next queued command, if any. Caller holds the session lock.
    pub(crate) fn start_next_queued(&self, session: &mut TerminalSession) {
        while !session.is_running() {
            let Some(command) = session.queued.pop_front() else {
                return;
            };
            match Builtin::parse(&command) {
                Some(builtin) => self.run_builtin(session, &command, builtin),
                None => {
                    self.push_line(session, OutputLine::input(&command));
                    self.start_command(session, &command);
                }
            }
        }
    }

    /// Requests cancellation of whatever occupies the session: the in-flight
    /// command, a running bootstrap, and any attached dev server.
    ///
    /// Returns `false` when there was nothing to interrupt.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn interrupt(&self, id: SessionId) -> Result<bool, AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.get_mut(id)?;

        let mut interrupted = false;
        if let Some(mut run) = session.active_run.take() {
            if let Some(cancel) = run.cancel.take() {
                let _ = cancel.send(());
            }
            interrupted = true;
        }
        if session.bootstrapping {
            session.bootstrapping = false;
            session.queued.clear();
            interrupted = true;
        }
        let server = session.dev_server.take();
        interrupted |= server.is_some();
        if !interrupted {
            return Ok(false);
        }

        self.push_line(session, OutputLine::new(LineKind::Warning, "^C"));
        if let Some(mut server) = server {
            server.request_stop();
            self.push_line(session, OutputLine::info("Dev server stopped."));
            self.emit(TerminalEvent::DevServerStopped { session_id: id });
        }
        self.set_running(session, false);
        Ok(true)
    }

    /// Recalls an older command into the pending input and returns it.
    pub async fn history_up(&self, id: SessionId) -> Result<String, AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        Ok(sessions.get_mut(id)?.history_up().to_string())
    }

    /// Recalls a newer command; past the newest the input is emptied.
    pub async fn history_down(&self, id: SessionId) -> Result<String, AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        Ok(sessions.get_mut(id)?.history_down().to_string())
    }

    pub async fn set_pending_input(&self, id: SessionId, input: &str) -> Result<(), AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        sessions.get_mut(id)?.set_pending_input(input);
        Ok(())
    }
}
