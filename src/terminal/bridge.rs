//! Runs one command in the sandbox and feeds its output into a session.
//!
//! Every run carries a `run_id`. Output is applied only while the session
//! still points at that run (as its active command or its dev server), so an
//! interrupted or replaced process can never write past its `^C` marker.

use crate::error::AppError;
use crate::sandbox::{ProcessEvent, SandboxProcess, SpawnRequest};
use crate::terminal::buffer::OutputBuffer;
use crate::terminal::session::{DevServer, OutputLine, SessionId, TerminalSession};
use crate::terminal::{Terminal, TerminalEvent};
use crate::utils::chunk_decoder::ChunkDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

static LOCAL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\])(?::\d{1,5})?(?:/[^\s'\x22<>)]*)?")
        .expect("Invalid LOCAL_URL regex")
});

static LISTENING_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:listening|running|started|serving|ready|available)\b.*?\bport\s*:?\s*(\d{2,5})\b")
        .expect("Invalid LISTENING_PORT regex")
});

/// Finds the address a dev server reports itself on, e.g. vite's
/// `Local: http://localhost:5173/` or `Server listening on port 3000`.
///
/// Wildcard hosts are rewritten to `localhost` and a bare trailing slash is dropped.
pub fn detect_server_url(line: &str) -> Option<String> {
    if let Some(found) = LOCAL_URL.find(line) {
        let url = found
            .as_str()
            .trim_end_matches(['.', ',', ';'])
            .replacen("0.0.0.0", "localhost", 1)
            .replacen("[::]", "localhost", 1);
        let url = match url.strip_suffix('/') {
            Some(stripped) if stripped.matches('/').count() == 2 => stripped.to_string(),
            _ => url,
        };
        return Some(url);
    }
    LISTENING_PORT
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|port| port.as_str().parse::<u16>().ok())
        .map(|port| format!("http://localhost:{}", port))
}

/// Which handle on the session a process writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOwner {
    Command(u64),
    Server(u64),
}

impl RunOwner {
    fn owns(self, session: &TerminalSession) -> bool {
        match self {
            RunOwner::Command(run_id) => session
                .active_run
                .as_ref()
                .is_some_and(|run| run.run_id == run_id),
            RunOwner::Server(run_id) => session
                .dev_server
                .as_ref()
                .is_some_and(|server| server.run_id == run_id),
        }
    }
}

enum PumpEnd {
    /// The output stream ended.
    Eof,
    /// Stop was requested or the session moved on without this run.
    Stopped,
    Failed(AppError),
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until_deadline(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

impl Terminal {
    /// Runs a command that is expected to exit on its own. The session stays
    /// busy until it does.
    #[instrument(skip(self, request, cancel), fields(session_id = %id, command = %request.command_line))]
    pub(crate) async fn run_bounded(
        self,
        id: SessionId,
        run_id: u64,
        request: SpawnRequest,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let owner = RunOwner::Command(run_id);
        let mut process = match self.spawn_process(id, request).await {
            Ok(process) => process,
            Err(e) => {
                warn!(error = %e, "Spawn failed");
                self.finish_run(id, run_id, Some(OutputLine::error(e.to_terminal_line())))
                    .await;
                return;
            }
        };

        match self.pump(id, owner, process.as_mut(), &mut cancel).await {
            PumpEnd::Stopped => {
                debug!(run_id, "Command interrupted");
                kill_quietly(process.as_mut()).await;
            }
            PumpEnd::Failed(e) => {
                warn!(run_id, error = %e, "Output stream failed");
                kill_quietly(process.as_mut()).await;
                self.finish_run(id, run_id, Some(OutputLine::error(e.to_terminal_line())))
                    .await;
            }
            PumpEnd::Eof => {
                let exit = tokio::select! {
                    _ = &mut cancel => None,
                    code = process.wait() => Some(code),
                };
                match exit {
                    None => kill_quietly(process.as_mut()).await,
                    Some(Ok(0)) => self.finish_run(id, run_id, None).await,
                    Some(Ok(code)) => {
                        debug!(run_id, code, "Command exited with non-zero code");
                        let line = OutputLine::info(format!("Process exited with code {}", code));
                        self.finish_run(id, run_id, Some(line)).await;
                    }
                    Some(Err(e)) => {
                        self.finish_run(id, run_id, Some(OutputLine::error(e.to_terminal_line())))
                            .await
                    }
                }
            }
        }
    }

    /// Runs a long-lived server. The session is released as soon as the
    /// process has spawned; the server then lives on as the session's dev
    /// server until it is stopped or exits.
    #[instrument(skip(self, request, cancel), fields(session_id = %id, command = %request.command_line))]
    pub(crate) async fn run_server(
        self,
        id: SessionId,
        run_id: u64,
        request: SpawnRequest,
        cancel: oneshot::Receiver<()>,
    ) {
        let command = request.command_line.clone();
        let mut process = match self.spawn_process(id, request).await {
            Ok(process) => process,
            Err(e) => {
                warn!(error = %e, "Spawn failed");
                self.finish_run(id, run_id, Some(OutputLine::error(e.to_terminal_line())))
                    .await;
                return;
            }
        };
        // From here on the dev server's own stop channel takes over. An
        // interrupt during the spawn shows up as a missing active run below.
        drop(cancel);

        let (stop_tx, mut stop_rx) = oneshot::channel();
        {
            let mut sessions = self.inner.sessions.lock().await;
            let attached = match sessions.get_mut(id) {
                Ok(session) if RunOwner::Command(run_id).owns(session) => {
                    self.attach_server(session, run_id, command, stop_tx);
                    true
                }
                _ => false,
            };
            if !attached {
                drop(sessions);
                debug!(run_id, "Server interrupted before it started");
                kill_quietly(process.as_mut()).await;
                return;
            }
        }

        let owner = RunOwner::Server(run_id);
        match self.pump(id, owner, process.as_mut(), &mut stop_rx).await {
            PumpEnd::Stopped => {
                debug!(run_id, "Dev server stopped");
                kill_quietly(process.as_mut()).await;
            }
            PumpEnd::Failed(e) => {
                warn!(run_id, error = %e, "Dev server output stream failed");
                kill_quietly(process.as_mut()).await;
                self.server_exited(id, run_id, OutputLine::error(e.to_terminal_line()))
                    .await;
            }
            PumpEnd::Eof => {
                let exit = tokio::select! {
                    _ = &mut stop_rx => None,
                    code = process.wait() => Some(code),
                };
                let line = match exit {
                    None => {
                        kill_quietly(process.as_mut()).await;
                        return;
                    }
                    Some(Ok(code)) => OutputLine::info(format!("Dev server exited with code {}", code)),
                    Some(Err(e)) => OutputLine::error(e.to_terminal_line()),
                };
                self.server_exited(id, run_id, line).await;
            }
        }
    }

    /// Stops the session's dev server. Returns `false` when none was attached.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn stop_dev_server(&self, id: SessionId) -> Result<bool, AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.get_mut(id)?;
        let Some(mut server) = session.dev_server.take() else {
            return Ok(false);
        };
        server.request_stop();
        info!(command = %server.command, "Stopping dev server");
        self.push_line(session, OutputLine::info("Dev server stopped."));
        self.emit(TerminalEvent::DevServerStopped { session_id: id });
        Ok(true)
    }

    async fn spawn_process(
        &self,
        id: SessionId,
        request: SpawnRequest,
    ) -> Result<Box<dyn SandboxProcess>, AppError> {
        if let Some(audit_log) = &self.inner.audit_log {
            audit_log
                .log_command(&id.to_string(), &request.cwd, &request.command_line)
                .await;
        }
        self.inner.sandbox.spawn(request).await
    }

    /// Streams process output into the session until the stream ends, a stop
    /// is requested, or the session no longer belongs to `owner`.
    async fn pump(
        &self,
        id: SessionId,
        owner: RunOwner,
        process: &mut dyn SandboxProcess,
        stop: &mut oneshot::Receiver<()>,
    ) -> PumpEnd {
        let mut decoder = ChunkDecoder::new();
        let mut buffer = OutputBuffer::new(self.inner.config.flush_idle);

        loop {
            let deadline = buffer.deadline();
            tokio::select! {
                biased;
                _ = &mut *stop => return PumpEnd::Stopped,
                _ = sleep_until_deadline(deadline) => {
                    let lines = buffer.poll_idle(now());
                    if !self.deliver(id, owner, lines).await {
                        return PumpEnd::Stopped;
                    }
                }
                event = process.next_event() => match event {
                    Ok(Some(ProcessEvent::Output(bytes))) => {
                        let text = decoder.decode(&bytes);
                        let lines = buffer.push(&text, now());
                        if !self.deliver(id, owner, lines).await {
                            return PumpEnd::Stopped;
                        }
                    }
                    Ok(Some(ProcessEvent::PortReady { port, url })) => {
                        debug!(port, url = %url, "Sandbox reported a bound port");
                        if !self.port_ready(id, owner, url).await {
                            return PumpEnd::Stopped;
                        }
                    }
                    Ok(None) => {
                        let mut lines = buffer.push(&decoder.finish(), now());
                        lines.extend(buffer.finish());
                        return if self.deliver(id, owner, lines).await {
                            PumpEnd::Eof
                        } else {
                            PumpEnd::Stopped
                        };
                    }
                    Err(e) => {
                        let mut lines = buffer.push(&decoder.finish(), now());
                        lines.extend(buffer.finish());
                        return if self.deliver(id, owner, lines).await {
                            PumpEnd::Failed(e)
                        } else {
                            PumpEnd::Stopped
                        };
                    }
                }
            }
        }
    }

    /// Appends flushed lines if `owner` still holds the session. For a dev
    /// server, each line is also scanned for its listening address.
    async fn deliver(&self, id: SessionId, owner: RunOwner, lines: Vec<String>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Ok(session) = sessions.get_mut(id) else {
            return false;
        };
        if !owner.owns(session) {
            return false;
        }
        for line in lines {
            let detected = match owner {
                RunOwner::Server(_) if session.dev_server_url().is_none() => detect_server_url(&line),
                _ => None,
            };
            self.push_line(session, OutputLine::output(line));
            if let Some(url) = detected {
                self.announce_server(session, url);
            }
        }
        true
    }

    async fn port_ready(&self, id: SessionId, owner: RunOwner, url: String) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Ok(session) = sessions.get_mut(id) else {
            return false;
        };
        if !owner.owns(session) {
            return false;
        }
        if matches!(owner, RunOwner::Server(_)) {
            self.announce_server(session, url);
        }
        true
    }

    /// Records the server address and raises the started event, once per server.
    fn announce_server(&self, session: &mut TerminalSession, url: String) {
        let Some(server) = session.dev_server.as_mut() else {
            return;
        };
        if server.url.is_some() {
            return;
        }
        server.url = Some(url.clone());
        info!(session_id = %session.id(), url = %url, "Dev server detected");
        self.push_line(session, OutputLine::info(format!("Dev server running at {}", url)));
        self.emit(TerminalEvent::DevServerStarted {
            session_id: session.id(),
            url,
        });
    }

    fn attach_server(
        &self,
        session: &mut TerminalSession,
        run_id: u64,
        command: String,
        stop: oneshot::Sender<()>,
    ) {
        session.active_run = None;
        if let Some(mut previous) = session.dev_server.take() {
            previous.request_stop();
            self.push_line(session, OutputLine::info("Stopped previous dev server."));
            self.emit(TerminalEvent::DevServerStopped {
                session_id: session.id(),
            });
        }
        session.dev_server = Some(DevServer {
            run_id,
            command,
            url: None,
            stop: Some(stop),
        });
        self.set_running(session, false);
        self.start_next_queued(session);
    }

    async fn server_exited(&self, id: SessionId, run_id: u64, line: OutputLine) {
        let mut sessions = self.inner.sessions.lock().await;
        let Ok(session) = sessions.get_mut(id) else {
            return;
        };
        if !RunOwner::Server(run_id).owns(session) {
            return;
        }
        session.dev_server = None;
        self.push_line(session, line);
        self.emit(TerminalEvent::DevServerStopped { session_id: id });
    }

    /// Releases the session from `run_id`, appending `line` first. Ends the
    /// bootstrap if this was its install step, then starts anything queued.
    pub(crate) async fn finish_run(&self, id: SessionId, run_id: u64, line: Option<OutputLine>) {
        let mut sessions = self.inner.sessions.lock().await;
        let Ok(session) = sessions.get_mut(id) else {
            return;
        };
        if !RunOwner::Command(run_id).owns(session) {
            return;
        }
        session.active_run = None;
        if let Some(line) = line {
            self.push_line(session, line);
        }
        if session.bootstrapping {
            self.finish_bootstrap(session);
        } else {
            self.set_running(session, false);
            self.start_next_queued(session);
        }
    }
}

async fn kill_quietly(process: &mut dyn SandboxProcess) {
    if let Err(e) = process.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
}
