//! Interactive terminal sessions over a [`Sandbox`].
//!
//! Data flows host -> dispatcher -> bridge -> sandbox process -> buffer ->
//! normalizer -> session log. Hosts read session state through snapshots and
//! follow [`TerminalEvent`]s for live updates and the dev-server preview.

pub mod bootstrap;
pub mod bridge;
pub mod buffer;
pub mod dispatcher;
pub mod session;

pub use bootstrap::{DirectoryProjectSource, ProjectFile, ProjectSource, StaticProjectSource};
pub use buffer::{BufferState, OutputBuffer};
pub use dispatcher::{Builtin, SubmitOutcome};
pub use session::{LineKind, OutputLine, SessionId, SessionManager, SessionSnapshot, TerminalSession};

use crate::config::Config;
use crate::error::AppError;
use crate::sandbox::Sandbox;
use crate::utils::audit_logger::CommandAuditLog;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tracing::{debug, info, instrument};

/// Notifications raised to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Output { session_id: SessionId, line: OutputLine },
    Cleared { session_id: SessionId },
    RunningChanged { session_id: SessionId, running: bool },
    DevServerStarted { session_id: SessionId, url: String },
    DevServerStopped { session_id: SessionId },
    /// The user typed `exit`; closing the tab is up to the host.
    CloseRequested { session_id: SessionId },
}

struct TerminalInner {
    config: Arc<Config>,
    sandbox: Arc<dyn Sandbox>,
    sessions: TokioMutex<SessionManager>,
    events: broadcast::Sender<TerminalEvent>,
    project_source: Option<Arc<dyn ProjectSource>>,
    bootstrap_claimed: AtomicBool,
    audit_log: Option<CommandAuditLog>,
    next_run_id: AtomicU64,
}

/// Cheaply clonable handle to a set of terminal sessions sharing one sandbox.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<TerminalInner>,
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("config", &self.inner.config)
            .field("has_project_source", &self.inner.project_source.is_some())
            .finish_non_exhaustive()
    }
}

impl Terminal {
    pub fn new(config: Arc<Config>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self::build(config, sandbox, None)
    }

    /// Like [`Terminal::new`], but the first session created materializes the
    /// project from `source` and installs its dependencies before use.
    pub fn with_project_source(
        config: Arc<Config>,
        sandbox: Arc<dyn Sandbox>,
        source: Arc<dyn ProjectSource>,
    ) -> Self {
        Self::build(config, sandbox, Some(source))
    }

    fn build(
        config: Arc<Config>,
        sandbox: Arc<dyn Sandbox>,
        project_source: Option<Arc<dyn ProjectSource>>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let audit_log = config
            .command_log_file
            .clone()
            .map(|path| CommandAuditLog::new(path, config.command_log_max_size_bytes));
        let sessions = SessionManager::new(config.banner.clone(), config.workdir.clone());
        Self {
            inner: Arc::new(TerminalInner {
                config,
                sandbox,
                sessions: TokioMutex::new(sessions),
                events,
                project_source,
                bootstrap_claimed: AtomicBool::new(false),
                audit_log,
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.inner.events.subscribe()
    }

    #[instrument(skip(self))]
    pub async fn create_session(&self) -> SessionId {
        let mut sessions = self.inner.sessions.lock().await;
        let id = sessions.create_session();

        let bootstrap_source = match &self.inner.project_source {
            Some(source) if !self.inner.bootstrap_claimed.swap(true, Ordering::SeqCst) => {
                Some(Arc::clone(source))
            }
            _ => None,
        };
        if let (Some(source), Ok(session)) = (bootstrap_source, sessions.get_mut(id)) {
            self.start_bootstrap(session, source);
        }
        info!(session_id = %id, "Terminal session opened");
        id
    }

    /// Closes a session. With a dev server still attached this fails with
    /// [`AppError::SessionInUse`] unless `confirm_stop` is set, in which case
    /// the server is stopped first.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn close_session(&self, id: SessionId, confirm_stop: bool) -> Result<(), AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        let mut removed = sessions.close_session(id, confirm_stop)?;
        if let Some(mut run) = removed.active_run.take() {
            if let Some(cancel) = run.cancel.take() {
                let _ = cancel.send(());
            }
        }
        if let Some(mut server) = removed.dev_server.take() {
            server.request_stop();
            self.emit(TerminalEvent::DevServerStopped { session_id: id });
        }
        info!(active = ?sessions.active(), "Terminal session closed");
        Ok(())
    }

    pub async fn active_session(&self) -> Option<SessionId> {
        self.inner.sessions.lock().await.active()
    }

    pub async fn set_active_session(&self, id: SessionId) -> Result<(), AppError> {
        self.inner.sessions.lock().await.set_active(id)
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().await.ids()
    }

    pub async fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot, AppError> {
        Ok(self.inner.sessions.lock().await.get(id)?.snapshot())
    }

    pub async fn output_lines(&self, id: SessionId) -> Result<Vec<OutputLine>, AppError> {
        Ok(self.inner.sessions.lock().await.get(id)?.output_lines().to_vec())
    }

    pub async fn is_running(&self, id: SessionId) -> Result<bool, AppError> {
        Ok(self.inner.sessions.lock().await.get(id)?.is_running())
    }

    pub async fn dev_server_url(&self, id: SessionId) -> Result<Option<String>, AppError> {
        Ok(self
            .inner
            .sessions
            .lock()
            .await
            .get(id)?
            .dev_server_url()
            .map(str::to_string))
    }

    pub async fn clear(&self, id: SessionId) -> Result<(), AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        sessions.clear(id)?;
        self.emit(TerminalEvent::Cleared { session_id: id });
        Ok(())
    }

    /// Appends a host-provided line, e.g. a notice from the surrounding UI.
    pub async fn append_line(&self, id: SessionId, line: OutputLine) -> Result<(), AppError> {
        let mut sessions = self.inner.sessions.lock().await;
        self.push_line(sessions.get_mut(id)?, line);
        Ok(())
    }

    /// Cancels every in-flight command and stops every dev server.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        for session in sessions.sessions_mut() {
            let id = session.id();
            if let Some(mut run) = session.active_run.take() {
                if let Some(cancel) = run.cancel.take() {
                    let _ = cancel.send(());
                }
            }
            session.bootstrapping = false;
            session.queued.clear();
            session.set_running(false);
            if let Some(mut server) = session.dev_server.take() {
                server.request_stop();
                self.emit(TerminalEvent::DevServerStopped { session_id: id });
            }
        }
        debug!("Terminal shut down");
    }

    fn emit(&self, event: TerminalEvent) {
        // No subscribers is fine; hosts may poll snapshots instead.
        let _ = self.inner.events.send(event);
    }

    fn push_line(&self, session: &mut TerminalSession, line: OutputLine) {
        let session_id = session.id();
        session.push_line(line.clone());
        self.emit(TerminalEvent::Output { session_id, line });
    }

    fn set_running(&self, session: &mut TerminalSession, running: bool) {
        if session.is_running() != running {
            session.set_running(running);
            self.emit(TerminalEvent::RunningChanged {
                session_id: session.id(),
                running,
            });
        }
    }

    fn next_run_id(&self) -> u64 {
        self.inner.next_run_id.fetch_add(1, Ordering::Relaxed)
    }
}
