//! Materializes a project into the sandbox before the first session is used.

use crate::error::AppError;
use crate::terminal::dispatcher::SubmitOutcome;
use crate::terminal::session::{OutputLine, SessionId, TerminalSession};
use crate::terminal::Terminal;
use crate::utils::path_utils::resolve_logical_path;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Directories never copied from a host project.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "target"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFile {
    /// Path relative to the workdir, `/`-separated. Absolute paths are used as is.
    pub path: String,
    pub contents: Vec<u8>,
}

impl ProjectFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Supplies the files of the project to set up, e.g. from a source-control client.
#[async_trait]
pub trait ProjectSource: Send + Sync {
    async fn files(&self) -> Result<Vec<ProjectFile>, AppError>;
}

/// A fixed, in-memory file set.
#[derive(Debug, Clone, Default)]
pub struct StaticProjectSource {
    files: Vec<ProjectFile>,
}

impl StaticProjectSource {
    pub fn new(files: Vec<ProjectFile>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl ProjectSource for StaticProjectSource {
    async fn files(&self) -> Result<Vec<ProjectFile>, AppError> {
        Ok(self.files.clone())
    }
}

/// Reads a project from a directory on the host.
#[derive(Debug, Clone)]
pub struct DirectoryProjectSource {
    root: PathBuf,
}

impl DirectoryProjectSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProjectSource for DirectoryProjectSource {
    async fn files(&self) -> Result<Vec<ProjectFile>, AppError> {
        let mut files = Vec::new();
        let mut dirs_to_visit = vec![self.root.clone()];

        while let Some(current_dir) = dirs_to_visit.pop() {
            let mut read_dir = fs::read_dir(&current_dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    let name = entry.file_name();
                    if !SKIPPED_DIRS.contains(&name.to_string_lossy().as_ref()) {
                        dirs_to_visit.push(path);
                    }
                } else if file_type.is_file() {
                    let relative = path
                        .strip_prefix(&self.root)
                        .map_err(|_| AppError::InvalidPath(path.display().to_string()))?;
                    let logical = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    let contents = fs::read(&path).await?;
                    files.push(ProjectFile::new(logical, contents));
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(root = %self.root.display(), count = files.len(), "Collected project files");
        Ok(files)
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

impl Terminal {
    /// Marks `session` busy and starts the bootstrap in the background.
    /// Commands submitted meanwhile are queued behind it.
    pub(crate) fn start_bootstrap(&self, session: &mut TerminalSession, source: Arc<dyn ProjectSource>) {
        session.bootstrapping = true;
        self.set_running(session, true);
        self.push_line(session, OutputLine::info("Setting up project..."));
        tokio::spawn(self.clone().bootstrap(session.id(), source));
    }

    #[instrument(skip(self, source), fields(session_id = %id))]
    async fn bootstrap(self, id: SessionId, source: Arc<dyn ProjectSource>) {
        if !self.inner.sandbox.is_ready() {
            if !self.bootstrap_line(id, OutputLine::info("Waiting for the sandbox to boot...")).await {
                return;
            }
            self.inner.sandbox.wait_until_ready().await;
        }

        let files = match source.files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Failed to load project files");
                let line = OutputLine::warning(format!("Could not load project files: {}", e));
                self.abandon_bootstrap(id, line).await;
                return;
            }
        };

        let workdir = self.inner.config.workdir.as_str();
        let manifest_path = resolve_logical_path(workdir, &self.inner.config.bootstrap_manifest, workdir);
        let mut written = 0;
        let mut has_manifest = false;

        for file in &files {
            let path = resolve_logical_path(workdir, &file.path, workdir);
            match self.write_project_file(&path, &file.contents).await {
                Ok(()) => {
                    written += 1;
                    has_manifest |= path == manifest_path;
                    if !self.is_bootstrapping(id).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to write project file");
                    if !self.bootstrap_line(id, OutputLine::warning(e.to_terminal_line())).await {
                        return;
                    }
                }
            }
        }
        info!(written, total = files.len(), "Project files written");

        let mut sessions = self.inner.sessions.lock().await;
        let Ok(session) = sessions.get_mut(id) else {
            return;
        };
        if !session.bootstrapping {
            return;
        }
        self.push_line(
            session,
            OutputLine::info(format!("Wrote {} of {} project files.", written, files.len())),
        );
        if !has_manifest {
            self.finish_bootstrap(session);
            return;
        }

        let install = self.inner.config.bootstrap_install_command.clone();
        self.push_line(
            session,
            OutputLine::info(format!(
                "Found {}, installing dependencies...",
                self.inner.config.bootstrap_manifest
            )),
        );
        self.push_line(session, OutputLine::input(&install));
        // The install run ends the bootstrap from `finish_run`.
        if self.start_command(session, &install) == SubmitOutcome::Failed {
            self.finish_bootstrap(session);
        }
    }

    async fn write_project_file(&self, path: &str, contents: &[u8]) -> Result<(), AppError> {
        let to_bootstrap_error = |e: AppError| AppError::BootstrapFile {
            path: path.to_string(),
            message: e.to_string(),
        };
        if let Some(parent) = parent_of(path) {
            self.inner
                .sandbox
                .mkdir(parent, true)
                .await
                .map_err(to_bootstrap_error)?;
        }
        self.inner
            .sandbox
            .write_file(path, contents)
            .await
            .map_err(to_bootstrap_error)
    }

    async fn is_bootstrapping(&self, id: SessionId) -> bool {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(id).is_ok_and(|session| session.bootstrapping)
    }

    /// Appends a status line unless the bootstrap was interrupted or its
    /// session closed. Returns whether the bootstrap should go on.
    async fn bootstrap_line(&self, id: SessionId, line: OutputLine) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get_mut(id) {
            Ok(session) if session.bootstrapping => {
                self.push_line(session, line);
                true
            }
            _ => false,
        }
    }

    async fn abandon_bootstrap(&self, id: SessionId, line: OutputLine) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Ok(session) = sessions.get_mut(id) {
            if session.bootstrapping {
                self.push_line(session, line);
                self.finish_bootstrap(session);
            }
        }
    }

    /// Makes the session interactive and runs whatever was queued meanwhile.
    pub(crate) fn finish_bootstrap(&self, session: &mut TerminalSession) {
        session.bootstrapping = false;
        self.push_line(session, OutputLine::info("Project setup finished."));
        self.set_running(session, false);
        self.start_next_queued(session);
    }
}
