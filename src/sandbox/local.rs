use crate::config::Config;
use crate::error::AppError;
use crate::sandbox::{ProcessEvent, Sandbox, SandboxProcess, SpawnRequest};
use crate::utils::path_utils::{prepare_root, sandbox_host_path};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// How long output is still collected after the process has exited. Anything a
/// backgrounded child prints later is not part of the command.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

const KILL_TIMEOUT: Duration = Duration::from_millis(500);

/// Sandbox backed by host processes running under a dedicated root directory.
///
/// Logical paths such as `/home/project/src` map beneath the root. Commands run
/// through the configured shell with `-c`, or directly when no shell is set.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    config: Arc<Config>,
}

impl LocalSandbox {
    pub fn open(config: Arc<Config>) -> Result<Self, AppError> {
        let root = prepare_root(&config.sandbox_root)?;
        let sandbox = Self { root, config };
        std::fs::create_dir_all(sandbox.host_path(&sandbox.config.workdir)?)?;
        info!(root = %sandbox.root.display(), workdir = %sandbox.config.workdir, "Local sandbox ready");
        Ok(sandbox)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, logical: &str) -> Result<PathBuf, AppError> {
        sandbox_host_path(&self.root, &self.config.workdir, logical)
    }

    fn build_command(&self, request: &SpawnRequest) -> TokioCommand {
        match self.config.default_shell.as_deref() {
            Some(shell_path) => {
                let mut cmd = TokioCommand::new(shell_path);
                if shell_path.contains("powershell") {
                    cmd.arg("-Command");
                } else if shell_path.ends_with("cmd.exe") {
                    cmd.arg("/C");
                } else {
                    cmd.arg("-c");
                }
                cmd.arg(&request.command_line);
                cmd
            }
            None => {
                let mut cmd = TokioCommand::new(&request.program);
                cmd.args(&request.args);
                cmd
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn is_ready(&self) -> bool {
        true
    }

    #[instrument(skip(self, request), fields(command = %request.command_line, cwd = %request.cwd))]
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SandboxProcess>, AppError> {
        if self.config.is_command_blocked(&request.command_line) {
            warn!("Command execution blocked");
            return Err(AppError::CommandBlocked(request.command_line));
        }

        let cwd = self.host_path(&request.cwd)?;
        if !cwd.is_dir() {
            return Err(AppError::ProcessSpawn(format!(
                "No such directory: {}",
                request.cwd
            )));
        }

        let mut command_process = self.build_command(&request);
        command_process
            .current_dir(&cwd)
            .env("HOME", self.host_path(&self.config.workdir)?)
            .env("FORCE_COLOR", "0")
            .stdin(StdProcessStdio::null())
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches everything the command started.
        #[cfg(unix)]
        command_process.process_group(0);

        debug!(shell = ?self.config.default_shell, "Spawning command");
        let mut child = command_process.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn command");
            AppError::ProcessSpawn(format!("'{}': {}", request.command_line, e))
        })?;

        let (tx, rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, tx));
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(child, pid, kill_rx, exit_tx));

        Ok(Box::new(LocalProcess {
            pid,
            output: rx,
            exit: exit_rx,
            kill: Some(kill_tx),
            drain_until: None,
        }))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), AppError> {
        let host_path = self.host_path(path)?;
        tokio::fs::write(&host_path, contents).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), AppError> {
        let host_path = self.host_path(path)?;
        if recursive {
            tokio::fs::create_dir_all(&host_path).await?;
        } else {
            tokio::fs::create_dir(&host_path).await?;
        }
        Ok(())
    }
}

/// Copies raw reads into the shared channel until EOF or the receiver goes away.
async fn forward_output<R>(mut reader: R, tx: mpsc::Sender<std::io::Result<Vec<u8>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Owns the child until it exits. A kill request, or the process handle being
/// dropped, kills it together with its process group.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            if let Err(e) = child.start_kill() {
                debug!(pid = ?pid, error = %e, "Process was already gone");
            }
            child.wait().await
        }
    };
    // A signal-terminated process has no code.
    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for process");
            -1
        }
    };
    debug!(pid = ?pid, exit_code = code, "Process exited");
    let _ = exit_tx.send(Some(code));
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = pid, "Killed process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[derive(Debug)]
struct LocalProcess {
    pid: Option<u32>,
    output: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    exit: watch::Receiver<Option<i32>>,
    kill: Option<oneshot::Sender<()>>,
    /// Set once the process has exited: output is read until then and no longer.
    drain_until: Option<Instant>,
}

impl LocalProcess {
    async fn exit_code(&mut self) -> Option<i32> {
        match self.exit.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}

fn output_event(chunk: std::io::Result<Vec<u8>>) -> Result<Option<ProcessEvent>, AppError> {
    match chunk {
        Ok(bytes) => Ok(Some(ProcessEvent::Output(bytes))),
        Err(e) => Err(AppError::StreamRead(e.to_string())),
    }
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, AppError> {
        loop {
            if self.drain_until.is_none() && self.exit.borrow().is_some() {
                self.drain_until = Some(Instant::now() + EXIT_DRAIN);
            }
            if let Some(deadline) = self.drain_until {
                return match timeout_at(deadline, self.output.recv()).await {
                    Ok(Some(chunk)) => output_event(chunk),
                    Ok(None) | Err(_) => Ok(None),
                };
            }
            tokio::select! {
                biased;
                chunk = self.output.recv() => {
                    return match chunk {
                        Some(chunk) => output_event(chunk),
                        None => Ok(None),
                    };
                }
                changed = self.exit.changed() => {
                    if changed.is_err() {
                        self.drain_until = Some(Instant::now() + EXIT_DRAIN);
                    }
                }
            }
        }
    }

    async fn wait(&mut self) -> Result<i32, AppError> {
        self.exit_code()
            .await
            .ok_or_else(|| AppError::StreamRead("Process supervisor stopped without an exit code".to_string()))
    }

    async fn kill(&mut self) -> Result<(), AppError> {
        // Children outlive the shell that started them, so the group goes even
        // after the shell has exited.
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        if let Some(kill) = self.kill.take() {
            if kill.send(()).is_ok() {
                info!(pid = ?self.pid, "Termination signal sent to process");
            }
        }
        if timeout(KILL_TIMEOUT, self.exit_code()).await.is_err() {
            warn!(pid = ?self.pid, "Process did not exit after kill");
        }
        Ok(())
    }
}
