//! The execution environment commands run in.
//!
//! The terminal never talks to an OS process directly. It goes through a
//! [`Sandbox`] handle that the host constructs and passes in, so a browser
//! runtime, a local directory or a scripted fake can sit behind the same seam.

pub mod local;
pub mod memory;

pub use local::LocalSandbox;
pub use memory::{MemorySandbox, ScriptedCommand};

use crate::error::AppError;
use async_trait::async_trait;
use std::time::Duration;

/// Something a running process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Raw bytes from stdout or stderr, in arrival order.
    Output(Vec<u8>),
    /// The sandbox observed the process binding a port.
    PortReady { port: u16, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// The line as the user typed it.
    pub command_line: String,
    pub program: String,
    pub args: Vec<String>,
    /// Logical working directory inside the sandbox.
    pub cwd: String,
}

impl SpawnRequest {
    pub fn from_command_line(command_line: &str, cwd: &str) -> Result<Self, AppError> {
        let mut words = split_command_line(command_line)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| AppError::ProcessSpawn("Empty command".to_string()))?;
        Ok(Self {
            command_line: command_line.trim().to_string(),
            program,
            args: words.collect(),
            cwd: cwd.to_string(),
        })
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Resolves once the sandbox has finished booting.
    async fn wait_until_ready(&self) {
        while !self.is_ready() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SandboxProcess>, AppError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), AppError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), AppError>;
}

#[async_trait]
pub trait SandboxProcess: Send {
    /// Next event, or `None` once the output stream has ended. A process that
    /// exits while something it started still holds its output open counts as
    /// ended.
    ///
    /// Must be cancel safe: the bridge races it against timers and stop
    /// requests, and a dropped call must not lose output.
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, AppError>;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&mut self) -> Result<i32, AppError>;

    /// Kills the process along with anything it started.
    async fn kill(&mut self) -> Result<(), AppError>;
}

/// Splits a command line into words, honouring single quotes, double quotes
/// and backslash escapes.
pub fn split_command_line(line: &str) -> Result<Vec<String>, AppError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                    in_word = true;
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(AppError::ProcessSpawn(format!("Unterminated {} quote", q)));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
