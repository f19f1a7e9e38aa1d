//! Interactive process terminal over a sandboxed execution environment.
//!
//! A [`Terminal`] owns any number of sessions sharing one [`Sandbox`]. Input
//! goes in through [`Terminal::submit`]; output comes back as normalized lines
//! in each session's log and as [`TerminalEvent`]s, including the dev-server
//! started/stopped notifications a host uses to drive a live preview.

pub mod config;
pub mod error;
pub mod repl;
pub mod sandbox;
pub mod terminal;
pub mod utils;

pub use config::Config;
pub use error::AppError;
pub use sandbox::{LocalSandbox, MemorySandbox, ProcessEvent, Sandbox, SandboxProcess, ScriptedCommand, SpawnRequest};
pub use terminal::{
    DirectoryProjectSource, LineKind, OutputLine, ProjectFile, ProjectSource, SessionId,
    SessionSnapshot, StaticProjectSource, SubmitOutcome, Terminal, TerminalEvent,
};
