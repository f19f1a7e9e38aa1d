//! Line-oriented host for a [`Terminal`], used by the binary.
//!
//! Plain lines are submitted to the active session. Lines starting with `:`
//! drive the host side: tabs, interrupt, history and the dev server.

use crate::error::AppError;
use crate::terminal::{LineKind, OutputLine, SessionId, SubmitOutcome, Terminal, TerminalEvent};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

const META_HELP: &str = "\
:new          open a new terminal
:list         list terminals
:switch <n>   switch to terminal n
:close[!]     close this terminal (! also stops its dev server)
:int          interrupt the running command
:stop         stop this terminal's dev server
:up, :down    recall history; an empty line runs the recalled command
:quit         stop everything and exit";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            quit: false,
        }
    }

    fn quit() -> Self {
        Self {
            lines: Vec::new(),
            quit: true,
        }
    }
}

#[derive(Debug)]
pub struct Repl {
    terminal: Terminal,
    active: SessionId,
}

impl Repl {
    /// Opens the first session.
    pub async fn start(terminal: Terminal) -> Self {
        let active = terminal.create_session().await;
        Self { terminal, active }
    }

    pub fn active(&self) -> SessionId {
        self.active
    }

    pub async fn handle_line(&mut self, line: &str) -> Result<Reply, AppError> {
        let trimmed = line.trim();
        if let Some(meta) = trimmed.strip_prefix(':') {
            return self.handle_meta(meta).await;
        }
        let input = if trimmed.is_empty() {
            self.terminal.snapshot(self.active).await?.pending_input
        } else {
            line.to_string()
        };
        let outcome = self.terminal.submit(self.active, &input).await?;
        debug!(?outcome, "Submitted input");
        Ok(match outcome {
            SubmitOutcome::Busy => {
                Reply::line("busy: a command is still running (:int to interrupt)")
            }
            _ => Reply::default(),
        })
    }

    async fn handle_meta(&mut self, meta: &str) -> Result<Reply, AppError> {
        let (command, arg) = match meta.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, arg.trim()),
            None => (meta, ""),
        };
        match command {
            "new" => {
                self.active = self.terminal.create_session().await;
                let name = self.terminal.snapshot(self.active).await?.name;
                Ok(Reply::line(format!("opened {}", name)))
            }
            "list" => {
                let mut lines = Vec::new();
                for (idx, id) in self.terminal.session_ids().await.into_iter().enumerate() {
                    let snapshot = self.terminal.snapshot(id).await?;
                    let marker = if id == self.active { '*' } else { ' ' };
                    let mut line = format!("{}{} {} {}", marker, idx + 1, snapshot.name, snapshot.current_directory);
                    if snapshot.is_running {
                        line.push_str(" [running]");
                    }
                    if let Some(url) = snapshot.dev_server_url {
                        line.push_str(&format!(" [{}]", url));
                    }
                    lines.push(line);
                }
                Ok(Reply { lines, quit: false })
            }
            "switch" => {
                let ids = self.terminal.session_ids().await;
                let target = arg
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| ids.get(idx).copied());
                match target {
                    Some(id) => {
                        self.terminal.set_active_session(id).await?;
                        self.active = id;
                        let snapshot = self.terminal.snapshot(id).await?;
                        let mut lines = vec![format!("switched to {}", snapshot.name)];
                        lines.extend(snapshot.output_lines.iter().map(render_line));
                        Ok(Reply { lines, quit: false })
                    }
                    None => Ok(Reply::line(format!("no terminal {:?}", arg))),
                }
            }
            "close" | "close!" => self.close_active(command == "close!").await,
            "int" => {
                if self.terminal.interrupt(self.active).await? {
                    Ok(Reply::default())
                } else {
                    Ok(Reply::line("nothing to interrupt"))
                }
            }
            "stop" => {
                if self.terminal.stop_dev_server(self.active).await? {
                    Ok(Reply::default())
                } else {
                    Ok(Reply::line("no dev server running"))
                }
            }
            "up" => Ok(Reply::line(format!("> {}", self.terminal.history_up(self.active).await?))),
            "down" => Ok(Reply::line(format!("> {}", self.terminal.history_down(self.active).await?))),
            "quit" | "q" => Ok(Reply::quit()),
            "help" => Ok(Reply {
                lines: META_HELP.lines().map(str::to_string).collect(),
                quit: false,
            }),
            other => Ok(Reply::line(format!("unknown command :{} (try :help)", other))),
        }
    }

    async fn close_active(&mut self, confirm_stop: bool) -> Result<Reply, AppError> {
        match self.terminal.close_session(self.active, confirm_stop).await {
            Ok(()) => {}
            Err(AppError::SessionInUse(_)) => {
                return Ok(Reply::line(
                    "a dev server is still running here; use :close! to stop it and close",
                ))
            }
            Err(e) => return Err(e),
        }
        match self.terminal.active_session().await {
            Some(next) => {
                self.active = next;
                let name = self.terminal.snapshot(next).await?.name;
                Ok(Reply::line(format!("switched to {}", name)))
            }
            None => Ok(Reply::quit()),
        }
    }

    /// Text for an event worth printing, if it concerns the active session.
    pub fn render_event(&self, event: &TerminalEvent) -> Option<String> {
        match event {
            TerminalEvent::Output { session_id, line } if *session_id == self.active => {
                Some(render_line(line))
            }
            TerminalEvent::Cleared { session_id } if *session_id == self.active => {
                Some("--- cleared ---".to_string())
            }
            TerminalEvent::DevServerStarted { session_id, url } if *session_id == self.active => {
                Some(format!("[preview] {}", url))
            }
            TerminalEvent::DevServerStopped { session_id } if *session_id == self.active => {
                Some("[preview] closed".to_string())
            }
            _ => None,
        }
    }
}

fn render_line(line: &OutputLine) -> String {
    match line.kind {
        LineKind::Warning => format!("warning: {}", line.text),
        LineKind::Error => format!("error: {}", line.text),
        _ => line.text.clone(),
    }
}

/// Runs the REPL over stdin/stdout until `:quit`, end of input, or the last
/// terminal closes. Every process is stopped on the way out.
pub async fn run(terminal: Terminal) -> Result<()> {
    let mut events = terminal.subscribe();
    let mut repl = Repl::start(terminal.clone()).await;
    let mut stdout = tokio::io::stdout();
    // Later lines arrive as events.
    for line in terminal.output_lines(repl.active()).await? {
        if line.kind == LineKind::Banner {
            write_line(&mut stdout, &line.text).await?;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let reply = tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => repl.handle_line(&line).await?,
                None => break,
            },
            event = events.recv() => match event {
                Ok(TerminalEvent::CloseRequested { session_id }) if session_id == repl.active() => {
                    repl.close_active(false).await?
                }
                Ok(event) => match repl.render_event(&event) {
                    Some(text) => Reply::line(text),
                    None => continue,
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        for line in &reply.lines {
            write_line(&mut stdout, line).await?;
        }
        if reply.quit {
            break;
        }
    }

    terminal.shutdown().await;
    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
