use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Append-only record of commands forwarded to the sandbox, one JSON object per line.
#[derive(Debug)]
pub struct CommandAuditLog {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    session_id: &'a str,
    cwd: &'a str,
    command: &'a str,
}

/// Commands longer than this are cut before logging.
const MAX_LOGGED_COMMAND_LEN: usize = 1024;

impl CommandAuditLog {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create command log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Never fails the caller; write errors are only traced.
    pub async fn log_command(&self, session_id: &str, cwd: &str, command: &str) {
        if let Err(e) = self.try_log_command(session_id, cwd, command).await {
            error!(session_id = %session_id, error = %e, "Failed to write command audit log");
        }
    }

    async fn try_log_command(&self, session_id: &str, cwd: &str, command: &str) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let command = match command.char_indices().nth(MAX_LOGGED_COMMAND_LEN) {
            Some((cut, _)) => &command[..cut],
            None => command,
        };
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id,
            cwd,
            command,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
