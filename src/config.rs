use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BLOCKED_COMMANDS: &str =
    "sudo,su,mkfs,fdisk,dd,reboot,shutdown,poweroff,halt,format,mount,umount,passwd,adduser,useradd,usermod,groupadd";

const DEFAULT_SERVER_COMMANDS: &str =
    "npm run dev,npm start,npm run start,npm run serve,yarn dev,yarn start,pnpm dev,pnpm start,npx vite,vite,next dev,npx next dev,npx serve";

pub const DEFAULT_BANNER: &str = "Sandbox terminal ready. Type 'help' for built-in commands.";

#[derive(Debug, Clone)]
pub struct Config {
    pub sandbox_root: PathBuf,
    pub workdir: String,
    pub default_shell: Option<String>,
    pub blocked_commands: Vec<Regex>,
    pub server_commands: Vec<Regex>,
    pub flush_idle: Duration,
    pub bootstrap_manifest: String,
    pub bootstrap_install_command: String,
    pub event_capacity: usize,
    pub banner: String,
    pub command_log_file: Option<PathBuf>,
    pub command_log_max_size_bytes: u64,
    pub project_dir: Option<PathBuf>,
    pub log_level: String,
}

fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

fn parse_log_size_mb(value: &str) -> Result<u64> {
    let mb = value
        .parse::<u64>()
        .context("Invalid COMMAND_LOG_MAX_SIZE_MB")?;
    mb.checked_mul(1024 * 1024)
        .context("COMMAND_LOG_MAX_SIZE_MB is too large")
}

/// Matches a command if it is the first word, possibly preceded by env assignments.
fn compile_blocked(list: &str) -> Result<Vec<Regex>> {
    split_list(list)
        .map(|s| {
            Regex::new(&format!(
                r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
                regex::escape(s)
            ))
            .context(format!("Invalid regex for blocked command: {}", s))
        })
        .collect()
}

/// Server commands match as a whole-word prefix of the trimmed input.
fn compile_server_commands(list: &str) -> Result<Vec<Regex>> {
    split_list(list)
        .map(|s| {
            let words: Vec<String> = s.split_whitespace().map(regex::escape).collect();
            Regex::new(&format!(r"^{}(?:\s.*|$)", words.join(r"\s+")))
                .context(format!("Invalid server command pattern: {}", s))
        })
        .collect()
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_root: std::env::temp_dir().join("sandbox-terminal"),
            workdir: "/home/project".to_string(),
            default_shell: Some("sh".to_string()),
            blocked_commands: compile_blocked(DEFAULT_BLOCKED_COMMANDS).unwrap_or_default(),
            server_commands: compile_server_commands(DEFAULT_SERVER_COMMANDS).unwrap_or_default(),
            flush_idle: Duration::from_millis(100),
            bootstrap_manifest: "package.json".to_string(),
            bootstrap_install_command: "npm install".to_string(),
            event_capacity: 1024,
            banner: DEFAULT_BANNER.to_string(),
            command_log_file: None,
            command_log_max_size_bytes: 10 * 1024 * 1024,
            project_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let sandbox_root = match std::env::var("SANDBOX_ROOT") {
            Ok(root) if !root.is_empty() => expand_tilde(&root)?,
            _ => defaults.sandbox_root,
        };

        let workdir = env_or("TERMINAL_WORKDIR", &defaults.workdir);
        if !workdir.starts_with('/') {
            anyhow::bail!("TERMINAL_WORKDIR must be an absolute path: {}", workdir);
        }

        let default_shell = match std::env::var("DEFAULT_SHELL") {
            Ok(shell) if shell.is_empty() => None,
            Ok(shell) => Some(shell),
            Err(_) => defaults.default_shell,
        };

        let blocked_commands = compile_blocked(&env_or("BLOCKED_COMMANDS", DEFAULT_BLOCKED_COMMANDS))?;
        let server_commands = compile_server_commands(&env_or("SERVER_COMMANDS", DEFAULT_SERVER_COMMANDS))?;

        let flush_idle_ms = env_or("OUTPUT_FLUSH_IDLE_MS", "100")
            .parse::<u64>()
            .context("Invalid OUTPUT_FLUSH_IDLE_MS")?;

        let event_capacity = env_or("TERMINAL_EVENT_CAPACITY", "1024")
            .parse::<usize>()
            .context("Invalid TERMINAL_EVENT_CAPACITY")?;
        if event_capacity == 0 {
            anyhow::bail!("TERMINAL_EVENT_CAPACITY must be greater than zero");
        }

        let command_log_file = std::env::var("COMMAND_LOG_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;
        let command_log_max_size_bytes =
            parse_log_size_mb(&env_or("COMMAND_LOG_MAX_SIZE_MB", "10"))?;

        let project_dir = std::env::var("PROJECT_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;

        Ok(Config {
            sandbox_root,
            workdir,
            default_shell,
            blocked_commands,
            server_commands,
            flush_idle: Duration::from_millis(flush_idle_ms),
            bootstrap_manifest: env_or("BOOTSTRAP_MANIFEST", &defaults.bootstrap_manifest),
            bootstrap_install_command: env_or(
                "BOOTSTRAP_INSTALL_COMMAND",
                &defaults.bootstrap_install_command,
            ),
            event_capacity,
            banner: defaults.banner,
            command_log_file,
            command_log_max_size_bytes,
            project_dir,
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }

    pub fn is_command_blocked(&self, command_line: &str) -> bool {
        let trimmed = command_line.trim_start();
        self.blocked_commands.iter().any(|regex| regex.is_match(trimmed))
    }

    pub fn is_server_command(&self, command_line: &str) -> bool {
        let trimmed = command_line.trim();
        self.server_commands.iter().any(|regex| regex.is_match(trimmed))
    }
}
