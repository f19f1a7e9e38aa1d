use anyhow::{Context, Result};
use sandbox_terminal::{Config, DirectoryProjectSource, LocalSandbox, Terminal};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sandbox_terminal={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting sandbox-terminal");
    tracing::debug!("Loaded configuration: {:?}", config);

    if let Some(shell) = &config.default_shell {
        if which::which(shell).is_err() {
            tracing::warn!(shell = %shell, "Shell is not installed or not in PATH. Commands will fail to spawn.");
        }
    }

    let config = Arc::new(config);
    let sandbox = Arc::new(LocalSandbox::open(Arc::clone(&config)).context("Failed to open sandbox root")?);
    tracing::info!(root = %sandbox.root().display(), workdir = %config.workdir, "Sandbox ready");

    let terminal = match &config.project_dir {
        Some(project_dir) => {
            tracing::info!(project_dir = %project_dir.display(), "Bootstrapping project into the sandbox");
            let source = Arc::new(DirectoryProjectSource::new(project_dir.clone()));
            Terminal::with_project_source(Arc::clone(&config), sandbox, source)
        }
        None => Terminal::new(Arc::clone(&config), sandbox),
    };

    sandbox_terminal::repl::run(terminal).await?;

    tracing::info!("Terminal shutdown.");
    Ok(())
}
