use sandbox_terminal::{
    AppError, Config, LineKind, MemorySandbox, OutputLine, ProjectFile, ScriptedCommand, SessionId,
    SessionSnapshot, StaticProjectSource, SubmitOutcome, Terminal, TerminalEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

fn terminal(sandbox: &Arc<MemorySandbox>) -> Terminal {
    Terminal::new(Arc::new(Config::default()), sandbox.clone())
}

async fn wait_for(
    terminal: &Terminal,
    id: SessionId,
    what: &str,
    done: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..2000 {
        let snapshot = terminal.snapshot(id).await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_idle(terminal: &Terminal, id: SessionId) -> SessionSnapshot {
    wait_for(terminal, id, "the session to go idle", |s| !s.is_running).await
}

/// Lines after the banner.
fn texts(snapshot: &SessionSnapshot) -> Vec<&str> {
    snapshot.output_lines[1..].iter().map(|l| l.text.as_str()).collect()
}

fn has_line(snapshot: &SessionSnapshot, text: &str) -> bool {
    snapshot.output_lines.iter().any(|l| l.text == text)
}

fn drain(events: &mut broadcast::Receiver<TerminalEvent>) -> Vec<TerminalEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn count_started(events: &[TerminalEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TerminalEvent::DevServerStarted { .. }))
        .count()
}

fn count_stopped(events: &[TerminalEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TerminalEvent::DevServerStopped { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn listing_files_appends_echo_and_output_lines() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script("ls", ScriptedCommand::new().output("README.md\nsrc\npackage.json\n"));
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    assert_eq!(terminal.submit(id, "ls").await.unwrap(), SubmitOutcome::Started);
    assert!(terminal.is_running(id).await.unwrap());

    let snapshot = wait_idle(&terminal, id).await;
    assert_eq!(texts(&snapshot), vec!["$ ls", "README.md", "src", "package.json"]);
    assert_eq!(snapshot.output_lines[1].kind, LineKind::Input);
    assert_eq!(snapshot.output_lines[2].kind, LineKind::Output);
    assert_eq!(snapshot.command_history, vec!["ls"]);
    assert_eq!(sandbox.spawn_requests()[0].cwd, "/home/project");
}

#[tokio::test(start_paused = true)]
async fn chunks_are_joined_in_arrival_order() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run build",
        ScriptedCommand::new().output("ab").output("cd\n").output("ef"),
    );
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    terminal.submit(id, "npm run build").await.unwrap();
    let snapshot = wait_idle(&terminal, id).await;
    assert_eq!(texts(&snapshot), vec!["$ npm run build", "abcd", "ef"]);
}

#[tokio::test(start_paused = true)]
async fn partial_line_is_flushed_after_idle_timeout() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm install",
        ScriptedCommand::new()
            .output("\x1b[1mResolving\x1b[0m")
            .delay(Duration::from_millis(500))
            .output(" done\n"),
    );
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    terminal.submit(id, "npm install").await.unwrap();
    sleep(Duration::from_millis(150)).await;
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert!(snapshot.is_running);
    assert_eq!(texts(&snapshot), vec!["$ npm install", "Resolving"]);

    let snapshot = wait_idle(&terminal, id).await;
    assert_eq!(texts(&snapshot), vec!["$ npm install", "Resolving", " done"]);
}

#[tokio::test(start_paused = true)]
async fn nonzero_exit_is_reported_as_info() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script("npm run lint", ScriptedCommand::new().output("2 problems\n").exit(2));
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    terminal.submit(id, "npm run lint").await.unwrap();
    let snapshot = wait_idle(&terminal, id).await;
    let last = snapshot.output_lines.last().unwrap();
    assert_eq!(last, &OutputLine::info("Process exited with code 2"));

    terminal.submit(id, "frobnicate --now").await.unwrap();
    let snapshot = wait_idle(&terminal, id).await;
    assert!(has_line(&snapshot, "sh: frobnicate: command not found"));
    assert!(has_line(&snapshot, "Process exited with code 127"));
}

#[tokio::test(start_paused = true)]
async fn dev_server_lifecycle_raises_each_event_once() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run dev",
        ScriptedCommand::new()
            .output("\x1b[32m  VITE v5.2.0  ready in 312 ms\x1b[39m\n")
            .delay(Duration::from_millis(200))
            .output("  \x1b[32m➜\x1b[39m  Local:   \x1b[36mhttp://localhost:\x1b[1m3000\x1b[22m/\x1b[39m\n")
            .output("  ➜  Network: http://0.0.0.0:3000/\n")
            .runs_until_killed(),
    );
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let id = terminal.create_session().await;

    assert_eq!(terminal.submit(id, "npm run dev").await.unwrap(), SubmitOutcome::Started);
    let snapshot = wait_idle(&terminal, id).await;
    assert_eq!(snapshot.dev_server_url, None);

    let snapshot = wait_for(&terminal, id, "the dev server url", |s| s.dev_server_url.is_some()).await;
    assert_eq!(snapshot.dev_server_url.as_deref(), Some("http://localhost:3000"));
    assert!(!snapshot.is_running);

    // The session accepts input while the server runs.
    assert_eq!(terminal.submit(id, "pwd").await.unwrap(), SubmitOutcome::Builtin);

    assert!(terminal.stop_dev_server(id).await.unwrap());
    assert!(!terminal.stop_dev_server(id).await.unwrap());
    assert_eq!(terminal.dev_server_url(id).await.unwrap(), None);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(sandbox.killed(), vec!["npm run dev"]);

    let events = drain(&mut events);
    assert_eq!(count_started(&events), 1);
    assert_eq!(count_stopped(&events), 1);
    assert!(events.contains(&TerminalEvent::DevServerStarted {
        session_id: id,
        url: "http://localhost:3000".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn sandbox_port_notification_announces_the_server() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm start",
        ScriptedCommand::new()
            .output("> app@1.0.0 start\n")
            .port(5173)
            .output("Server listening on port 5173\n")
            .runs_until_killed(),
    );
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let id = terminal.create_session().await;

    terminal.submit(id, "npm start").await.unwrap();
    let snapshot = wait_for(&terminal, id, "the listening line", |s| {
        has_line(s, "Server listening on port 5173")
    })
    .await;
    assert_eq!(snapshot.dev_server_url.as_deref(), Some("http://localhost:5173"));
    assert_eq!(count_started(&drain(&mut events)), 1);
}

#[tokio::test(start_paused = true)]
async fn server_that_exits_on_its_own_reports_and_stops() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run dev",
        ScriptedCommand::new()
            .output("listening on port 8080\n")
            .delay(Duration::from_millis(100))
            .output("Error: EADDRINUSE\n")
            .exit(1),
    );
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let id = terminal.create_session().await;

    terminal.submit(id, "npm run dev").await.unwrap();
    let snapshot = wait_for(&terminal, id, "the server exit", |s| {
        has_line(s, "Dev server exited with code 1")
    })
    .await;
    assert_eq!(snapshot.dev_server_url, None);

    let events = drain(&mut events);
    assert_eq!(count_started(&events), 1);
    assert_eq!(count_stopped(&events), 1);
    assert!(!terminal.stop_dev_server(id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn starting_a_second_server_replaces_the_first() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run dev",
        ScriptedCommand::new()
            .output("Local: http://localhost:3000/\n")
            .runs_until_killed(),
    );
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let id = terminal.create_session().await;

    terminal.submit(id, "npm run dev").await.unwrap();
    wait_for(&terminal, id, "the first server", |s| s.dev_server_url.is_some()).await;
    terminal.submit(id, "npm run dev -- --port 3000").await.unwrap();
    wait_for(&terminal, id, "the replacement", |s| {
        has_line(s, "Stopped previous dev server.") && s.dev_server_url.is_some()
    })
    .await;
    sleep(Duration::from_millis(50)).await;

    let events = drain(&mut events);
    assert_eq!(count_started(&events), 2);
    assert_eq!(count_stopped(&events), 1);
    assert_eq!(sandbox.killed(), vec!["npm run dev"]);
}

#[tokio::test(start_paused = true)]
async fn interrupt_drops_later_output() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm test",
        ScriptedCommand::new()
            .output("starting\n")
            .delay(Duration::from_secs(1))
            .output("late output\n"),
    );
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    terminal.submit(id, "npm test").await.unwrap();
    wait_for(&terminal, id, "first output", |s| has_line(s, "starting")).await;

    assert!(terminal.interrupt(id).await.unwrap());
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert!(!snapshot.is_running);
    assert_eq!(snapshot.output_lines.last().unwrap().kind, LineKind::Warning);
    assert_eq!(snapshot.output_lines.last().unwrap().text, "^C");

    sleep(Duration::from_secs(3)).await;
    let later = terminal.snapshot(id).await.unwrap();
    assert_eq!(later.output_lines, snapshot.output_lines);
    assert_eq!(sandbox.killed(), vec!["npm test"]);
    assert!(!terminal.interrupt(id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn interrupt_stops_an_attached_dev_server_once() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run dev",
        ScriptedCommand::new()
            .output("ready on http://localhost:3000\n")
            .runs_until_killed(),
    );
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let id = terminal.create_session().await;

    terminal.submit(id, "npm run dev").await.unwrap();
    wait_for(&terminal, id, "the server", |s| s.dev_server_url.is_some()).await;
    assert!(terminal.interrupt(id).await.unwrap());
    assert!(!terminal.stop_dev_server(id).await.unwrap());

    let events = drain(&mut events);
    assert_eq!(count_stopped(&events), 1);
    assert_eq!(terminal.dev_server_url(id).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn only_one_command_runs_per_session() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run build",
        ScriptedCommand::new()
            .delay(Duration::from_secs(1))
            .output("built\n"),
    );
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    assert_eq!(terminal.submit(id, "npm run build").await.unwrap(), SubmitOutcome::Started);
    assert_eq!(terminal.submit(id, "ls").await.unwrap(), SubmitOutcome::Busy);
    assert_eq!(terminal.submit(id, "   ").await.unwrap(), SubmitOutcome::Ignored);

    let snapshot = wait_idle(&terminal, id).await;
    assert_eq!(texts(&snapshot), vec!["$ npm run build", "built"]);
    assert_eq!(snapshot.command_history, vec!["npm run build"]);
    assert_eq!(sandbox.spawned(), vec!["npm run build"]);
}

#[tokio::test(start_paused = true)]
async fn sessions_are_isolated() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox
        .script("npm run build", ScriptedCommand::new().delay(Duration::from_secs(2)).output("built\n"))
        .script("ls", ScriptedCommand::new().output("src\n"));
    let terminal = terminal(&sandbox);
    let a = terminal.create_session().await;
    let b = terminal.create_session().await;

    terminal.submit(a, "npm run build").await.unwrap();
    terminal.submit(b, "cd src").await.unwrap();
    assert_eq!(terminal.submit(b, "ls").await.unwrap(), SubmitOutcome::Started);

    let b_snapshot = wait_idle(&terminal, b).await;
    assert_eq!(texts(&b_snapshot), vec!["$ cd src", "$ ls", "src"]);
    assert!(terminal.is_running(a).await.unwrap());

    let a_snapshot = wait_idle(&terminal, a).await;
    assert_eq!(texts(&a_snapshot), vec!["$ npm run build", "built"]);
    assert_eq!(a_snapshot.current_directory, "/home/project");
    assert_eq!(b_snapshot.current_directory, "/home/project/src");
    let ls = sandbox
        .spawn_requests()
        .into_iter()
        .find(|r| r.command_line == "ls")
        .unwrap();
    assert_eq!(ls.cwd, "/home/project/src");

    terminal.clear(a).await.unwrap();
    assert!(terminal.output_lines(a).await.unwrap().is_empty());
    assert_eq!(terminal.output_lines(b).await.unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn commands_fail_cleanly_before_the_sandbox_is_ready() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.set_ready(false);
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    assert_eq!(terminal.submit(id, "ls").await.unwrap(), SubmitOutcome::Failed);
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert!(!snapshot.is_running);
    let last = snapshot.output_lines.last().unwrap();
    assert_eq!(last.kind, LineKind::Error);
    assert!(last.text.starts_with("Sandbox is not ready yet"));
    assert!(sandbox.spawned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn spawn_and_stream_failures_become_error_lines() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox
        .script("deno run main.ts", ScriptedCommand::rejects_spawn("deno: not installed"))
        .script(
            "cat big.log",
            ScriptedCommand::new().output("first\npart").read_error("pipe closed"),
        );
    let terminal = terminal(&sandbox);
    let id = terminal.create_session().await;

    terminal.submit(id, "deno run main.ts").await.unwrap();
    let snapshot = wait_idle(&terminal, id).await;
    assert_eq!(
        snapshot.output_lines.last().unwrap(),
        &OutputLine::error("Failed to spawn process: deno: not installed")
    );

    terminal.submit(id, "cat big.log").await.unwrap();
    let snapshot = wait_idle(&terminal, id).await;
    let tail: Vec<&str> = texts(&snapshot).into_iter().rev().take(3).collect();
    assert_eq!(tail, vec!["Output stream failed: pipe closed", "part", "first"]);

    terminal.submit(id, "echo 'unbalanced").await.unwrap();
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert_eq!(
        snapshot.output_lines.last().unwrap(),
        &OutputLine::error("Failed to spawn process: Unterminated ' quote")
    );
    assert!(!snapshot.is_running);
}

#[tokio::test(start_paused = true)]
async fn builtins_run_without_the_sandbox() {
    let sandbox = Arc::new(MemorySandbox::default());
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let id = terminal.create_session().await;

    terminal.submit(id, "cd app/../web").await.unwrap();
    terminal.submit(id, "pwd").await.unwrap();
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert_eq!(texts(&snapshot), vec!["$ cd app/../web", "$ pwd", "/home/project/web"]);

    terminal.submit(id, "cd").await.unwrap();
    assert_eq!(terminal.snapshot(id).await.unwrap().current_directory, "/home/project");

    terminal.submit(id, "help").await.unwrap();
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert!(snapshot.output_lines.iter().any(|l| l.kind == LineKind::Info && l.text.contains("pwd")));

    assert_eq!(terminal.submit(id, "clear").await.unwrap(), SubmitOutcome::Builtin);
    assert!(terminal.output_lines(id).await.unwrap().is_empty());

    terminal.submit(id, "exit").await.unwrap();
    let events = drain(&mut events);
    assert!(events.contains(&TerminalEvent::Cleared { session_id: id }));
    assert!(events.contains(&TerminalEvent::CloseRequested { session_id: id }));
    assert!(sandbox.spawned().is_empty());

    assert_eq!(terminal.history_up(id).await.unwrap(), "exit");
    assert_eq!(terminal.history_up(id).await.unwrap(), "clear");
    assert_eq!(terminal.history_down(id).await.unwrap(), "exit");
    assert_eq!(terminal.history_down(id).await.unwrap(), "");
}

#[tokio::test(start_paused = true)]
async fn closing_a_session_with_a_dev_server_needs_confirmation() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm run dev",
        ScriptedCommand::new()
            .output("Local: http://localhost:3000/\n")
            .runs_until_killed(),
    );
    let terminal = terminal(&sandbox);
    let mut events = terminal.subscribe();
    let a = terminal.create_session().await;
    let b = terminal.create_session().await;

    terminal.submit(b, "npm run dev").await.unwrap();
    wait_for(&terminal, b, "the server", |s| s.dev_server_url.is_some()).await;

    assert!(matches!(
        terminal.close_session(b, false).await,
        Err(AppError::SessionInUse(_))
    ));
    assert_eq!(terminal.session_ids().await, vec![a, b]);

    terminal.close_session(b, true).await.unwrap();
    assert_eq!(terminal.session_ids().await, vec![a]);
    assert_eq!(terminal.active_session().await, Some(a));
    assert!(matches!(terminal.snapshot(b).await, Err(AppError::SessionNotFound(_))));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(sandbox.killed(), vec!["npm run dev"]);
    assert_eq!(count_stopped(&drain(&mut events)), 1);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_writes_files_installs_and_runs_queued_commands() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox
        .script(
            "npm install",
            ScriptedCommand::new()
                .delay(Duration::from_millis(300))
                .output("added 3 packages in 1s\n"),
        )
        .script("ls", ScriptedCommand::new().output("node_modules\npackage.json\nsrc\n"))
        .fail_writes_to("src/locked.js");
    let source = StaticProjectSource::new(vec![
        ProjectFile::new("package.json", r#"{"name":"demo"}"#),
        ProjectFile::new("src/index.js", "console.log('hi')"),
        ProjectFile::new("src/locked.js", "secret"),
        ProjectFile::new("src/nested/deep/util.js", "export {}"),
    ]);
    let terminal = Terminal::with_project_source(
        Arc::new(Config::default()),
        sandbox.clone(),
        Arc::new(source),
    );
    let id = terminal.create_session().await;

    let snapshot = terminal.snapshot(id).await.unwrap();
    assert!(snapshot.is_running);
    assert!(snapshot.is_bootstrapping);
    assert_eq!(terminal.submit(id, "ls").await.unwrap(), SubmitOutcome::Queued);

    let snapshot = wait_for(&terminal, id, "bootstrap and queued ls", |s| {
        !s.is_running && !s.is_bootstrapping && has_line(s, "node_modules")
    })
    .await;

    assert_eq!(sandbox.file("package.json").unwrap(), br#"{"name":"demo"}"#.to_vec());
    assert!(sandbox.file("/home/project/src/index.js").is_some());
    assert!(sandbox.file("src/nested/deep/util.js").is_some());
    assert!(sandbox.file("src/locked.js").is_none());
    assert_eq!(sandbox.spawned(), vec!["npm install", "ls"]);

    let warning = snapshot
        .output_lines
        .iter()
        .find(|l| l.kind == LineKind::Warning)
        .unwrap();
    assert!(warning.text.starts_with("Failed to write /home/project/src/locked.js"));
    assert!(has_line(&snapshot, "Wrote 3 of 4 project files."));
    assert!(has_line(&snapshot, "added 3 packages in 1s"));

    let finished = snapshot
        .output_lines
        .iter()
        .position(|l| l.text == "Project setup finished.")
        .unwrap();
    let ls_echo = snapshot.output_lines.iter().rposition(|l| l.text == "$ ls").unwrap();
    assert!(finished < ls_echo);

    // Only the first session bootstraps.
    let second = terminal.create_session().await;
    assert!(!terminal.is_running(second).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn bootstrap_without_manifest_waits_for_the_sandbox_and_skips_install() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.set_ready(false);
    let source = StaticProjectSource::new(vec![ProjectFile::new("index.html", "<h1>hi</h1>")]);
    let terminal = Terminal::with_project_source(
        Arc::new(Config::default()),
        sandbox.clone(),
        Arc::new(source),
    );
    let id = terminal.create_session().await;

    sleep(Duration::from_secs(1)).await;
    assert!(sandbox.files().is_empty());
    assert!(terminal.is_running(id).await.unwrap());

    sandbox.set_ready(true);
    let snapshot = wait_idle(&terminal, id).await;
    assert!(sandbox.file("index.html").is_some());
    assert!(sandbox.spawned().is_empty());
    assert!(has_line(&snapshot, "Project setup finished."));
}

#[tokio::test(start_paused = true)]
async fn interrupting_bootstrap_drops_the_queue() {
    let sandbox = Arc::new(MemorySandbox::default());
    sandbox.script(
        "npm install",
        ScriptedCommand::new().delay(Duration::from_secs(10)).output("added\n"),
    );
    let source = StaticProjectSource::new(vec![ProjectFile::new("package.json", "{}")]);
    let terminal = Terminal::with_project_source(
        Arc::new(Config::default()),
        sandbox.clone(),
        Arc::new(source),
    );
    let id = terminal.create_session().await;
    terminal.submit(id, "npm test").await.unwrap();

    wait_for(&terminal, id, "the install step", |s| has_line(s, "$ npm install")).await;
    assert!(terminal.interrupt(id).await.unwrap());

    sleep(Duration::from_secs(15)).await;
    let snapshot = terminal.snapshot(id).await.unwrap();
    assert!(!snapshot.is_running);
    assert!(!snapshot.is_bootstrapping);
    assert!(!has_line(&snapshot, "added"));
    assert_eq!(sandbox.spawned(), vec!["npm install"]);
}
