// Licensed under the Apache-2.0 license

//! A board reached through flash, console and reset helper programs. The
//! console helper runs the simulated shell.

mod common;

use common::{SimTree, SIM_SHELL};
use console_harness::{ConsoleError, ConsoleState, Session, SessionConfig, Signal};
use std::fs;

fn attached_config(tree: &SimTree) -> SessionConfig {
    let events = tree.path().join("events");
    let mut config = SessionConfig {
        board_type: "sim-board".into(),
        board_identity: "bench1".into(),
        ..tree.config()
    };
    config.helpers.flash = tree.script(
        "flash",
        &format!(
            "echo \"flash $1 $2 $UBOOT_BOARD_IDENTITY\" >> {}",
            events.display()
        ),
    );
    config.helpers.reset = tree.script("reset", &format!("echo reset >> {}", events.display()));
    config.helpers.console = tree.script("console", &format!("exec {SIM_SHELL} --fifo 16"));
    config
}

fn events(tree: &SimTree) -> Vec<String> {
    fs::read_to_string(tree.path().join("events"))
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[test]
fn test_attached_board() {
    let tree = SimTree::new();
    let mut session = Session::new(attached_config(&tree)).unwrap();
    assert_eq!(events(&tree), ["flash sim-board bench1 bench1"]);

    let console = session.console();
    console.ensure_spawned().unwrap();
    assert_eq!(events(&tree), ["flash sim-board bench1 bench1", "reset"]);
    assert_eq!(console.max_fifo_fill(), 16);

    // Longer than the FIFO, so it is sent in chunks.
    let text = "0123456789abcdefghijklmnopqrstuvwxyz";
    assert_eq!(console.run_command(&format!("echo {text}")).unwrap(), text);
    let peak = console.run_command("fifo").unwrap();
    let peak: usize = peak.trim_start_matches("fifo peak ").parse().unwrap();
    assert!(peak <= 16, "peak fill {peak}");

    console.kill(Signal::SIGTERM).unwrap();
    assert!(console.validate_exited().unwrap());
    console.ensure_spawned().unwrap();
    assert_eq!(console.state(), ConsoleState::AtPrompt);
    // Flashed once, reset on every spawn.
    assert_eq!(
        events(&tree),
        ["flash sim-board bench1 bench1", "reset", "reset"]
    );
    session.finish().unwrap();
}

#[test]
fn test_console_helper_needs_terminal() {
    let tree = SimTree::new();
    let mut config = attached_config(&tree);
    config.helpers.console = tree.script(
        "console",
        &format!("[ -t 0 ] && [ -t 1 ] || exit 1\nexec {SIM_SHELL}"),
    );
    let mut session = Session::new(config).unwrap();
    let console = session.console();
    console.ensure_spawned().unwrap();
    assert_eq!(console.run_command("echo on a tty").unwrap(), "on a tty");
    session.finish().unwrap();
}

#[test]
fn test_attach_to_running_system() {
    let tree = SimTree::new();
    let mut config = attached_config(&tree);
    config.helpers.console = tree.script("console", &format!("exec {SIM_SHELL} --running"));
    config.use_running_system = true;
    let mut session = Session::new(config).unwrap();
    let console = session.console();
    console.ensure_spawned().unwrap();
    assert_eq!(console.state(), ConsoleState::AtPrompt);
    assert_eq!(console.version_string(), None);
    assert_eq!(console.run_command("echo attached").unwrap(), "attached");
    session.finish().unwrap();

    let html = tree.log_html();
    assert!(html.contains("Attaching to a running system"));
    assert!(!html.contains("U-Boot Concept"));
}

#[test]
fn test_attached_takes_no_flags() {
    let tree = SimTree::new();
    let mut session = Session::new(attached_config(&tree)).unwrap();
    let console = session.console();
    let res = console.restart_uboot(console_harness::RestartOptions {
        flags: Some(vec!["--upl".into()]),
        ..Default::default()
    });
    assert!(matches!(res, Err(ConsoleError::Protocol(_))));
    session.finish().unwrap();
}

#[test]
fn test_flash_failure() {
    let tree = SimTree::new();
    let mut config = attached_config(&tree);
    config.helpers.flash = tree.script("flash", "echo 'board not found' >&2; exit 1");
    let err = match Session::new(config) {
        Ok(_) => panic!("flashing should fail"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<ConsoleError>(),
        Some(ConsoleError::SpawnFailure(_))
    ));
}

#[test]
fn test_reset_failure() {
    let tree = SimTree::new();
    let mut config = attached_config(&tree);
    config.helpers.reset = tree.script("reset", "exit 2");
    let mut session = Session::new(config).unwrap();
    let outcome = session.run_test("test_any", &Default::default(), |_| Ok(()));
    assert!(matches!(outcome, console_harness::TestOutcome::Failed(_)));
    assert!(!session.connection_ok());
    session.finish().unwrap();
}
