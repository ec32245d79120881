// Licensed under the Apache-2.0 license

mod common;

use anyhow::{bail, Context};
use common::SimTree;
use console_harness::{ConsoleError, Session, SkipTest, TestMarkers, TestOutcome};

#[test]
fn test_markers_gate_tests() {
    let tree = SimTree::new();
    let mut session = Session::new(tree.config()).unwrap();

    let outcome = session.run_test(
        "test_md",
        &TestMarkers::default()
            .boardspec("sandbox")
            .buildconfigspec("cmd_memory"),
        |console| {
            console.run_command("md 0 4")?;
            Ok(())
        },
    );
    assert_eq!(outcome, TestOutcome::Passed);

    let outcome = session.run_test(
        "test_needs_usb",
        &TestMarkers::default().buildconfigspec("cmd_usb"),
        |_| bail!("gated tests do not run"),
    );
    assert!(matches!(outcome, TestOutcome::Skipped(_)));

    let outcome = session.run_test(
        "test_not_sandbox",
        &TestMarkers::default().boardspec("!sandbox"),
        |_| bail!("gated tests do not run"),
    );
    assert!(matches!(outcome, TestOutcome::Skipped(_)));

    let outcome = session.run_test(
        "test_without_bdi",
        &TestMarkers::default().notbuildconfigspec("cmd_bdi"),
        |_| bail!("gated tests do not run"),
    );
    assert!(matches!(outcome, TestOutcome::Skipped(_)));

    let stats = session.finish().unwrap();
    assert_eq!(stats.passed, ["test_md"]);
    assert_eq!(stats.skipped.len(), 3);
    assert_eq!(stats.exit_code(), 0);
}

#[test]
fn test_failure_restarts_dut() {
    let tree = SimTree::new();
    let mut session = Session::new(tree.config()).unwrap();
    let markers = TestMarkers::default();

    let mut first_pid = 0;
    let outcome = session.run_test("test_unknown", &markers, |console| {
        first_pid = console.pid().context("no DUT")?;
        console.run_command("no_such_command")?;
        Ok(())
    });
    match outcome {
        TestOutcome::Failed(reason) => assert!(reason.contains("unknown_command"), "{reason}"),
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert!(session.connection_ok());

    let mut second_pid = 0;
    let outcome = session.run_test("test_next", &markers, |console| {
        second_pid = console.pid().context("no DUT")?;
        let output = console.run_command("echo fresh")?;
        if output != "fresh" {
            bail!("unexpected output {output:?}");
        }
        Ok(())
    });
    assert_eq!(outcome, TestOutcome::Passed);
    assert_ne!(first_pid, second_pid);

    let outcome = session.run_test("test_skip_inside", &markers, |_| {
        Err(SkipTest("host has no network".into()).into())
    });
    assert_eq!(outcome, TestOutcome::Skipped("host has no network".into()));

    let stats = session.finish().unwrap();
    assert_eq!(stats.exit_code(), 1);
    let html = tree.log_html();
    assert!(html.contains("FAILED: test_unknown"));
    assert!(html.contains("PASSED: test_next"));
    assert!(html.contains("SKIPPED: test_skip_inside (host has no network)"));
}

#[test]
fn test_command_left_in_flight() {
    let tree = SimTree::new();
    let mut session = Session::new(tree.config()).unwrap();
    let markers = TestMarkers::default();

    let outcome = session.run_test("test_interrupt", &markers, |console| {
        console.ctrlc()?;
        Ok(())
    });
    assert_eq!(outcome, TestOutcome::Passed);

    let mut first_pid = 0;
    let outcome = session.run_test("test_after_interrupt", &markers, |console| {
        first_pid = console.pid().context("no DUT")?;
        let output = console.run_command("echo hi")?;
        if output != "hi" {
            bail!("unexpected output {output:?}");
        }
        Ok(())
    });
    assert_eq!(outcome, TestOutcome::Passed);

    let outcome = session.run_test("test_background", &markers, |console| {
        console.send("sleep 30\n")?;
        Ok(())
    });
    assert_eq!(outcome, TestOutcome::Passed);

    // The sleep never returns in time, so the DUT is restarted.
    let mut second_pid = 0;
    let outcome = session.run_test("test_after_background", &markers, |console| {
        second_pid = console.pid().context("no DUT")?;
        console.run_command("echo fresh")?;
        Ok(())
    });
    assert_eq!(outcome, TestOutcome::Passed);
    assert_ne!(first_pid, second_pid);
    assert!(session.connection_ok());

    let stats = session.finish().unwrap();
    assert!(stats.failed.is_empty(), "{:?}", stats.failed);
    let html = tree.log_html();
    assert!(html.contains("<span class=\"tx\">%03</span>"));
    assert!(html.contains("<span class=\"tx\">echo hi\n</span>"));
    assert!(html.contains("<span class=\"tx\">sleep 30\n</span>"));
}

#[test]
fn test_state_error_halts_session() {
    let tree = SimTree::new();
    let mut session = Session::new(tree.config()).unwrap();
    let markers = TestMarkers::default();
    let outcome = session.run_test("test_bad_wait", &markers, |console| {
        // Nothing is in flight at the prompt.
        console.wait_for_prompt()?;
        Ok(())
    });
    assert!(matches!(outcome, TestOutcome::Failed(_)));
    assert!(!session.connection_ok());
    assert!(matches!(
        session.run_test("test_after", &markers, |_| Ok(())),
        TestOutcome::Failed(_)
    ));
    assert_eq!(session.finish().unwrap().failed.len(), 2);
}

#[test]
fn test_boot_failure_retried_once() {
    let tree = SimTree::new();
    let mut config = tree.config();
    config.extra_flags = vec!["--boot-exception".into()];
    let mut session = Session::new(config).unwrap();
    let outcome = session.run_test("test_first", &TestMarkers::default(), |_| Ok(()));
    assert!(matches!(outcome, TestOutcome::Failed(_)));
    assert!(!session.connection_ok());
    session.log().flush().unwrap();
    let html = tree.log_html();
    assert_eq!(html.matches("Boot failed").count(), 2);
    session.finish().unwrap();
}

#[test]
fn test_halting_error_kinds() {
    assert!(ConsoleError::Protocol("x".into()).halts_session());
    assert!(ConsoleError::SpawnFailure("x".into()).halts_session());
    assert!(!ConsoleError::Eof("status 1".into()).halts_session());
}
