//! End-to-end tests against the compiled binary: real children, real
//! pipes, a real log file on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_iolog"))
}

/// Write a sibling conf file pinning `exec` and `logfile`, returning
/// `(conf_path, log_path)`.
fn write_conf(dir: &tempfile::TempDir, exec: &str) -> (PathBuf, PathBuf) {
    let conf_path = dir.path().join("case.conf");
    let log_path = dir.path().join("case.log");
    fs::write(
        &conf_path,
        format!("exec = {}\nlogfile = {}\n", exec, log_path.display()),
    )
    .unwrap();
    (conf_path, log_path)
}

fn run(conf_path: &Path, args: &[&str], stdin: &[u8]) -> (Vec<u8>, Vec<u8>, i32) {
    let mut child = bin()
        .arg("--config")
        .arg(conf_path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn iolog");

    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin)
        .expect("write stdin");

    let output = child.wait_with_output().expect("wait for iolog");
    (
        output.stdout,
        output.stderr,
        output.status.code().unwrap_or(-1),
    )
}

#[test]
fn echo_pipeline_is_transparent() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, log) = write_conf(&dir, "/bin/cat");

    let (stdout, stderr, code) = run(&conf, &[], b"hello\n");

    assert_eq!(stdout, b"hello\n");
    assert!(stderr.is_empty());
    assert_eq!(code, 0);

    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.contains("<< hello"));
    assert!(contents.contains(">> hello"));
}

#[test]
fn stderr_is_kept_separate_from_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, log) = write_conf(&dir, "/bin/sh");

    let (stdout, stderr, code) = run(
        &conf,
        &["-c", "printf OUT; printf ERR 1>&2"],
        b"",
    );

    assert_eq!(stdout, b"OUT");
    assert_eq!(stderr, b"ERR");
    assert_eq!(code, 0);

    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.contains(">> OUT"));
    assert!(contents.contains("!! ERR"));
}

#[test]
fn exit_code_is_propagated_faithfully_across_boundary_values() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, log) = write_conf(&dir, "/bin/sh");

    for code in [0, 1, 2, 42, 255] {
        let (_, _, got) = run(&conf, &["-c", &format!("exit {}", code)], b"");
        assert_eq!(got, code, "exit code mismatch for child exit {}", code);
    }

    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.ends_with('\n'));
}

#[test]
fn signaled_child_exits_with_128_plus_signal() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, log) = write_conf(&dir, "/bin/sh");

    let (_, _, code) = run(&conf, &["-c", "kill -TERM $$; sleep 1"], b"");

    assert_eq!(code, 128 + 15);
    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.contains("signal=SIGCHLD") || contents.contains("** signal"));
}

#[test]
fn large_input_round_trips_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, _log) = write_conf(&dir, "/bin/cat");

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let (stdout, _, code) = run(&conf, &[], &payload);

    assert_eq!(code, 0);
    assert_eq!(stdout, payload);
}

#[test]
fn config_file_overrides_exec_and_logfile() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, log) = write_conf(&dir, "/bin/echo");

    let (stdout, _, code) = run(&conf, &["hi", "there"], b"");

    assert_eq!(stdout, b"hi there\n");
    assert_eq!(code, 0);
    assert!(log.exists());
}
