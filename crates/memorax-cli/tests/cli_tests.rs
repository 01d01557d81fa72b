//! Black-box tests of the memorax binary.

use std::io::Write as _;
use std::process::{Command, Stdio};

const LITMUS: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  L1: read: y = 0;
  CS: nop

process
text
  M0: write: y := 1;
  M1: read: x = 0;
  CS: nop
"#;

const LITMUS_FENCED: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  F0: fence;
  L1: read: y = 0;
  CS: nop

process
text
  M0: write: y := 1;
  F1: fence;
  M1: read: x = 0;
  CS: nop
"#;

fn memorax(args: &[&str], stdin: &str) -> (i32, String, String) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_memorax"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start memorax");
    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    let out = child.wait_with_output().expect("wait");
    (
        out.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&out.stdout).into_owned(),
        String::from_utf8_lossy(&out.stderr).into_owned(),
    )
}

#[test]
fn reach_sb_litmus_is_reachable() {
    let (code, stdout, _) = memorax(&["reach", "-a", "sb"], LITMUS);
    assert_eq!(code, 0);
    assert!(stdout.contains("REACHABLE"), "stdout: {stdout}");
    assert!(stdout.contains("Witness trace"), "stdout: {stdout}");
}

#[test]
fn reach_sb_fenced_litmus_is_unreachable() {
    let (code, stdout, _) = memorax(&["reach", "-a", "sb"], LITMUS_FENCED);
    assert_eq!(code, 0);
    assert!(stdout.contains("UNREACHABLE"), "stdout: {stdout}");
}

#[test]
fn reach_defaults_to_sb() {
    let (code, stdout, _) = memorax(&["reach"], LITMUS);
    assert_eq!(code, 0);
    assert!(stdout.contains("REACHABLE"));
}

#[test]
fn reach_vips_litmus_is_reachable() {
    let (code, stdout, _) = memorax(&["reach", "-a", "vips"], LITMUS);
    assert_eq!(code, 0);
    assert!(stdout.contains("REACHABLE"));
}

#[test]
fn reach_json_emits_summary_line() {
    let (code, stdout, _) = memorax(&["--json", "reach", "-a", "sb"], LITMUS);
    assert_eq!(code, 0);
    let json_line = stdout
        .lines()
        .find(|l| l.starts_with('{'))
        .expect("a JSON line");
    let value: serde_json::Value = serde_json::from_str(json_line).expect("valid JSON");
    assert_eq!(value["command"], "reach");
    assert_eq!(value["verdict"], "REACHABLE");
}

#[test]
fn parse_error_exits_with_one() {
    let (code, _, stderr) = memorax(&["reach"], "forbidden");
    assert_eq!(code, 1);
    assert!(stderr.contains("Syntax error"), "stderr: {stderr}");
}

#[test]
fn unknown_flag_exits_with_one() {
    let (code, _, _) = memorax(&["reach", "--no-such-flag"], LITMUS);
    assert_eq!(code, 1);
}

#[test]
fn unknown_abstraction_exits_with_one() {
    let (code, _, _) = memorax(&["reach", "-a", "tso"], LITMUS);
    assert_eq!(code, 1);
}

#[test]
fn fencins_subset_reports_sync_sets() {
    let (code, stdout, _) = memorax(&["fencins", "-a", "sb", "--fmin", "subset"], LITMUS);
    assert_eq!(code, 0);
    assert!(stdout.contains("synchronization set"), "stdout: {stdout}");
    assert!(stdout.contains("Sync set #0"), "stdout: {stdout}");
}

#[test]
fn fencins_cheap_with_vips_is_unsupported() {
    let (code, _, stderr) = memorax(&["fencins", "-a", "vips", "--fmin", "cheap"], LITMUS);
    assert_eq!(code, 1);
    assert!(stderr.contains("Unsupported combination"), "stderr: {stderr}");
}

#[test]
fn reach_pb_cegar_budget_zero_reports_exhaustion() {
    let spurious = r#"
forbidden E0 E1

data
  x = 0 : [0:1]

process
text
  A: write: x := 1;
  E0: nop

process
text
  B: read: x = 1;
  C: read: x = 0;
  E1: nop
"#;
    let (code, stdout, _) = memorax(
        &["reach", "-a", "pb", "--cegar", "--max-refinements", "0"],
        spurious,
    );
    assert_eq!(code, 0, "budget exhaustion is an analysis outcome");
    assert!(
        stdout.contains("REFINEMENT_BUDGET_EXHAUSTED"),
        "stdout: {stdout}"
    );
}

#[test]
fn dotify_runs_and_exits_cleanly() {
    let dir = std::env::temp_dir().join("memorax-dotify-test.pdf");
    let out = dir.to_string_lossy().into_owned();
    let (code, stdout, _) = memorax(&["dotify", "-o", &out], LITMUS);
    assert_eq!(code, 0);
    assert!(
        stdout.contains("Wrote pdf") || stdout.contains("Failed to dotify"),
        "stdout: {stdout}"
    );
    let _ = std::fs::remove_file(dir);
}
