//! Runs the `acq-sim` binary end to end.

use std::io::Write;
use std::process::Command;

fn acq_sim() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_acq-sim"));
    command.env("RUST_LOG", "warn");
    command
}

#[test]
fn test_help_lists_run() {
    let output = acq_sim().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"), "{}", stdout);
}

#[test]
fn test_run_prints_result_set() {
    let output = acq_sim()
        .args(["run", "--repetition", "3x2", "--exposure", "0.002"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Secondary electrons"), "{}", stdout);
    assert!(stdout.contains("shape [2, 3]"), "{}", stdout);
    assert!(stdout.contains("Acquisition complete: 2 arrays"), "{}", stdout);
}

#[test]
fn test_run_with_aux_and_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[engine]\ntimeout_margin = \"1s\"\n\n[simulation]\nrepetition = \"2x2\"\nexposure_time = 0.002\n"
    )
    .unwrap();
    let output = acq_sim()
        .arg("run")
        .arg("--config")
        .arg(file.path())
        .args(["--aux", "horizontal,vertical"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Two separate scan images, one merged counter image.
    assert!(stdout.contains("at horizontal"), "{}", stdout);
    assert!(stdout.contains("at vertical"), "{}", stdout);
    assert!(stdout.contains("Acquisition complete: 3 arrays"), "{}", stdout);
}

#[test]
fn test_bad_repetition_fails() {
    let output = acq_sim().args(["run", "--repetition", "lots"]).output().unwrap();
    assert!(!output.status.success());
}
