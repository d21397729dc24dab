#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::{tempdir, TempDir};

const SCRIPTS: &[(&str, &str)] = &[
    ("ok_scenario", "echo running; exit 0"),
    ("noisy_scenario", "echo 'something went wrong' >&2; exit 0"),
    ("skip_scenario", "echo 'no daemon here' >&2; exit 77"),
    ("bad_scenario", "echo 'bad stdout'; echo boom >&2; exit 1"),
    ("echo_args", "echo \"$@\" >&2; exit 1"),
    ("slow_scenario", "sleep 30"),
];

/// All scripts exist before any test spawns a process, so no exec can race
/// an open write handle (ETXTBSY).
fn scenario_dir() -> &'static Path {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempdir().expect("tempdir");
        for (name, body) in SCRIPTS {
            let path = dir.path().join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        dir
    })
    .path()
}

fn runner(tmp: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("test-runner");
    cmd.env_remove("RUST_LOG")
        .arg("--scenario-dir")
        .arg(scenario_dir())
        .arg("--tmpdirprefix")
        .arg(tmp.path());
    cmd
}

#[test]
fn clean_exit_with_stderr_output_fails() {
    let tmp = tempdir().expect("tempdir");
    runner(&tmp)
        .args(["-j", "2", "ok_scenario", "noisy_scenario"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("noisy_scenario failed"))
        .stdout(predicate::str::contains("something went wrong"))
        .stdout(predicate::str::is_match(r"ok_scenario +\| . Passed +\| \d+ s").unwrap())
        .stdout(predicate::str::is_match(r"noisy_scenario \| . Failed +\| \d+ s").unwrap())
        .stdout(predicate::str::is_match(r"ALL +\| . Failed +\| \d+ s \(accumulated\)").unwrap());
    // The run directory is removed once no scenario left anything behind.
    assert_eq!(fs::read_dir(tmp.path()).expect("read tmp").count(), 0);
}

#[test]
fn skipped_scenarios_do_not_fail_the_run() {
    let tmp = tempdir().expect("tempdir");
    runner(&tmp)
        .args(["ok_scenario", "skip_scenario"])
        .assert()
        .success()
        .stdout(predicate::str::contains("skip_scenario skipped"))
        .stdout(predicate::str::is_match(r"skip_scenario \| . Skipped \| \d+ s").unwrap())
        .stdout(predicate::str::is_match(r"ALL +\| . Passed +\|").unwrap());
}

#[test]
fn every_scenario_gets_a_seed_a_tmpdir_and_passthrough_flags() {
    let tmp = tempdir().expect("tempdir");
    runner(&tmp)
        .args(["echo_args", "--", "--nocleanup", "--tracerpc"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("--nocleanup --tracerpc --portseed=0 --tmpdir="))
        .stdout(predicate::str::is_match(r"test_runner_\d{8}_\d{6}/echo_args_0").unwrap());
}

#[test]
fn failfast_stops_and_kills_running_scenarios() {
    let tmp = tempdir().expect("tempdir");
    let started = Instant::now();
    runner(&tmp)
        .args(["-j", "2", "--failfast", "bad_scenario", "slow_scenario", "ok_scenario"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("bad_scenario failed"))
        .stdout(predicate::str::contains("bad stdout"))
        .stdout(predicate::str::contains("boom"))
        .stdout(predicate::str::contains("Early exiting after test failure"))
        .stdout(predicate::str::contains("slow_scenario |").not())
        .stdout(predicate::str::contains("ok_scenario").not());
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[test]
fn exclude_and_filter_narrow_the_run() {
    let tmp = tempdir().expect("tempdir");
    runner(&tmp)
        .args([
            "--exclude=bad_scenario,unknown",
            "--filter",
            "^(ok|bad)_",
            "ok_scenario",
            "bad_scenario",
            "skip_scenario",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scenario 'unknown' not found in current scenario list"))
        .stdout(predicate::str::contains("ok_scenario"))
        .stdout(predicate::str::contains("bad_scenario |").not())
        .stdout(predicate::str::contains("skip_scenario").not());
}

#[test]
fn nothing_to_run_exits_cleanly() {
    let tmp = tempdir().expect("tempdir");
    runner(&tmp)
        .args(["missing_scenario", "zzz*"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scenario 'zzz*' not found in the scenario list"))
        .stdout(predicate::str::contains("Scenario 'missing_scenario' has no executable"))
        .stdout(predicate::str::contains("No valid scenarios specified"));
    assert_eq!(fs::read_dir(tmp.path()).expect("read tmp").count(), 0);
}

#[test]
fn quiet_hides_progress_lines() {
    let tmp = tempdir().expect("tempdir");
    runner(&tmp)
        .args(["--quiet", "ok_scenario"])
        .assert()
        .success()
        .stdout(predicate::str::contains("passed, Duration").not())
        .stdout(predicate::str::contains("Runtime:"));
}
