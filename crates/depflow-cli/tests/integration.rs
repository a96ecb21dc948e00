#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn depflow(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("depflow").unwrap();
    cmd.current_dir(dir.path()).env("DEPFLOW_ROOT", dir.path());
    cmd
}

fn json_of(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.arg("--json").output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

/// init + one channel + one target installation.
fn init_engine(dir: &TempDir) {
    depflow(dir).arg("init").assert().success();
    depflow(dir)
        .args(["channel", "add", "channel", "--classification", "class"])
        .assert()
        .success();
    depflow(dir)
        .args(["installation", "add", "target.repo", "1"])
        .assert()
        .success();
}

fn add_subscription(dir: &TempDir, frequency: &str) -> String {
    let sub = json_of(depflow(dir).args([
        "subscription",
        "add",
        "--channel",
        "1",
        "--source",
        "source.repo",
        "--target",
        "target.repo",
        "--branch",
        "target.branch",
        "--frequency",
        frequency,
    ]));
    sub["id"].as_str().unwrap().to_string()
}

fn add_build(dir: &TempDir, number: &str, version: &str) -> u64 {
    let asset = format!("source.asset={version}");
    let build = json_of(depflow(dir).args([
        "build",
        "add",
        "--repo",
        "source.repo",
        "--branch",
        "source.branch",
        "--number",
        number,
        "--commit",
        "sha",
        "--asset",
        asset.as_str(),
        "--channel",
        "1",
    ]));
    build["id"].as_u64().unwrap()
}

// ---------------------------------------------------------------------------
// depflow init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_config_and_databases() {
    let dir = TempDir::new().unwrap();
    depflow(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: depflow.yaml"));

    assert!(dir.path().join("depflow.yaml").exists());
    assert!(dir.path().join(".depflow/flow.redb").exists());
    assert!(dir.path().join(".depflow/queue.redb").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    depflow(&dir).arg("init").assert().success();
    depflow(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  depflow.yaml"));
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    depflow(&dir)
        .args(["channel", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

// ---------------------------------------------------------------------------
// seeding
// ---------------------------------------------------------------------------

#[test]
fn channel_add_and_list() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    depflow(&dir)
        .args(["channel", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("channel").and(predicate::str::contains("class")));

    let channels = json_of(depflow(&dir).args(["channel", "list"]));
    assert_eq!(channels[0]["id"], 1);
}

#[test]
fn subscription_rejects_bad_frequency_and_policy() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    let base = [
        "subscription",
        "add",
        "--channel",
        "1",
        "--source",
        "source.repo",
        "--target",
        "target.repo",
        "--branch",
        "main",
    ];
    depflow(&dir)
        .args(base)
        .args(["--frequency", "hourly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid update frequency"));
    depflow(&dir)
        .args(base)
        .args(["--policy", "minimum_approvals=0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("minimum_approvals"));
}

#[test]
fn subscription_disable_and_enable() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    let id = add_subscription(&dir, "every_day");

    let sub = json_of(depflow(&dir).args(["subscription", "disable", id.as_str()]));
    assert_eq!(sub["enabled"], false);
    let sub = json_of(depflow(&dir).args(["subscription", "enable", id.as_str()]));
    assert_eq!(sub["enabled"], true);

    depflow(&dir)
        .args(["subscription", "delete", id.as_str()])
        .assert()
        .success();
    depflow(&dir)
        .args(["subscription", "show", id.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("subscription not found"));
}

// ---------------------------------------------------------------------------
// triggers -> queue -> history
// ---------------------------------------------------------------------------

#[test]
fn new_build_flows_to_merged_pull_request() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    let sub_id = add_subscription(&dir, "every_build");
    let build = add_build(&dir, "build.number", "1.0.1");

    let due = json_of(depflow(&dir).args(["trigger", "build", build.to_string().as_str(), "--channel", "1"]));
    assert_eq!(due.as_array().unwrap().len(), 1);

    let stats = json_of(depflow(&dir).args(["queue", "stats"]));
    assert_eq!(stats["ready"], 1);

    let results = json_of(depflow(&dir).args(["queue", "drain"]));
    assert_eq!(results[0]["result"], "processed");
    assert_eq!(results[0]["outcome"]["outcome"], "merged");

    let shown = json_of(depflow(&dir).args(["subscription", "show", sub_id.as_str()]));
    assert_eq!(shown["subscription"]["last_applied_build_id"], build);

    let history = json_of(depflow(&dir).args([
        "history",
        "list",
        "--repo",
        "target.repo",
        "--branch",
        "target.branch",
    ]));
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["success"], true);
    assert_eq!(history[0]["repositoryName"], "target.repo");
}

#[test]
fn redelivered_trigger_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    add_subscription(&dir, "every_build");
    let build = add_build(&dir, "build.number", "1.0.1").to_string();

    for _ in 0..2 {
        depflow(&dir)
            .args(["trigger", "build", build.as_str(), "--channel", "1"])
            .assert()
            .success();
    }
    let results = json_of(depflow(&dir).args(["queue", "drain"]));
    assert_eq!(results[0]["outcome"]["outcome"], "merged");
    assert_eq!(results[1]["outcome"]["outcome"], "no_op");
}

#[test]
fn sweep_rejects_every_build_class() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    depflow(&dir)
        .args(["trigger", "sweep", "--frequency", "every_build"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a periodic update frequency"));
}

#[test]
fn daily_sweep_picks_up_newer_build() {
    let dir = TempDir::new().unwrap();
    init_engine(&dir);
    add_subscription(&dir, "every_day");
    let build = add_build(&dir, "build.number", "1.0.1");

    let due = json_of(depflow(&dir).args(["trigger", "sweep", "--frequency", "every_day"]));
    assert_eq!(due[0]["build_id"], build);
}

#[test]
fn failed_item_can_be_retried_but_success_cannot() {
    let dir = TempDir::new().unwrap();
    depflow(&dir).arg("init").assert().success();
    depflow(&dir)
        .args(["channel", "add", "channel"])
        .assert()
        .success();
    // No installation registered for target.repo: the update fails.
    add_subscription(&dir, "every_build");
    let build = add_build(&dir, "build.number", "1.0.1").to_string();
    depflow(&dir)
        .args(["trigger", "build", build.as_str(), "--channel", "1"])
        .assert()
        .success();
    let results = json_of(depflow(&dir).args(["queue", "drain"]));
    assert_eq!(results[0]["outcome"]["outcome"], "failed");

    let history = json_of(depflow(&dir).args(["history", "list"]));
    assert_eq!(history[0]["success"], false);
    let retry_url = history[0]["retryUrl"].as_str().unwrap();
    let id = retry_url
        .trim_end_matches("/retry")
        .rsplit('/')
        .next()
        .unwrap()
        .to_string();

    depflow(&dir)
        .args(["history", "retry", id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Re-enqueued"));

    depflow(&dir)
        .args(["installation", "add", "target.repo", "1"])
        .assert()
        .success();
    let results = json_of(depflow(&dir).args(["queue", "drain"]));
    assert_eq!(results[0]["outcome"]["outcome"], "merged");

    let history = json_of(depflow(&dir).args(["history", "list"]));
    assert_eq!(history.as_array().unwrap().len(), 2);
    assert_eq!(history[0]["success"], true);
    let newest = json_of(depflow(&dir).args(["history", "list", "--limit", "1"]));
    assert_eq!(newest.as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// config / recover
// ---------------------------------------------------------------------------

#[test]
fn config_validate_passes_on_defaults() {
    let dir = TempDir::new().unwrap();
    depflow(&dir).arg("init").assert().success();
    depflow(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_fails_on_errors() {
    let dir = TempDir::new().unwrap();
    depflow(&dir).arg("init").assert().success();
    std::fs::write(dir.path().join("depflow.yaml"), "version: 1\nworkers: 0\n").unwrap();
    depflow(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] workers"));
}

#[test]
fn recover_with_nothing_stuck() {
    let dir = TempDir::new().unwrap();
    depflow(&dir).arg("init").assert().success();
    depflow(&dir)
        .arg("recover")
        .assert()
        .success()
        .stdout(predicate::str::contains("No stuck actors."));
}
