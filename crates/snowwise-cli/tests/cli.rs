use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use tempfile::TempDir;

fn snowwise() -> Command {
    let mut cmd = Command::cargo_bin("snowwise").unwrap();
    cmd.env_remove("SNOWWISE_LOG");
    cmd
}

fn init(dir: &TempDir) -> std::path::PathBuf {
    let config = dir.path().join("snowwise.yaml");
    snowwise()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .success();
    config
}

#[test]
fn init_writes_config_and_fixture() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);
    assert!(config.exists());
    assert!(dir.path().join("snowwise.fixture.yaml").exists());

    // second init leaves the files alone
    snowwise()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stderr(contains("already exists"));
}

#[test]
fn offline_run_writes_report() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);
    let out = dir.path().join("out/report.json");

    snowwise()
        .args(["run", "--yes", "--config"])
        .arg(&config)
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stderr(contains("Summary"));

    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    // the INSERT in the fixture history is never a candidate
    assert_eq!(report["totals"]["candidates"], 2);
    assert_eq!(report["expense_metric"], "execution_time");
    assert_eq!(report["candidates"][0]["query_id"], "01b8e0a1-0000-0001");
}

#[test]
fn optimize_takes_a_single_query() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);
    let out = dir.path().join("single.json");

    snowwise()
        .args(["optimize", "SELECT COUNT(*) AS n FROM events", "--yes", "--config"])
        .arg(&config)
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(report["totals"]["candidates"], 1);
    assert_eq!(report["candidates"][0]["query_id"], "input-1");
    assert_eq!(report["candidates"][0]["outcome"]["status"], "validated");
}

#[test]
fn optimize_refuses_writes() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);

    snowwise()
        .args(["optimize", "DROP TABLE events", "--yes", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(contains("read-only"));
}

#[test]
fn declining_approval_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);

    snowwise()
        .args(["run", "--config"])
        .arg(&config)
        .write_stdin("n\n")
        .assert()
        .code(1)
        .stderr(contains("cancelled"));
}

#[test]
fn bad_metric_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);

    snowwise()
        .args(["run", "--yes", "--metric", "cpu", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(contains("unknown metric"));
}

#[test]
fn missing_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    snowwise()
        .args(["run", "--yes", "--config"])
        .arg(dir.path().join("nope.yaml"))
        .assert()
        .code(2);
}

#[test]
fn strict_mode_rejects_unknown_keys() {
    let dir = TempDir::new().unwrap();
    let config = init(&dir);
    let body = fs::read_to_string(&config).unwrap();
    fs::write(&config, format!("{}colour: blue\n", body)).unwrap();

    snowwise()
        .args(["run", "--yes", "--strict", "--config"])
        .arg(&config)
        .assert()
        .code(2);
}

#[test]
fn extract_prints_tables() {
    snowwise()
        .args(["extract", "SELECT * FROM sales.orders o JOIN items i ON o.id = i.order_id"])
        .assert()
        .success()
        .stdout("sales.orders\nitems\n");
}
