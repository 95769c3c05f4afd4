use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

const GOOD_CONFIG: &str = r#"
server:
  default_flow: basic
templates:
  ask:
    required_params: [topic]
    body: "Reason about {{topic}}."
thinking_flows:
  basic:
    steps:
      - name: think
        template_name: ask
        final: true
"#;

#[test]
fn validate_accepts_a_good_config() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.yaml");
    std::fs::write(&config_path, GOOD_CONFIG).unwrap();

    Command::cargo_bin("deepthink")
        .unwrap()
        .env("DEEPTHINK_HOME", temp.path())
        .arg("validate")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK: 1 flows, 1 templates"))
        .stdout(predicate::str::contains("flow 'basic': 1 steps"));
}

#[test]
fn validate_rejects_a_bad_config() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.yaml");
    // default_flow points at a flow that does not exist
    std::fs::write(
        &config_path,
        GOOD_CONFIG.replace("default_flow: basic", "default_flow: ghost"),
    )
    .unwrap();

    Command::cargo_bin("deepthink")
        .unwrap()
        .env("DEEPTHINK_HOME", temp.path())
        .arg("validate")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("default_flow"));
}

#[test]
fn validate_rejects_a_missing_file() {
    let temp = tempdir().unwrap();
    Command::cargo_bin("deepthink")
        .unwrap()
        .env("DEEPTHINK_HOME", temp.path())
        .arg("validate")
        .arg("--config")
        .arg(temp.path().join("nope.yaml"))
        .assert()
        .failure();
}

#[test]
fn validate_accepts_the_shipped_config() {
    let temp = tempdir().unwrap();
    Command::cargo_bin("deepthink")
        .unwrap()
        .env("DEEPTHINK_HOME", temp.path())
        .arg("validate")
        .arg("--config")
        .arg(env!("CARGO_MANIFEST_DIR").to_string() + "/config.yaml")
        .assert()
        .success()
        .stdout(predicate::str::contains("comprehensive_analysis"));
}
