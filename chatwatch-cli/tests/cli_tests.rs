// Binary-level tests for the offline CLI commands

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn chatwatch(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_chatwatch"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("CHATWATCH_DATABASE_PATH")
        .env_remove("CHATWATCH_CONFIG")
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run chatwatch")
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let db = dir.join("alerts.db");
    let config = dir.join("chatwatch.toml");
    fs::write(
        &config,
        format!(
            "database_path = \"{}\"\n\n[[channels]]\nid = \"C0123456\"\nlabel = \"ops\"\n",
            db.display()
        ),
    )
    .unwrap();
    config
}

#[test]
fn test_missing_config_exits_non_zero() {
    let dir = tempdir().unwrap();
    let output = chatwatch(&dir.path().join("absent.toml"), &["--once"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"), "stderr: {}", stderr);
}

#[test]
fn test_stats_on_empty_store() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    let output = chatwatch(&config, &["--stats"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("last 24h"), "stdout: {}", stdout);
    assert!(stdout.contains("Total alerts:     0"));
    assert!(dir.path().join("alerts.db").exists());
}

#[test]
fn test_clear_old_reports_count() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    let output = chatwatch(&config, &["--clear-old", "7"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Deleted 0 alert(s) older than 7 day(s)"), "stdout: {}", stdout);
}

#[test]
fn test_once_without_token_is_fatal() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_chatwatch"))
        .arg("--config")
        .arg(&config)
        .arg("--once")
        .env_remove("SLACK_BOT_TOKEN")
        .env_remove("CHATWATCH_DATABASE_PATH")
        .env("RUST_LOG", "off")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Slack credentials missing"));
}

#[test]
fn test_once_with_realtime_disabled_skips_cycle() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());
    let mut contents = fs::read_to_string(&config).unwrap();
    contents.push_str("\n[slack]\nbot_token = \"xoxb-test\"\n\n[realtime]\nenabled = false\n");
    fs::write(&config, contents).unwrap();

    let output = chatwatch(&config, &["--once"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Realtime monitor disabled"), "stdout: {}", stdout);
    assert!(!stdout.contains("Cycle complete"));
}
