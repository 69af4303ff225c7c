use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "neo_sync_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn neo_sync(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_neo-sync"))
        .args(args)
        .output()
        .expect("run neo-sync")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = neo_sync(&["help"]);
    assert!(
        output.status.success(),
        "neo-sync help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("geometry"), "missing geometry in help output");
    assert!(stdout.contains("simulate"), "missing simulate in help output");
    assert!(stdout.contains("config"), "missing config in help output");
}

#[test]
fn simulate_help_lists_wait_knobs() {
    let output = neo_sync(&["simulate", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--backend", "--timeout-ms", "--delay-ms", "--hang", "--config", "--json"] {
        assert!(stdout.contains(flag), "missing {flag} in simulate help");
    }
}

#[test]
fn geometry_json_reports_slot_layout() {
    let output = neo_sync(&["geometry", "--count", "4", "--timestamp", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "geometry");
    assert_eq!(value["ok"], true);
    assert_eq!(value["geometry"]["packet_size"], 16);
    assert_eq!(value["geometry"]["event_size"], 256);
    assert_eq!(value["pool_size"], 1024);
    assert_eq!(value["completion_word_offset"], 8);
}

#[test]
fn geometry_wide_words_double_packet_size() {
    let output = neo_sync(&[
        "geometry",
        "--count",
        "2",
        "--width",
        "64",
        "--max-packets",
        "3",
        "--alignment",
        "128",
        "--json",
    ]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["geometry"]["packet_size"], 32);
    assert_eq!(value["geometry"]["event_size"], 128);
    assert_eq!(value["completion_word_offset"], 0);
}

#[test]
fn geometry_rejects_bad_alignment_with_json_error() {
    let output = neo_sync(&["geometry", "--count", "1", "--alignment", "48", "--json"]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(100));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "geometry");
    assert_eq!(value["ok"], false);
    assert_eq!(value["kind"], "invalid_argument");
    assert!(
        value["error"]
            .as_str()
            .is_some_and(|e| e.contains("power of two")),
        "unexpected error: {value}"
    );
}

#[test]
fn geometry_human_output_is_one_line() {
    let output = neo_sync(&["geometry", "--count", "2"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("geometry:"), "unexpected output: {stdout}");
    assert!(stdout.contains("event_size=256"));
    assert!(stdout.contains("pool_size=512"));
}

#[test]
fn config_defaults_and_env_override() {
    let output = Command::new(env!("CARGO_BIN_EXE_neo-sync"))
        .args(["config", "--json"])
        .env("NEO_SYNC_SKIP_REDUNDANT_DOWNLOADS", "0")
        .output()
        .expect("run neo-sync config");
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "config");
    assert_eq!(value["config"]["skip_redundant_downloads"], false);
    assert_eq!(value["config"]["gpu_hang_check_period_us"], 500_000);
    assert_eq!(value["config"]["device_hierarchy"], "composite");
}

#[test]
fn config_file_is_applied_and_validated() {
    let dir = unique_temp_dir("config");
    let good = dir.join("good.json");
    fs::write(&good, r#"{"gpu_hang_check_period_us": 1000, "signal_all_event_packets": true}"#)
        .expect("write config");
    let output = neo_sync(&["config", "--config", good.to_str().expect("utf8 path"), "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["config"]["gpu_hang_check_period_us"], 1000);
    assert_eq!(value["config"]["signal_all_event_packets"], true);

    let bad = dir.join("bad.json");
    fs::write(&bad, r#"{"gpu_hang_check_period_us": 0}"#).expect("write config");
    let output = neo_sync(&["config", "--config", bad.to_str().expect("utf8 path"), "--json"]);
    assert_eq!(output.status.code(), Some(100));
    let value = stdout_json(&output);
    assert_eq!(value["ok"], false);
    assert_eq!(value["kind"], "invalid_argument");

    let missing = dir.join("missing.json");
    let output = neo_sync(&["config", "--config", missing.to_str().expect("utf8 path")]);
    assert!(!output.status.success());

    let _ = fs::remove_dir_all(&dir);
}
