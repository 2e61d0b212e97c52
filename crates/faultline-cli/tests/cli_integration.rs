use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

use faultline_server::{FaultServer, ServerConfig};

fn faultline() -> Command {
    Command::cargo_bin("faultline").unwrap()
}

#[test]
fn test_help_exits_zero() {
    faultline()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("faultline"))
        .stdout(predicate::str::contains("probe"));
}

#[test]
fn test_scenarios_text_marks_faults() {
    faultline()
        .arg("scenarios")
        .assert()
        .success()
        .stdout(predicate::str::contains("/api/error/protocol"))
        .stdout(predicate::str::contains("! GET"));
}

#[test]
fn test_scenarios_json_lists_the_table() {
    let assert = faultline().args(["--format", "json", "scenarios"]).assert().success();
    let table: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    let table = table.as_array().unwrap();

    let paths: Vec<&str> = table.iter().filter_map(|s| s["path"].as_str()).collect();
    for path in ["/api/get", "/api/post", "/api/stream-xhr", "/api/error/truncated", "/api/error/hang"] {
        assert!(paths.contains(&path), "missing {path}");
    }
    let hang = table.iter().find(|s| s["path"] == "/api/error/hang").unwrap();
    assert_eq!(hang["timing"]["kind"], "hang");
}

#[test]
fn test_unknown_query_is_a_protocol_error() {
    faultline()
        .args(["--wait-ms", "100", "query", "getShoeSize"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("getColorScheme"));
}

#[test]
fn test_no_app_is_a_connection_error() {
    faultline()
        .args(["--bind", "127.0.0.1:0", "--wait-ms", "100", "query", "getAppName"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No app connected"));
}

#[test]
fn test_invalid_policy_is_rejected_by_clap() {
    faultline()
        .args(["stream", "http://127.0.0.1:1/api/stream-xhr", "--policy", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sometimes"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_probe_records_every_step() {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        stream_interval: Duration::from_millis(10),
        stream_chunks: 3,
        delay: Duration::from_millis(20),
        large_body_bytes: 16 * 1024,
        truncate_after: Duration::from_millis(20),
        image_size: 16,
        large_image_size: 32,
        shutdown_grace: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let server = FaultServer::bind(config).await.unwrap().spawn();
    let base_url = server.base_url();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("probe.json");

    let out_arg = out.clone();
    tokio::task::spawn_blocking(move || {
        faultline()
            .args(["--quiet", "probe", "--hang-timeout-ms", "300", "--base-url", base_url.as_str(), "--out"])
            .arg(&out_arg)
            .assert()
            .success();
    })
    .await
    .unwrap();

    let log: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    let log = log.as_array().unwrap();
    assert_eq!(log.len(), 21);

    let entry = |suffix: &str| {
        log.iter()
            .find(|e| e["request"]["url"].as_str().is_some_and(|u| u.contains(suffix)))
            .unwrap_or_else(|| panic!("no entry for {suffix}"))
    };

    let first = entry("/get?page=2");
    assert_eq!(first["request"]["method"], "GET");
    assert_eq!(first["request"]["query"]["sort"], "desc");
    assert_eq!(first["response"]["status"], 200);
    assert_eq!(first["response"]["body"]["meta"]["page"], 2);

    assert_eq!(entry("/post")["response"]["status"], 201);
    assert_eq!(entry("/form")["request"]["body"]["username"], "testuser");
    assert_eq!(entry("/error/client-error")["response"]["status"], 403);
    assert_eq!(entry("/error/truncated")["error"]["kind"], "TransportTruncation");
    assert_eq!(entry("/error/json")["error"]["kind"], "MalformedResponse");
    assert_eq!(entry("/error/protocol")["error"]["kind"], "ProtocolViolation");
    assert_eq!(entry("/error/hang")["error"]["kind"], "Timeout");
    assert!(entry("/error/hang").get("response").is_none());

    server.shutdown().await;
}
