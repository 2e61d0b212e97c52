//! Both network stacks against the live fault server.
//!
//! Every scenario runs once per [`NetworkMode`]; the failure taxonomy must
//! not depend on which stack is active.

mod common;

use std::time::Duration;

use serde_json::{json, Map};

use common::{fault_server, rig, TIMEOUT};

use faultline_core::harness::{NetworkHarness, NetworkMode};
use faultline_core::http::{AbortSignal, HttpRequest, NetError};
use faultline_core::protocol::{Command, FetchSpec, Notification, StreamPolicy, StreamRequest};
use faultline_server::routes::{INVALID_JSON_BODY, STREAM_FINISHED, STREAM_STARTED};

const MODES: [NetworkMode; 2] = [NetworkMode::Native, NetworkMode::Polyfill];

fn harness(mode: NetworkMode) -> NetworkHarness {
    let harness = NetworkHarness::with_defaults().unwrap();
    harness.set_mode(mode);
    harness
}

fn signal() -> AbortSignal {
    AbortSignal::timeout(TIMEOUT)
}

// ---------------------------------------------------------------------------
// Well-formed exchanges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_with_query_parameters() {
    let server = fault_server().await;
    for mode in MODES {
        let response = harness(mode)
            .fetch(HttpRequest::get(server.url("/get?page=2&sort=desc")), &signal())
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "{mode:?}");
        let body = response.json().await.unwrap();
        assert_eq!(body["meta"]["page"], 2, "{mode:?}");
        assert_eq!(body["meta"]["sort"], "desc", "{mode:?}");
    }
}

#[tokio::test]
async fn post_then_patch() {
    let server = fault_server().await;
    for mode in MODES {
        let harness = harness(mode);
        let created = harness
            .fetch(
                HttpRequest::new("POST", server.url("/post")).json(&json!({"name": "Alice"})),
                &signal(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), 201, "{mode:?}");
        let created = created.json().await.unwrap();
        assert_eq!(created["captured_data"]["name"], "Alice");

        let patched = harness
            .fetch(
                HttpRequest::new("PATCH", server.url("/patch/1")).json(&json!({"name": "Johnny"})),
                &signal(),
            )
            .await
            .unwrap();
        assert_eq!(patched.status(), 204, "{mode:?}");
        assert!(patched.bytes().await.unwrap().is_empty());
    }
    let john = server.state().records.get(1).unwrap();
    assert_eq!(john["name"], "Johnny");
    assert_eq!(server.state().records.len(), 4);
}

#[tokio::test]
async fn fetch_spec_string_body_posts_a_form() {
    let server = fault_server().await;
    for mode in MODES {
        let spec = FetchSpec {
            method: Some("POST".to_string()),
            body: Some(json!("username=a&password=b")),
            ..FetchSpec::get(server.url("/form"))
        };
        let response = harness(mode).fetch(HttpRequest::from_fetch(&spec), &signal()).await.unwrap();
        assert_eq!(response.status(), 200, "{mode:?}");
        let body = response.json().await.unwrap();
        assert_eq!(body["received_user"], "a", "{mode:?}");
    }
}

#[tokio::test]
async fn fetch_spec_multipart_uploads_a_file() {
    let server = fault_server().await;
    let fields = json!({
        "description": "Test file upload",
        "multipart_data": {"filename": "test.txt", "contentType": "text/plain", "content": "filecontent"}
    });
    for mode in MODES {
        let spec = FetchSpec {
            method: Some("POST".to_string()),
            multipart: fields.as_object().cloned(),
            ..FetchSpec::get(server.url("/multipart"))
        };
        let response = harness(mode).fetch(HttpRequest::from_fetch(&spec), &signal()).await.unwrap();
        assert_eq!(response.status(), 200, "{mode:?}");
        let body = response.json().await.unwrap();
        assert_eq!(body["filename"], "test.txt", "{mode:?}");
        assert_eq!(body["size"], 11, "{mode:?}");
        assert_eq!(body["metadata_received"], "Test file upload", "{mode:?}");
    }
}

#[tokio::test]
async fn redirect_is_followed() {
    let server = fault_server().await;
    for mode in MODES {
        let response = harness(mode)
            .fetch(HttpRequest::get(server.url("/redirect")), &signal())
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "{mode:?}");
        assert!(response.url().ends_with("/api/get?redirected=true"), "{mode:?}: {}", response.url());
        let body = response.json().await.unwrap();
        assert_eq!(body["meta"]["redirected"], true);
    }
}

#[tokio::test]
async fn compressed_json_decodes() {
    let server = fault_server().await;
    for mode in MODES {
        let body = harness(mode)
            .fetch(HttpRequest::get(server.url("/compress")), &signal())
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.as_array().map(Vec::len), Some(1000), "{mode:?}");
    }
}

#[tokio::test]
async fn error_statuses_are_responses() {
    let server = fault_server().await;
    for mode in MODES {
        let harness = harness(mode);
        let forbidden = harness
            .fetch(HttpRequest::get(server.url("/error/client-error")), &signal())
            .await
            .unwrap();
        assert_eq!(forbidden.status(), 403);
        let err = forbidden.error_for_status().unwrap_err();
        assert!(matches!(err, NetError::Status(403)), "{mode:?}: {err:?}");

        let unavailable = harness
            .fetch(HttpRequest::get(server.url("/error/server-error")), &signal())
            .await
            .unwrap();
        assert_eq!(unavailable.status(), 503);
        assert!(unavailable.text().await.unwrap().contains("503 Service Unavailable"));
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

#[tokio::test]
async fn truncated_body_is_transport_truncation() {
    let server = fault_server().await;
    for mode in MODES {
        let response = harness(mode)
            .fetch(HttpRequest::get(server.url("/error/truncated")), &signal())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.content_length(), Some(1024));
        let err = response.bytes().await.unwrap_err();
        assert!(matches!(err, NetError::Truncated { .. }), "{mode:?}: {err:?}");
        assert_eq!(err.kind(), "TransportTruncation");
    }
}

#[tokio::test]
async fn invalid_json_is_malformed_with_raw_text() {
    let server = fault_server().await;
    for mode in MODES {
        let err = harness(mode)
            .fetch(HttpRequest::get(server.url("/error/json")), &signal())
            .await
            .unwrap()
            .json()
            .await
            .unwrap_err();
        match err {
            NetError::Malformed { raw, .. } => assert_eq!(raw, INVALID_JSON_BODY, "{mode:?}"),
            other => panic!("{mode:?}: expected Malformed, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn raw_bytes_are_a_protocol_violation() {
    let server = fault_server().await;
    for mode in MODES {
        let err = harness(mode)
            .fetch(HttpRequest::get(server.url("/error/protocol")), &signal())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::ProtocolViolation(_)), "{mode:?}: {err:?}");
    }
}

#[tokio::test]
async fn hang_is_bounded_by_the_abort_signal() {
    let server = fault_server().await;
    for mode in MODES {
        let err = harness(mode)
            .fetch(
                HttpRequest::get(server.url("/error/hang")),
                &AbortSignal::timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)), "{mode:?}: {err:?}");
    }
}

#[tokio::test]
async fn explicit_abort_is_distinct_from_timeout() {
    let server = fault_server().await;
    let signal = AbortSignal::timeout(TIMEOUT);
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = harness(NetworkMode::Native)
        .fetch(HttpRequest::get(server.url("/error/hang")), &signal)
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Aborted), "{err:?}");
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complete_stream_reads_everything() {
    let server = fault_server().await;
    for mode in MODES {
        let mut response = harness(mode)
            .fetch(HttpRequest::get(server.url("/stream-xhr")), &signal())
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(chunk) = response.chunk().await.unwrap() {
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(text.starts_with(STREAM_STARTED), "{mode:?}");
        assert!(text.contains("[Chunk 5]"), "{mode:?}");
        assert!(text.ends_with(STREAM_FINISHED), "{mode:?}");

        let report = harness(mode)
            .run_stream(&server.url("/stream-xhr"), StreamPolicy::Complete, signal())
            .await;
        assert_eq!(report.mode, mode);
        assert_eq!(report.status, Some(200));
        assert!(report.chunks >= 2, "{report:?}");
        assert_eq!(report.bytes, text.len() as u64, "{mode:?}");
        assert!(!report.cancelled);
        assert_eq!(report.error, None);
    }
}

#[tokio::test]
async fn cancel_and_abandon_stop_early() {
    let server = fault_server().await;
    for mode in MODES {
        let harness = harness(mode);

        let cancelled = harness
            .run_stream(&server.url("/stream-xhr"), StreamPolicy::Cancel { after: 3 }, signal())
            .await;
        assert_eq!(cancelled.chunks, 3, "{mode:?}");
        assert!(cancelled.cancelled);
        assert_eq!(cancelled.error, None);

        let abandoned = harness
            .run_stream(&server.url("/stream-xhr"), StreamPolicy::Abandon { after: 2 }, signal())
            .await;
        assert_eq!(abandoned.chunks, 2, "{mode:?}");
        assert!(!abandoned.cancelled);
    }
    assert!(common::eventually(|| server.state().active_streams() == 0).await);
}

#[tokio::test]
async fn fallback_reads_the_whole_body() {
    let server = fault_server().await;
    for mode in MODES {
        let report = harness(mode)
            .run_stream(&server.url("/stream-xhr"), StreamPolicy::Fallback, signal())
            .await;
        assert_eq!(report.chunks, 0);
        assert!(report.bytes > STREAM_STARTED.len() as u64, "{mode:?}");
        assert_eq!(report.error, None);
    }
}

#[tokio::test]
async fn stream_failures_are_reported_not_raised() {
    let server = fault_server().await;
    let report = harness(NetworkMode::Polyfill)
        .run_stream(&server.url("/error/truncated"), StreamPolicy::Complete, signal())
        .await;
    let error = report.error.unwrap();
    assert_eq!(error.kind, "TransportTruncation");
    assert_eq!(report.status, Some(200));
}

// ---------------------------------------------------------------------------
// Through the control channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_stream_command_replies_with_report() {
    let server = fault_server().await;
    let rig = rig().await;

    let command = Command::RunStream(StreamRequest::new(server.url("/stream-xhr"), StreamPolicy::Cancel { after: 2 }));
    let reply = rig.host.request(&command, TIMEOUT).await.unwrap();
    let report = reply.value.unwrap();
    assert_eq!(report["policy"], "cancel");
    assert_eq!(report["after"], 2);
    assert_eq!(report["mode"], "native");
    assert_eq!(report["chunks"], 2);
    assert_eq!(report["cancelled"], true);
}

#[tokio::test]
async fn scoped_polyfill_stream_restores_native_mode() {
    let server = fault_server().await;
    let rig = rig().await;

    let command = Command::RunStream(StreamRequest::new(server.url("/get"), StreamPolicy::Plain).with_polyfill(true));
    let reply = rig.host.request(&command, TIMEOUT).await.unwrap();
    let report = reply.value.unwrap();
    assert_eq!(report["policy"], "plain");
    assert_eq!(report["mode"], "polyfill");
    assert_eq!(report["status"], 200);
    assert!(report["bytes"].as_u64().unwrap() > 0);
    assert_eq!(rig.app.network().mode(), NetworkMode::Native);

    let mode = rig.host.request(&Command::SetNetworkMode { polyfill: false }, TIMEOUT).await.unwrap();
    assert_eq!(mode.value, Some(json!("native")));
}

#[tokio::test]
async fn unsolicited_stream_report_is_a_notification() {
    let server = fault_server().await;
    let rig = rig().await;
    let mut notifications = rig.host.notifications();

    rig.host.request(&Command::SetNetworkMode { polyfill: true }, TIMEOUT).await.unwrap();
    rig.host
        .notify(&Command::RunStream(StreamRequest::new(server.url("/stream-xhr"), StreamPolicy::Fallback)))
        .unwrap();

    let notification = tokio::time::timeout(TIMEOUT, notifications.recv()).await.unwrap().unwrap();
    match notification {
        Notification::Stream { stream } => {
            assert_eq!(stream.policy, StreamPolicy::Fallback);
            assert_eq!(stream.mode, NetworkMode::Polyfill);
            assert!(stream.bytes > 0);
        }
        other => panic!("unexpected notification {other:?}"),
    }
}

#[tokio::test]
async fn fetch_data_reaches_the_server() {
    let server = fault_server().await;
    let rig = rig().await;

    let spec = FetchSpec {
        url: server.url("/post"),
        method: Some("post".to_string()),
        headers: Map::new(),
        body: Some(json!({"name": "Zed"})),
        multipart: None,
    };
    rig.host.notify(&Command::FetchData(spec)).unwrap();

    assert!(common::eventually(|| server.state().records.len() == 3).await);
    let zed = server.state().records.get(3).unwrap();
    assert_eq!(zed["name"], "Zed");
}
