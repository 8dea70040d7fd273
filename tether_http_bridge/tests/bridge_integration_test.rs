//! End-to-end tests driving the compiled bridge binary over real HTTP
//! against a mock stdio subprocess.

use reqwest::Client;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A mock subprocess that answers every request with `"result": "pong"`.
const RESPONDER_SCRIPT: &str = r#"import sys
import json

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue

    try:
        msg = json.loads(line)
    except Exception:
        continue

    if not isinstance(msg, dict) or "id" not in msg:
        continue

    print(json.dumps({"jsonrpc": "2.0", "id": msg["id"], "result": "pong"}))
    sys.stdout.flush()
"#;

/// A mock subprocess that buffers two requests and answers them in
/// reverse order.
const REVERSING_SCRIPT: &str = r#"import sys
import json

pending = []
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    if not isinstance(msg, dict) or "id" not in msg:
        continue
    pending.append(msg["id"])
    if len(pending) == 2:
        for rid in reversed(pending):
            print(json.dumps({"jsonrpc": "2.0", "id": rid, "result": "r%s" % rid}))
        sys.stdout.flush()
        pending = []
"#;

/// A running bridge instance bound to a dynamic port.
struct TestBridge {
    child: Child,
    port: u16,
    _temp_dir: TempDir,
}

impl TestBridge {
    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for TestBridge {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn the bridge binary with a mock subprocess command and wait for it
/// to report its bound port on stderr.
fn spawn_bridge(
    temp_dir: TempDir,
    command: &str,
    command_args: &[&str],
    bridge_args: &[&str],
) -> TestBridge {
    let mut invocation = Command::new(env!("CARGO_BIN_EXE_tether_http_bridge"));
    invocation
        .arg("--bind-addr")
        .arg("127.0.0.1:0")
        .arg("--command")
        .arg(command);
    for arg in command_args {
        invocation.arg("--arg").arg(arg);
    }
    invocation.args(bridge_args);

    let mut child = invocation
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("bridge binary should spawn");

    let stderr = child.stderr.take().expect("stderr should be piped");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Some(port) = line.strip_prefix("TETHER_BOUND_PORT=") {
                let _ = tx.send(port.trim().parse::<u16>().expect("port should parse"));
            }
            // Keep draining so the bridge never blocks on a full pipe.
        }
    });

    let port = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("bridge should report its bound port");

    TestBridge {
        child,
        port,
        _temp_dir: temp_dir,
    }
}

/// Spawn the bridge against a python mock script.
fn spawn_python_bridge(script: &str, bridge_args: &[&str]) -> TestBridge {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let script_path = temp_dir.path().join("mock_service.py");
    std::fs::write(&script_path, script).expect("Failed to write mock service script");
    let script_path = script_path.to_string_lossy().to_string();

    spawn_bridge(temp_dir, "python3", &[script_path.as_str()], bridge_args)
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let bridge = spawn_python_bridge(RESPONDER_SCRIPT, &[]);
    let client = Client::new();

    let response = client
        .get(format!("{}/health", bridge.base_url()))
        .send()
        .await
        .expect("health request should succeed");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn single_request_round_trips() {
    let bridge = spawn_python_bridge(RESPONDER_SCRIPT, &[]);
    let client = Client::new();

    let response = client
        .post(bridge.base_url())
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"jsonrpc": "2.0", "id": 1, "result": "pong"}));
}

#[tokio::test]
async fn batch_preserves_input_order_and_omits_notifications() {
    let bridge = spawn_python_bridge(REVERSING_SCRIPT, &[]);
    let client = Client::new();

    // The mock answers id 2 before id 1; the response must keep the input
    // order, with the notification entry omitted.
    let batch = json!([
        {"jsonrpc": "2.0", "id": 1, "method": "a"},
        {"jsonrpc": "2.0", "method": "notify"},
        {"jsonrpc": "2.0", "id": 2, "method": "b"},
    ]);
    let response = client
        .post(bridge.base_url())
        .json(&batch)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!([
            {"jsonrpc": "2.0", "id": 1, "result": "r1"},
            {"jsonrpc": "2.0", "id": 2, "result": "r2"},
        ])
    );
}

#[tokio::test]
async fn notification_yields_no_content() {
    let bridge = spawn_python_bridge(RESPONDER_SCRIPT, &[]);
    let client = Client::new();

    let response = client
        .post(bridge.base_url())
        .json(&json!({"method": "notify"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    let body = response.bytes().await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn other_methods_are_rejected() {
    let bridge = spawn_python_bridge(RESPONDER_SCRIPT, &[]);
    let client = Client::new();

    let response = client.put(bridge.base_url()).send().await.unwrap();
    assert_eq!(response.status(), 405);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Method not allowed"}));
}

#[tokio::test]
async fn subprocess_exit_fails_request_before_timeout() {
    // Reads one frame, then exits without answering. The bridge is given
    // a 30 second request timeout; the failure must arrive well before
    // that.
    let bridge = spawn_bridge(
        TempDir::new().expect("Failed to create temp dir"),
        "sh",
        &["-c", "read _line; exit 7"],
        &["--request-timeout-secs", "30"],
    );
    let client = Client::new();

    let started = Instant::now();
    let response = client
        .post(bridge.base_url())
        .json(&json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert!(started.elapsed() < Duration::from_secs(10));
    let body: Value = response.json().await.unwrap();
    assert!(
        body["error"].as_str().unwrap_or_default().contains("exited"),
        "error should reference the process exit: {}",
        body
    );

    // Later sends fail fast too.
    let started = Instant::now();
    let response = client
        .post(bridge.base_url())
        .json(&json!({"jsonrpc": "2.0", "id": 6, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let bridge = spawn_python_bridge(RESPONDER_SCRIPT, &["--max-body-bytes", "1024"]);
    let client = Client::new();

    let response = client
        .post(bridge.base_url())
        .header("content-type", "application/json")
        .body(vec![b'a'; 4096])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "request body exceeds 1024 bytes"}));
}
