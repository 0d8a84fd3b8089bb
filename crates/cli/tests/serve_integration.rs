//! Integration tests for the `intake serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port,
//! makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Atomic port counter to avoid port conflicts between parallel tests.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 30000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Helper: start `intake serve` on the given port with the fixture funnels.
fn start_server(port: u16) -> Child {
    let fixtures = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("funnels.json");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_intake"));
    cmd.arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .arg("--funnels")
        .arg(fixtures)
        .env("RUST_LOG", "warn");
    // Redirect stdout/stderr to avoid blocking
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().expect("failed to start intake serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            return child;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    child
}

fn stop(mut child: Child) {
    child.kill().ok();
    child.wait().ok();
}

struct Reply {
    status: u16,
    headers: String,
    body: String,
}

impl Reply {
    fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("valid JSON")
    }

    fn header(&self, name: &str) -> Option<&str> {
        extract_header(&self.headers, name)
    }
}

/// Helper: make an HTTP request as `patient` (no identity headers when None).
fn http(port: u16, method: &str, path: &str, patient: Option<&str>, body: Option<&str>) -> Reply {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut header_lines = String::new();
    if let Some(patient) = patient {
        header_lines.push_str(&format!("X-Patient-Id: {}\r\nX-Role: patient\r\n", patient));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        header_lines.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\n{}Connection: close\r\n\r\n{}",
        method, path, port, header_lines, body
    );
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    let (status, headers, body) = parse_http_response_full(&response);
    Reply {
        status,
        headers,
        body,
    }
}

fn post(port: u16, path: &str, body: serde_json::Value) -> Reply {
    http(port, "POST", path, Some("patient-1"), Some(&body.to_string()))
}

/// Extract a header value from raw headers string.
fn extract_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    let name_lower = name.to_lowercase();
    for line in headers.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().to_lowercase() == name_lower {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Parse an HTTP response into (status_code, headers_string, body).
fn parse_http_response_full(response: &str) -> (u16, String, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status_line = headers.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let chunked = extract_header(&headers, "transfer-encoding") == Some("chunked");
    let body = if chunked { decode_chunked(&body) } else { body };

    (status, headers, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining.get(chunk_end + 2..).unwrap_or("");
    }

    result
}

/// Start an assessment on `stress` and return its id.
fn start_stress(port: u16) -> String {
    let reply = post(port, "/assessments", serde_json::json!({"funnel_slug": "stress"}));
    assert_eq!(reply.status, 201, "{}", reply.body);
    reply.json()["assessment_id"]
        .as_str()
        .expect("assessment_id")
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn health_needs_no_identity() {
    let port = next_port();
    let child = start_server(port);

    let reply = http(port, "GET", "/health", None, None);
    stop(child);

    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["status"], "ok");
}

#[test]
fn missing_identity_is_401() {
    let port = next_port();
    let child = start_server(port);

    let reply = http(
        port,
        "POST",
        "/assessments",
        None,
        Some(r#"{"funnel_slug":"stress"}"#),
    );
    stop(child);

    assert_eq!(reply.status, 401);
    assert_eq!(reply.json()["error"]["code"], "unauthenticated");
}

#[test]
fn start_save_validate_and_replay() {
    let port = next_port();
    let child = start_server(port);

    let id = start_stress(port);
    let answers = format!("/assessments/{}/answers", id);
    let q1 = post(
        port,
        &answers,
        serde_json::json!({"question_id": "q1", "value": 3, "mutation_id": "m1"}),
    );
    let q2 = post(
        port,
        &answers,
        serde_json::json!({"question_id": "q2", "value": "2", "mutation_id": "m1b"}),
    );
    let validate = format!("/assessments/{}/steps/s0/validate", id);
    let first = post(port, &validate, serde_json::json!({"mutation_id": "m2"}));
    let second = post(port, &validate, serde_json::json!({"mutation_id": "m2"}));
    let resume = http(port, "GET", &format!("/assessments/{}", id), Some("patient-1"), None);
    stop(child);

    assert_eq!(q1.status, 200, "{}", q1.body);
    assert_eq!(q1.json()["value"], "3");
    assert_eq!(q2.status, 200);

    assert_eq!(first.status, 200, "{}", first.body);
    assert_eq!(first.json()["is_valid"], true);
    assert_eq!(first.json()["next_step"]["id"], "s1");
    assert_eq!(first.header("idempotent-replayed"), None);

    assert_eq!(second.status, 200);
    assert_eq!(second.body, first.body);
    assert_eq!(second.header("idempotent-replayed"), Some("true"));

    assert_eq!(resume.status, 200);
    assert_eq!(resume.json()["current_step"]["id"], "s1");
}

#[test]
fn skip_and_conflict_are_409_with_distinct_codes() {
    let port = next_port();
    let child = start_server(port);

    let id = start_stress(port);
    let skip = post(
        port,
        &format!("/assessments/{}/steps/s1/validate", id),
        serde_json::json!({"mutation_id": "v1"}),
    );
    let answers = format!("/assessments/{}/answers", id);
    post(
        port,
        &answers,
        serde_json::json!({"question_id": "q1", "value": 1, "mutation_id": "m1"}),
    );
    let conflict = post(
        port,
        &answers,
        serde_json::json!({"question_id": "q1", "value": 2, "mutation_id": "m1"}),
    );
    stop(child);

    assert_eq!(skip.status, 409);
    let skip = skip.json();
    assert_eq!(skip["error"]["code"], "skip-prevented");
    assert_eq!(skip["error"]["details"]["current_step"]["id"], "s0");

    assert_eq!(conflict.status, 409);
    assert_eq!(conflict.json()["error"]["code"], "payload-conflict");
}

#[test]
fn incomplete_step_reports_missing_questions() {
    let port = next_port();
    let child = start_server(port);

    let id = start_stress(port);
    post(
        port,
        &format!("/assessments/{}/answers", id),
        serde_json::json!({"question_id": "q_note", "value": "tired", "mutation_id": "m1"}),
    );
    let reply = post(
        port,
        &format!("/assessments/{}/steps/s0/validate", id),
        serde_json::json!({"mutation_id": "v1"}),
    );
    stop(child);

    assert_eq!(reply.status, 200);
    let body = reply.json();
    assert_eq!(body["is_valid"], false);
    assert_eq!(body["missing_question_ids"], serde_json::json!(["q1", "q2"]));
}

#[test]
fn other_patients_get_403_and_bad_input_400() {
    let port = next_port();
    let child = start_server(port);

    let id = start_stress(port);
    let body = serde_json::json!({"question_id": "q1", "value": 1, "mutation_id": "m1"});
    let intruder = http(
        port,
        "POST",
        &format!("/assessments/{}/answers", id),
        Some("patient-2"),
        Some(&body.to_string()),
    );
    let missing_mutation_id = post(
        port,
        &format!("/assessments/{}/answers", id),
        serde_json::json!({"question_id": "q1", "value": 1}),
    );
    let oversized = post(
        port,
        &format!("/assessments/{}/answers", id),
        serde_json::json!({"question_id": "q1", "value": "x".repeat(17 * 1024), "mutation_id": "m2"}),
    );
    let unknown_funnel = post(port, "/assessments", serde_json::json!({"funnel_slug": "nope"}));
    let unknown_route = http(port, "GET", "/nowhere", Some("patient-1"), None);
    stop(child);

    assert_eq!(intruder.status, 403);
    assert_eq!(intruder.json()["error"]["code"], "forbidden");
    assert_eq!(missing_mutation_id.status, 400);
    assert_eq!(missing_mutation_id.json()["error"]["code"], "invalid-input");
    assert_eq!(oversized.status, 422);
    assert_eq!(oversized.json()["error"]["code"], "invalid-answer");
    assert_eq!(unknown_funnel.status, 404);
    assert_eq!(unknown_funnel.json()["error"]["code"], "funnel-not-found");
    assert_eq!(unknown_route.status, 404);
}

#[test]
fn unreadable_bodies_get_structured_errors() {
    let port = next_port();
    let child = start_server(port);

    let id = start_stress(port);
    let malformed = http(
        port,
        "POST",
        &format!("/assessments/{}/answers", id),
        Some("patient-1"),
        Some("{\"question_id\": \"q1\", "),
    );
    let no_body = http(
        port,
        "POST",
        &format!("/assessments/{}/steps/s0/validate", id),
        Some("patient-1"),
        None,
    );
    let null_value = post(
        port,
        &format!("/assessments/{}/answers", id),
        serde_json::json!({"question_id": "q1", "value": null, "mutation_id": "m1"}),
    );
    stop(child);

    assert_eq!(malformed.status, 400);
    assert_eq!(malformed.json()["error"]["code"], "invalid-input");
    assert!(malformed.json()["error"]["message"].is_string());

    // No Content-Type header at all.
    assert_eq!(no_body.status, 415);
    assert_eq!(no_body.json()["error"]["code"], "invalid-input");

    assert_eq!(null_value.status, 200);
    assert_eq!(null_value.json()["value"], "0");
}
