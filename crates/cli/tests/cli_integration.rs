//! CLI integration tests.
//!
//! Uses `assert_cmd` to spawn the `intake` binary and verify
//! exit codes, stdout content, and stderr content.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Helper: create a Command for the `intake` binary.
fn intake() -> Command {
    let mut cmd = cargo_bin_cmd!("intake");
    cmd.env("RUST_LOG", "warn");
    cmd
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    intake()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Idempotent assessment progression service",
        ));
}

#[test]
fn version_exits_0() {
    intake()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("intake"));
}

#[test]
fn serve_help_lists_env_fallbacks() {
    intake()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("INTAKE_REQUEST_TIMEOUT_MS"));
}

// ──────────────────────────────────────────────
// 2. resolve
// ──────────────────────────────────────────────

#[test]
fn resolve_manifest_uses_latest_version() {
    intake()
        .arg("resolve")
        .arg("stress")
        .arg("--funnels")
        .arg(fixture("funnels.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("stress (manifest v2, 3 steps)"))
        .stdout(predicate::str::contains("0. s0 [question] q1*, q2*, q_note"));
}

#[test]
fn resolve_legacy_graph_as_json() {
    let output = intake()
        .arg("resolve")
        .arg("sleep-legacy")
        .arg("--funnels")
        .arg(fixture("funnels.json"))
        .args(["--output", "json"])
        .output()
        .expect("run intake");
    assert!(output.status.success());

    let definition: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(definition["source"]["shape"], "legacy");
    assert_eq!(definition["source"]["funnel_id"], "f-sleep");
    assert_eq!(definition["steps"][0]["id"], "sl-intro");
    assert_eq!(definition["steps"][0]["order_index"], 0);
    assert_eq!(definition["steps"][1]["kind"], "question");
    assert_eq!(
        definition["steps"][1]["required_question_ids"],
        serde_json::json!(["sl-q-hours"])
    );
}

#[test]
fn resolve_unknown_funnel_fails() {
    intake()
        .arg("resolve")
        .arg("nope")
        .arg("--funnels")
        .arg(fixture("funnels.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("funnel-not-found"));
}

#[test]
fn resolve_unconfigured_funnel_fails() {
    intake()
        .arg("resolve")
        .arg("broken")
        .arg("--funnels")
        .arg(fixture("funnels.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("funnel-not-configured"));
}

#[test]
fn resolve_rejects_malformed_seed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("seed.json");
    std::fs::write(&path, "{ not json").unwrap();

    intake()
        .arg("resolve")
        .arg("stress")
        .arg("--funnels")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid seed file"));
}

#[test]
fn serve_rejects_half_tls_config() {
    intake()
        .args(["serve", "--tls-cert", "cert.pem"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--tls-key"));
}
