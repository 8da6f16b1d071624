// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Integration tests for the camhal CLI
//!
//! These tests run the binary end-to-end using the assert_cmd crate
//! pattern. Simulations run on virtual hardware with a short frame interval
//! so no camera is required.

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::env;

/// Helper to create a Command for the camhal binary
/// Uses CAMHAL_BIN environment variable if set, otherwise the cargo-built binary
fn camhal_cmd() -> Command {
    if let Ok(bin_path) = env::var("CAMHAL_BIN") {
        Command::new(bin_path)
    } else {
        Command::cargo_bin("camhal").expect("camhal binary not built")
    }
}

fn run_json(args: &[&str]) -> serde_json::Value {
    let output = camhal_cmd()
        .args(args)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("stdout is not JSON")
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

#[test]
fn test_cli_help() {
    camhal_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("camhal CLI"))
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("info"));
}

#[test]
fn test_cli_version() {
    camhal_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("camhal"));
}

#[test]
fn test_simulate_help() {
    camhal_cmd()
        .arg("simulate")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("virtual hardware"))
        .stdout(predicate::str::contains("--requests"))
        .stdout(predicate::str::contains("--capture-every"))
        .stdout(predicate::str::contains("--af-mode"))
        .stdout(predicate::str::contains("--interval-us"));
}

#[test]
fn test_info_help() {
    camhal_cmd()
        .arg("info")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Display"))
        .stdout(predicate::str::contains("capabilities"));
}

// =============================================================================
// Info Command Tests
// =============================================================================

#[test]
fn test_info_basic() {
    camhal_cmd()
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Session defaults"))
        .stdout(predicate::str::contains("Camera 'back'"))
        .stdout(predicate::str::contains("Camera 'front'"))
        .stdout(predicate::str::contains("3264x2448"));
}

#[test]
fn test_info_json_output() {
    let info = run_json(&["info", "--camera", "front"]);
    assert_eq!(info["session"]["request_capacity"], 5);
    assert_eq!(info["cameras"].as_array().map(Vec::len), Some(1));
    assert_eq!(info["cameras"][0]["name"], "front");
    assert_eq!(info["cameras"][0]["flash"], false);
}

#[test]
fn test_info_unknown_camera() {
    camhal_cmd()
        .args(["info", "--camera", "side"])
        .assert()
        .failure()
        .code(2); // InvalidArgs
}

// =============================================================================
// Simulate Command Tests
// =============================================================================

#[test]
#[serial]
fn test_simulate_preview_json() {
    let metrics = run_json(&["simulate", "--requests", "20", "--interval-us", "1000"]);
    assert_eq!(metrics["requests"], 20);
    assert_eq!(metrics["results"], 20);
    assert_eq!(metrics["in_order"], true);
    assert!(metrics["bubbles"].as_u64().unwrap_or(0) > 0);
}

#[test]
#[serial]
fn test_simulate_text_metrics() {
    camhal_cmd()
        .args([
            "simulate",
            "--requests",
            "12",
            "--interval-us",
            "1000",
            "--af-mode",
            "auto",
            "--metrics",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Session Metrics"))
        .stdout(predicate::str::contains("in order"));
}

#[test]
#[serial]
fn test_simulate_still_captures() {
    let metrics = run_json(&[
        "simulate",
        "--requests",
        "30",
        "--capture-every",
        "10",
        "--interval-us",
        "1000",
    ]);
    assert_eq!(metrics["results"], 30);
    assert_eq!(metrics["in_order"], true);
    assert!(metrics["still_captures"].as_u64().unwrap_or(0) <= 3);
}

#[test]
#[serial]
fn test_simulate_flash_still_captures() {
    let metrics = run_json(&[
        "simulate",
        "--requests",
        "24",
        "--capture-every",
        "10",
        "--flash",
        "--interval-us",
        "1000",
    ]);
    assert_eq!(metrics["results"], 24);
    assert_eq!(metrics["in_order"], true);
    assert!(metrics["ae_notifications"].as_u64().unwrap_or(0) > 0);
}

#[test]
#[serial]
fn test_simulate_front_camera() {
    let metrics = run_json(&[
        "simulate",
        "--camera",
        "front",
        "--resolution",
        "640x480",
        "--requests",
        "10",
        "--interval-us",
        "1000",
    ]);
    assert_eq!(metrics["results"], 10);
    assert_eq!(metrics["af_notifications"], 0);
}

#[test]
fn test_simulate_invalid_resolution() {
    camhal_cmd()
        .args(["simulate", "--resolution", "wide"])
        .assert()
        .failure()
        .code(2); // InvalidArgs
}

#[test]
fn test_simulate_unsupported_resolution() {
    camhal_cmd()
        .args(["simulate", "--resolution", "1000x1000", "--interval-us", "1000"])
        .assert()
        .failure()
        .code(3); // UnsupportedStream
}

#[test]
fn test_simulate_invalid_af_mode() {
    camhal_cmd()
        .args(["simulate", "--af-mode", "edof"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Unknown AF mode"));
}

#[test]
fn test_simulate_flash_needs_capture_interval() {
    camhal_cmd()
        .args(["simulate", "--flash", "--capture-every", "3"])
        .assert()
        .failure()
        .code(2);
}
