//! Integration tests for CLI argument handling
//!
//! Runs the built binary for flag handling and config errors, and parses
//! arguments in-process for the rest.

use std::process::Command;
use tempfile::TempDir;

/// Helper to run the CLI with given args and capture output
fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_lendsync"))
        .args(args)
        .output()
        .expect("Failed to execute lendsync")
}

#[test]
fn test_help_flag_exits_successfully() {
    let output = run_cli(&["--help"]);
    assert!(
        output.status.success(),
        "Expected --help to exit successfully"
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("lendsync"), "Help should mention lendsync");
    assert!(stdout.contains("--endpoint"), "Help should mention --endpoint");
    assert!(stdout.contains("--wallet"), "Help should mention --wallet");
}

#[test]
fn test_unknown_flag_is_rejected() {
    let output = run_cli(&["--frobnicate"]);
    assert!(!output.status.success());
}

#[test]
fn test_invalid_config_prints_error_and_exits() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("config.json");
    std::fs::write(&path, r#"{"endpoints": []}"#).expect("Failed to write config");

    let output = run_cli(&["--config", path.to_str().expect("utf-8 path"), "--once"]);

    assert!(!output.status.success(), "Expected empty endpoint list to fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("endpoint"),
        "Should explain the missing endpoints: {}",
        stderr
    );
}

#[test]
fn test_once_with_unreachable_endpoint_reports_degraded_connection() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("missing.json");

    let output = run_cli(&[
        "--config",
        path.to_str().expect("utf-8 path"),
        "--endpoint",
        "http://127.0.0.1:1",
        "--once",
    ]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("degraded"), "stdout: {}", stdout);
    assert!(stdout.contains("unreachable"), "stdout: {}", stdout);
}

#[cfg(test)]
mod unit_tests {
    //! Unit tests for CLI parsing that don't require running the binary

    use clap::Parser;
    use lendsync::cli::Cli;

    #[test]
    fn test_cli_no_args() {
        let cli = Cli::parse_from(["lendsync"]);
        assert!(cli.config.is_none());
        assert!(cli.endpoints.is_empty());
        assert!(cli.wallet.is_none());
        assert!(!cli.once);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_endpoint_flag_is_repeatable() {
        let cli = Cli::parse_from([
            "lendsync",
            "--endpoint",
            "http://primary",
            "--endpoint",
            "http://fallback",
        ]);
        assert_eq!(cli.endpoints, vec!["http://primary", "http://fallback"]);
    }

    #[test]
    fn test_cli_short_verbose() {
        let cli = Cli::parse_from(["lendsync", "-v", "--once"]);
        assert!(cli.verbose);
        assert!(cli.once);
    }

    #[test]
    fn test_cli_wallet() {
        let cli = Cli::parse_from(["lendsync", "--wallet", "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin"]);
        assert_eq!(
            cli.identity().map(|id| id.as_str().to_string()),
            Some("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin".to_string())
        );
    }
}
