// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]

//! Start-up behaviour of the `pairchat` binary.

use std::process::{Command, Stdio};

fn pairchat() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pairchat"));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_remove("PAIRCHAT_SERVER_URL")
        .env_remove("PAIRCHAT_API_BASE")
        .env_remove("PAIRCHAT_USER_ID")
        .env_remove("PAIRCHAT_FIRST_NAME")
        .env_remove("PAIRCHAT_TARGET");
    cmd
}

#[test]
fn unreadable_config_file_aborts_startup() {
    let missing = std::env::temp_dir().join("pairchat-missing-dir/config.toml");
    let log_file = std::env::temp_dir().join("pairchat-cli-test.log");
    let output = pairchat()
        .arg("--config")
        .arg(&missing)
        .arg("--log-file")
        .arg(&log_file)
        .args(["--server-url", "ws://127.0.0.1:9/ws"])
        .args(["--api-base", "http://127.0.0.1:9/"])
        .args(["--user-id", "u1", "--first-name", "Ada", "--target", "u2"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("cannot load configuration"),
        "unexpected stderr: {stderr}"
    );
    // Nothing was opened.
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("Chatting with"), "unexpected stdout: {stdout}");
}

#[test]
fn malformed_config_file_aborts_startup() {
    let dir = std::env::temp_dir().join(format!("pairchat-cli-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.toml");
    std::fs::write(&path, "[network\nserver_url = ").unwrap();

    let output = pairchat()
        .arg("--config")
        .arg(&path)
        .arg("--log-file")
        .arg(dir.join("pairchat.log"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot load configuration"));
    let _ = std::fs::remove_dir_all(&dir);
}
