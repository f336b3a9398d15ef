use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;

const CONFIG: &str = r#"{
    "fanout_timeout_ms": 300,
    "servers": [
        {
            "id": "qute",
            "name": "Qute",
            "description": "Qute templates",
            "command": ["qute-ls", "--stdio"],
            "selector": { "patterns": ["*.html"] }
        },
        {
            "id": "jdt",
            "java": { "jar": "/opt/jdt/server.jar", "debug_port": 1044 },
            "selector": { "languages": ["java"] }
        }
    ]
}"#;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("hub.json");
    std::fs::write(&path, CONFIG).unwrap();
    path
}

#[test]
fn test_java_command_with_debugging() {
    cargo_bin_cmd!("lsph")
        .args(["java-command", "--jar", "/x.jar", "--debug-port", "5005", "--debug-suspend"])
        .assert()
        .success()
        .stdout("java\n-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address=5005\n-jar\n/x.jar\n");
}

#[test]
fn test_java_command_json() {
    let output = cargo_bin_cmd!("lsph")
        .args(["--format", "json", "java-command", "--cp", "lib/*", "--jar", "s.jar", "--", "-data", "/ws"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let argv: Vec<String> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(argv, vec!["java", "-cp", "lib/*", "-jar", "s.jar", "-data", "/ws"]);
}

#[test]
fn test_debug_suspend_requires_port() {
    cargo_bin_cmd!("lsph")
        .args(["java-command", "--jar", "/x.jar", "--debug-suspend"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--debug-port"));
}

#[test]
fn test_servers_lists_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cargo_bin_cmd!("lsph")
        .arg("--workspace")
        .arg(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("servers")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 language server(s)"))
        .stdout(predicate::str::contains("Qute (qute)"))
        .stdout(predicate::str::contains("command: qute-ls --stdio"))
        .stdout(predicate::str::contains("-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=1044"));
}

#[test]
fn test_servers_discovers_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".lsp-hub.json"), CONFIG).unwrap();
    let nested = dir.path().join("src");
    std::fs::create_dir(&nested).unwrap();

    let output = cargo_bin_cmd!("lsph")
        .env_remove("LSP_HUB_CONFIG")
        .arg("--workspace")
        .arg(&nested)
        .args(["--format", "json", "servers"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let servers: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(servers[0]["id"], "qute");
    assert_eq!(servers[1]["selector"]["languages"][0], "java");
}

#[test]
fn test_servers_without_configuration() {
    let dir = tempfile::tempdir().unwrap();
    cargo_bin_cmd!("lsph")
        .env_remove("LSP_HUB_CONFIG")
        .arg("--workspace")
        .arg(dir.path())
        .arg("servers")
        .assert()
        .success()
        .stdout(predicate::str::contains("No language servers configured"));
}

#[test]
fn test_invalid_configuration_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{ "servers": [{ "id": "", "command": ["x"], "selector": { "patterns": ["*"] } }] }"#)
        .unwrap();

    cargo_bin_cmd!("lsph")
        .arg("--workspace")
        .arg(dir.path())
        .arg("--config")
        .arg(&path)
        .arg("servers")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load"));
}

#[test]
fn test_request_without_matching_server() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

    cargo_bin_cmd!("lsph")
        .arg("--workspace")
        .arg(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["request", "notes.txt", "-m", "textDocument/codeLens"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No contributions for: textDocument/codeLens notes.txt"));
}

#[test]
fn test_request_rejects_bad_params() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cargo_bin_cmd!("lsph")
        .arg("--workspace")
        .arg(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["request", "notes.txt", "-m", "textDocument/hover", "-p", "[1, 2]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--params must be a JSON object"));
}

#[cfg(unix)]
#[test]
fn test_request_reports_failed_server() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.json");
    std::fs::write(
        &path,
        r#"{ "servers": [{ "id": "broken", "command": ["false"], "selector": { "patterns": ["*.txt"] } }] }"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

    cargo_bin_cmd!("lsph")
        .arg("--workspace")
        .arg(dir.path())
        .arg("--config")
        .arg(&path)
        .args(["--format", "json", "request", "notes.txt", "-m", "textDocument/codeLens"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"matched\": 0"));
}
