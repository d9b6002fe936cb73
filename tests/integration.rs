use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const AUDIT_KEY: &str = "integration-audit-key";
const WIRE_FAQ: &str = "Domestic wire transfer fees are 25 dollars.";

fn helios_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_helios"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(files_dir.join("wire_fees.md"), WIRE_FAQ).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/helios.sqlite"

[embedding]
provider = "hash"
dims = 256

[audit]
signing_key_env = "HELIOS_TEST_AUDIT_KEY"

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("helios.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_helios(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = helios_binary();
    let output = Command::new(&binary)
        .env("HELIOS_TEST_AUDIT_KEY", AUDIT_KEY)
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run helios binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn run_ok(config_path: &Path, args: &[&str]) -> String {
    let (stdout, stderr, success) = run_helios(config_path, args);
    assert!(
        success,
        "{:?} failed: stdout={}, stderr={}",
        args, stdout, stderr
    );
    stdout
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("bad JSON ({}): {}", e, stdout))
}

/// Init plus one tenant, one customer and an email redaction rule.
fn seed_tenant(config_path: &Path) {
    run_ok(config_path, &["init"]);
    run_ok(config_path, &["tenant", "add", "acme", "--name", "Acme Bank"]);
    run_ok(
        config_path,
        &[
            "customer", "add", "c1", "--tenant", "acme", "--name", "Ada", "--email",
            "ada@example.com", "--tier", "premium",
        ],
    );
    run_ok(
        config_path,
        &[
            "rule",
            "add",
            "--tenant",
            "acme",
            "--name",
            "email",
            "--type",
            "email",
            "--pattern",
            r"[\w.+-]+@[\w-]+\.[\w.]+",
        ],
    );
}

fn open_session(config_path: &Path) -> String {
    let stdout = run_ok(
        config_path,
        &[
            "--actor", "customer:c1", "session", "open", "--tenant", "acme", "--customer", "c1",
        ],
    );
    json(&stdout)["id"].as_str().unwrap().to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_helios(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_helios(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_helios(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_tenant_list_shows_added_tenant() {
    let (_tmp, config_path) = setup_test_env();
    seed_tenant(&config_path);

    let stdout = run_ok(&config_path, &["tenant", "list"]);
    assert!(stdout.contains("acme"));
    assert!(stdout.contains("Acme Bank"));
}

#[test]
fn test_invalid_rule_pattern_rejected() {
    let (_tmp, config_path) = setup_test_env();
    seed_tenant(&config_path);

    let (_, _, success) = run_helios(
        &config_path,
        &[
            "rule", "add", "--tenant", "acme", "--name", "broken", "--type", "address",
            "--pattern", "(unclosed",
        ],
    );
    assert!(!success, "invalid regex should be rejected");
}

#[test]
fn test_published_answer_is_auto_replied() {
    let (tmp, config_path) = setup_test_env();
    seed_tenant(&config_path);

    let faq = tmp.path().join("files/wire_fees.md");
    let stdout = run_ok(
        &config_path,
        &[
            "--actor",
            "agent:ops",
            "knowledge",
            "publish",
            "--tenant",
            "acme",
            "--id",
            "wire-fees",
            "--name",
            "Wire fees",
            "--type",
            "faq",
            "--file",
            faq.to_str().unwrap(),
            "--tags",
            "wire,fees",
        ],
    );
    let report = json(&stdout);
    assert_eq!(report["source_id"], "wire-fees");
    assert_eq!(report["version"], 1);
    assert_eq!(report["embedded"], 1);

    let session = open_session(&config_path);
    let stdout = run_ok(
        &config_path,
        &[
            "--actor", "customer:c1", "send", "--tenant", "acme", "--session", &session, WIRE_FAQ,
        ],
    );
    let outcome = json(&stdout);
    assert_eq!(outcome["decision"]["outcome"], "auto_reply");
    assert_eq!(
        outcome["replies"][0]["citations"][0]["knowledge_source_id"],
        "wire-fees"
    );

    let stdout = run_ok(&config_path, &["audit", "verify", "--tenant", "acme"]);
    assert!(stdout.contains("audit chain ok"));
}

#[test]
fn test_escalation_assign_and_resolve() {
    let (_tmp, config_path) = setup_test_env();
    seed_tenant(&config_path);
    let session = open_session(&config_path);

    let stdout = run_ok(
        &config_path,
        &[
            "--actor",
            "customer:c1",
            "send",
            "--tenant",
            "acme",
            "--session",
            &session,
            "--key",
            "m-1",
            "Someone stole my card, write me at ada@example.com",
        ],
    );
    let outcome = json(&stdout);
    assert_eq!(outcome["decision"]["outcome"], "escalate_to_agent");
    assert_eq!(outcome["session_status"], "escalated");
    assert_eq!(outcome["ticket_created"], true);
    let content = outcome["message"]["content"].as_str().unwrap();
    assert!(!content.contains("ada@example.com"));

    // Same key replays the stored outcome.
    let stdout = run_ok(
        &config_path,
        &[
            "--actor",
            "customer:c1",
            "send",
            "--tenant",
            "acme",
            "--session",
            &session,
            "--key",
            "m-1",
            "Someone stole my card, write me at ada@example.com",
        ],
    );
    let replay = json(&stdout);
    assert_eq!(replay["replayed"], true);
    assert_eq!(replay["message"]["id"], outcome["message"]["id"]);

    let stdout = run_ok(
        &config_path,
        &[
            "--actor",
            "agent:u1",
            "action",
            "--tenant",
            "acme",
            "--session",
            &session,
            r#"{"action":"assign","agent_id":"u1"}"#,
        ],
    );
    let assigned = json(&stdout);
    assert_eq!(assigned["session"]["agent_id"], "u1");
    assert_eq!(assigned["ticket"]["status"], "in_progress");

    let stdout = run_ok(
        &config_path,
        &[
            "--actor",
            "agent:u1",
            "action",
            "--tenant",
            "acme",
            "--session",
            &session,
            r#"{"action":"resolve"}"#,
        ],
    );
    assert_eq!(json(&stdout)["ticket"]["status"], "resolved");

    let stdout = run_ok(&config_path, &["audit", "list", "--tenant", "acme"]);
    let trail = json(&stdout);
    let events: Vec<&str> = trail
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["event_type"].as_str().unwrap())
        .collect();
    assert!(events.contains(&"redaction"));
    assert!(events.contains(&"ticket_opened"));
    assert!(events.contains(&"agent_assigned"));

    let stdout = run_ok(&config_path, &["audit", "verify", "--tenant", "acme"]);
    assert!(stdout.contains("audit chain ok"));
}

#[test]
fn test_illegal_action_fails() {
    let (_tmp, config_path) = setup_test_env();
    seed_tenant(&config_path);
    let session = open_session(&config_path);

    run_ok(
        &config_path,
        &[
            "action", "--tenant", "acme", "--session", &session, r#"{"action":"end"}"#,
        ],
    );
    let (_, stderr, success) = run_helios(
        &config_path,
        &[
            "action", "--tenant", "acme", "--session", &session, r#"{"action":"wait"}"#,
        ],
    );
    assert!(!success);
    assert!(stderr.contains("transition"), "stderr={}", stderr);
}

#[test]
fn test_sweep_with_no_idle_sessions() {
    let (_tmp, config_path) = setup_test_env();
    seed_tenant(&config_path);
    open_session(&config_path);

    let stdout = run_ok(&config_path, &["sweep"]);
    assert!(stdout.contains("ended 0 idle sessions"));
}
