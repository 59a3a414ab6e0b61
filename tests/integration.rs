use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use clause_haus::config::load_config;
use clause_haus::models::{InputItem, Job, JobStatus};
use clause_haus::store::{SqliteStore, Store};
use clause_haus::{db, migrate};

fn clause_haus_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("clause-haus");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/clause.sqlite"

[embedding]
provider = "disabled"

[chat]
provider = "disabled"

[ocr]
provider = "local"

[server]
bind = "127.0.0.1:7341"
"#,
        root.display()
    );

    let config_path = config_dir.join("clause-haus.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cli(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = clause_haus_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run clause-haus binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cli(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/clause.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_cli(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cli(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        "[db]\npath = \"x.sqlite\"\n[chunking]\nmin_chars = 3000\nmax_chars = 2000\n",
    )
    .unwrap();

    let (_, stderr, success) = run_cli(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("min_chars"), "stderr={}", stderr);
}

#[test]
fn test_status_rejects_malformed_id() {
    let (_tmp, config_path) = setup_test_env();
    run_cli(&config_path, &["init"]);

    let (_, stderr, success) = run_cli(&config_path, &["status", "not-a-uuid"]);
    assert!(!success);
    assert!(stderr.contains("invalid job id"), "stderr={}", stderr);
}

#[test]
fn test_status_unknown_job() {
    let (_tmp, config_path) = setup_test_env();
    run_cli(&config_path, &["init"]);

    let (_, stderr, success) = run_cli(
        &config_path,
        &["status", "8b1f6a52-2f0e-4c3a-9d55-6c1b0a7e4f10"],
    );
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr={}", stderr);
}

#[tokio::test]
async fn test_status_prints_stored_job() {
    let (_tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    let store = SqliteStore::new(pool);

    let mut job = Job::new(
        None,
        vec![InputItem::new("document", "https://example.com/lease.pdf")],
        JobStatus::Running,
    );
    job.fail("no text extracted from PDF".to_string());
    store.insert_job(&job).await.unwrap();
    store.pool().close().await;

    let (stdout, stderr, success) = run_cli(&config_path, &["status", &job.id.to_string()]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("status:  failed"));
    assert!(stdout.contains("no text extracted from PDF"));
}

#[test]
fn test_corpus_load_requires_embeddings() {
    let (tmp, config_path) = setup_test_env();
    let corpus = tmp.path().join("sections.json");
    fs::write(&corpus, r#"[{"number": "535", "title": "Mietvertrag"}]"#).unwrap();

    let (_, stderr, success) = run_cli(
        &config_path,
        &["corpus", "load", corpus.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("disabled"), "stderr={}", stderr);
}
