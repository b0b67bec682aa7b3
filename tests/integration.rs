use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ctx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ctx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ctx.sqlite"

[server]
bind = "127.0.0.1:7331"

[gateway]
bind = "127.0.0.1:7332"
backend_url = "http://127.0.0.1:7331"

[lexical_index]
path = "{}/data/lexical-index"
"#,
        root.display(),
        root.display(),
    );

    let config_path = config_dir.join("ctx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ctx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ctx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn sample_chunks_jsonl() -> String {
    let lines = [
        r#"{"chunk_id":"COURSE-1","chunk_type":"course","title":"Databases and SQL","text":"An introduction to relational databases and SQL.","metadata":{},"created_at":0}"#,
        r#"{"chunk_id":"TOPIC-11","chunk_type":"topic","title":"Normalization","text":"Normal forms and functional dependencies.","metadata":{"course_chunk_id":"COURSE-1"},"created_at":0}"#,
        r#"{"chunk_id":"CLASS-101","chunk_type":"class","title":"Lecture 1","text":"Introduces normal forms.","metadata":{"course_chunk_id":"COURSE-1","learned_at":"2025-01-10"},"created_at":0}"#,
    ];
    lines.join("\n") + "\n"
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ctx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ctx(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ctx(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_jsonl_loads_chunks() {
    let (tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let jsonl_path = tmp.path().join("chunks.jsonl");
    fs::write(&jsonl_path, sample_chunks_jsonl()).unwrap();

    let (stdout, stderr, success) = run_ctx(&config_path, &["ingest", jsonl_path.to_str().unwrap(), "--progress", "off"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Ingested 3 chunks"));
}

#[test]
fn test_ingest_idempotent_no_duplicates() {
    let (tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let jsonl_path = tmp.path().join("chunks.jsonl");
    fs::write(&jsonl_path, sample_chunks_jsonl()).unwrap();

    run_ctx(&config_path, &["ingest", jsonl_path.to_str().unwrap(), "--progress", "off"]);
    let (stdout, _, success) = run_ctx(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Chunks:      3"));

    // Re-ingesting the same file should upsert, not duplicate.
    run_ctx(&config_path, &["ingest", jsonl_path.to_str().unwrap(), "--progress", "off"]);
    let (stdout2, _, _) = run_ctx(&config_path, &["stats"]);
    assert!(stdout2.contains("Chunks:      3"));
}

#[test]
fn test_ingest_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let (_, stderr, success) = run_ctx(&config_path, &["ingest", "/nonexistent/chunks.jsonl"]);
    assert!(!success, "ingest of a missing file should fail");
    assert!(!stderr.is_empty());
}

#[test]
fn test_stats_reports_counts_after_ingest() {
    let (tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let jsonl_path = tmp.path().join("chunks.jsonl");
    fs::write(&jsonl_path, sample_chunks_jsonl()).unwrap();
    run_ctx(&config_path, &["ingest", jsonl_path.to_str().unwrap(), "--progress", "off"]);

    let (stdout, stderr, success) = run_ctx(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Chunks:      3"));
    assert!(stdout.contains("Lexical index: 3 documents"));
}

#[test]
fn test_stats_degrades_when_dense_index_unreachable() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let (stdout, _, success) = run_ctx(&config_path, &["stats"]);
    assert!(success, "stats should not fail when Qdrant is unreachable");
    assert!(stdout.contains("Dense index: unreachable") || stdout.contains("Dense index:"));
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let (stdout, _, success) = run_ctx(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Chunks:      0"));
}

#[test]
fn test_missing_config_file_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("missing.toml");

    let (_, stderr, success) = run_ctx(&config_path, &["init"]);
    assert!(!success, "init with a missing config file should fail");
    assert!(!stderr.is_empty());
}

#[test]
fn test_invalid_mmr_lambda_rejected_at_load() {
    let (tmp, _config_path) = setup_test_env();
    let bad_config_path = tmp.path().join("config").join("bad.toml");
    fs::write(
        &bad_config_path,
        format!(
            r#"[db]
path = "{}/data/ctx.sqlite"
[server]
bind = "127.0.0.1:7331"
[retrieval]
mmr_lambda = 4.0
"#,
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_ctx(&bad_config_path, &["init"]);
    assert!(!success, "config with an out-of-range mmr_lambda should be rejected");
    assert!(!stderr.is_empty());
}
