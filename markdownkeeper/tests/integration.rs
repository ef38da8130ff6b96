//! End-to-end CLI scenarios, spawning the `mdk` binary against a throwaway
//! database and a small fixture tree, in the style of the teacher's
//! `tests/integration.rs`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn mdk_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mdk");
    path
}

/// Lays out `<root>/files/`, `<root>/data/`, and an `mdk.toml` pointing at
/// them, with the embedding backend pinned to the deterministic hash
/// fallback so tests never reach out to a model download.
fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();

    let config_content = format!(
        r#"[watch]
roots = ["{files}"]

[storage]
database_path = "{db}"

[embeddings]
backend = "hash-v1"
"#,
        files = files_dir.display(),
        db = root.join("data").join("mdk.sqlite").display(),
    );

    let config_path = root.join("mdk.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, files_dir)
}

fn run_mdk(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mdk_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run mdk binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn scan_file_json(config_path: &Path, path: &Path) -> Value {
    let (stdout, stderr, success) =
        run_mdk(config_path, &["--format", "json", "scan-file", path.to_str().unwrap()]);
    assert!(success, "scan-file failed: stdout={stdout}, stderr={stderr}");
    serde_json::from_str(&stdout).expect("scan-file did not emit JSON")
}

#[test]
fn s1_index_and_query_ranks_the_matching_document_first() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    run_mdk(&config_path, &["init-db"]);

    fs::write(files_dir.join("a.md"), "# Alpha\nkubernetes deployment guide").unwrap();
    scan_file_json(&config_path, &files_dir.join("a.md"));

    fs::write(
        files_dir.join("b.md"),
        "# Beta\nan unrelated note about gardening and houseplants",
    )
    .unwrap();
    scan_file_json(&config_path, &files_dir.join("b.md"));

    let (stdout, stderr, success) =
        run_mdk(&config_path, &["--format", "json", "query", "kubernetes"]);
    assert!(success, "query failed: stdout={stdout}, stderr={stderr}");

    let body: Value = serde_json::from_str(&stdout).expect("query did not emit JSON");
    let documents = body["documents"].as_array().expect("documents array");
    assert!(!documents.is_empty(), "expected at least one result, got: {stdout}");
    assert!(
        documents[0]["path"].as_str().unwrap().ends_with("a.md"),
        "expected a.md ranked first, got: {stdout}"
    );
}

#[test]
fn s2_get_doc_section_filter_returns_only_the_requested_section() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    run_mdk(&config_path, &["init-db"]);

    let content = "# Guide\n\n## Prerequisites\n\nYou need Rust installed on your machine.\n\n## Steps\n\nFirst run cargo build. Then run cargo test.\n";
    fs::write(files_dir.join("guide.md"), content).unwrap();
    let scanned = scan_file_json(&config_path, &files_dir.join("guide.md"));
    let document_id = scanned["document_id"].as_i64().unwrap();

    let (stdout, stderr, success) = run_mdk(
        &config_path,
        &[
            "--format",
            "json",
            "get-doc",
            &document_id.to_string(),
            "--include-content",
            "--section",
            "Steps",
        ],
    );
    assert!(success, "get-doc failed: stdout={stdout}, stderr={stderr}");

    let body: Value = serde_json::from_str(&stdout).expect("get-doc did not emit JSON");
    let documents = body["documents"].as_array().expect("documents array");
    let chunks = documents[0]["chunks"].as_array().expect("chunks array");
    assert!(!chunks.is_empty(), "expected at least one Steps chunk, got: {stdout}");
    for chunk in chunks {
        let heading_path = chunk["heading_path"].as_str().unwrap();
        assert!(
            heading_path.to_lowercase().contains("steps"),
            "unexpected chunk outside Steps: {heading_path}"
        );
        let body_text = chunk["content"].as_str().unwrap();
        assert!(!body_text.contains("Rust installed"), "Prerequisites content leaked into Steps filter");
    }
}

#[test]
fn s3_broken_link_marks_status_and_exits_nonzero() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    run_mdk(&config_path, &["init-db"]);

    fs::write(files_dir.join("linker.md"), "# Linker\n\nSee [x](./nope.md) for details.").unwrap();
    scan_file_json(&config_path, &files_dir.join("linker.md"));

    let (stdout, stderr, success) = run_mdk(&config_path, &["--format", "json", "check-links"]);
    assert!(!success, "check-links should exit nonzero when a broken link is found");

    let body: Value = serde_json::from_str(&stdout).expect("check-links did not emit JSON");
    assert_eq!(
        body["broken_links"].as_u64(),
        Some(1),
        "expected exactly one broken link, got: {stdout} (stderr: {stderr})"
    );
}

#[test]
fn s4_identical_query_within_ttl_is_served_from_cache() {
    let (_tmp, config_path, files_dir) = setup_test_env();
    run_mdk(&config_path, &["init-db"]);

    fs::write(files_dir.join("a.md"), "# Alpha\nkubernetes deployment guide").unwrap();
    scan_file_json(&config_path, &files_dir.join("a.md"));

    let (first, _, success1) = run_mdk(&config_path, &["--format", "json", "query", "kubernetes"]);
    assert!(success1);
    let first_body: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(first_body["cache_hit"].as_bool(), Some(false), "first query should miss the cache");

    let (second, _, success2) = run_mdk(&config_path, &["--format", "json", "query", "kubernetes"]);
    assert!(success2);
    let second_body: Value = serde_json::from_str(&second).unwrap();
    assert_eq!(second_body["cache_hit"].as_bool(), Some(true), "second identical query should hit the cache");

    assert_eq!(
        first_body["documents"], second_body["documents"],
        "cache hit should return the same document id sequence"
    );
}
