use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn scout_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("scout");
    path
}

fn run_scout(args: &[&str]) -> (String, String, bool) {
    let binary = scout_binary();
    let output = Command::new(&binary)
        .args(args)
        .env_remove("REPO_ROOT")
        .env_remove("SCAN_ALLOW_EXTS")
        .env_remove("SCAN_IGNORE_DIRS")
        .env_remove("CHUNK_LINES")
        .env_remove("CHUNK_OVERLAP_LINES")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run scout binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn setup_repo() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("node_modules")).unwrap();
    fs::write(root.join("src/main.ts"), "const ok = true;\nexport {};\n").unwrap();
    fs::write(root.join("src/.secret"), "hidden\n").unwrap();
    fs::write(root.join("src/logo.png"), b"\x89PNG\x00\x01\x02").unwrap();
    fs::write(root.join("node_modules/x.ts"), "export {};\n").unwrap();
    tmp
}

#[test]
fn test_scan_outputs_json_payload() {
    let repo = setup_repo();

    let (stdout, stderr, success) = run_scout(&[
        "scan",
        "--repo-root",
        repo.path().to_str().unwrap(),
        "--allow-exts",
        ".ts",
        "--ignore-dirs",
        "node_modules",
    ]);
    assert!(success, "scan failed: {stderr}");

    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(payload.get("repoRoot").is_some());
    assert!(payload.get("ignoreDirs").is_some());
    assert!(payload.get("allowExts").is_some());
    assert!(payload.get("stats").is_some());
    assert_eq!(payload["files"], serde_json::json!(["src/main.ts"]));
    assert!(payload["stats"]["files_ignored_binary"].as_u64().unwrap() >= 1);
    assert!(payload["stats"]["dirs_ignored"].as_u64().unwrap() >= 1);
}

#[test]
fn test_scan_invalid_repo_root_exits_nonzero() {
    let (_, stderr, success) = run_scout(&[
        "scan",
        "--repo-root",
        "/tmp/scout-scan-invalid-root-does-not-exist",
    ]);
    assert!(!success);
    assert!(stderr.contains("repo root does not exist"));
}

#[test]
fn test_chunk_outputs_windows_with_identity() {
    let repo = TempDir::new().unwrap();
    let file = repo.path().join("seven.ts");
    let content = (1..=7)
        .map(|i| format!("line {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&file, content).unwrap();

    let (stdout, stderr, success) = run_scout(&[
        "chunk",
        "--file",
        file.to_str().unwrap(),
        "--repo-root",
        repo.path().to_str().unwrap(),
        "--chunk-lines",
        "4",
        "--overlap-lines",
        "1",
    ]);
    assert!(success, "chunk failed: {stderr}");

    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["path"], "seven.ts");
    assert_eq!(payload["pathIsRelative"], true);
    assert_eq!(payload["totalLines"], 7);
    assert_eq!(payload["encoding"], "utf-8");
    assert_eq!(payload["stats"]["chunks"], 2);

    let chunks = payload["chunks"].as_array().unwrap();
    assert_eq!(chunks[0]["startLine"], 1);
    assert_eq!(chunks[0]["endLine"], 4);
    assert_eq!(chunks[1]["startLine"], 4);
    assert_eq!(chunks[1]["endLine"], 7);
    assert_eq!(chunks[0]["language"], "typescript");
    assert!(chunks[0]["chunkId"].as_str().unwrap().len() == 64);
    assert_eq!(chunks[0]["contentHash"], chunks[1]["contentHash"]);
}

#[test]
fn test_chunk_rejects_overlap_not_smaller_than_window() {
    let repo = TempDir::new().unwrap();
    let file = repo.path().join("a.ts");
    fs::write(&file, "one\ntwo\n").unwrap();

    let (_, stderr, success) = run_scout(&[
        "chunk",
        "--file",
        file.to_str().unwrap(),
        "--repo-root",
        repo.path().to_str().unwrap(),
        "--chunk-lines",
        "4",
        "--overlap-lines",
        "4",
    ]);
    assert!(!success);
    assert!(stderr.contains("overlap"));
}

#[test]
fn test_chunk_missing_file_exits_nonzero() {
    let repo = TempDir::new().unwrap();
    let missing = repo.path().join("missing.ts");

    let (_, stderr, success) = run_scout(&[
        "chunk",
        "--file",
        missing.to_str().unwrap(),
        "--repo-root",
        repo.path().to_str().unwrap(),
    ]);
    assert!(!success);
    assert!(stderr.contains("Error"));
}

#[test]
fn test_chunk_non_integer_config_exits_nonzero() {
    let repo = TempDir::new().unwrap();
    let file = repo.path().join("a.ts");
    fs::write(&file, "one\n").unwrap();

    let output = Command::new(scout_binary())
        .args(["chunk", "--file", file.to_str().unwrap()])
        .env("CHUNK_LINES", "not-a-number")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("CHUNK_LINES"), "stderr: {stderr}");
}

#[test]
fn test_scan_respects_env_repo_root() {
    let repo = setup_repo();

    let output = Command::new(scout_binary())
        .args(["scan", "--allow-exts", ".ts", "--ignore-dirs", "node_modules"])
        .env("REPO_ROOT", repo.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let payload: serde_json::Value =
        serde_json::from_str(&String::from_utf8_lossy(&output.stdout)).unwrap();
    let reported = Path::new(payload["repoRoot"].as_str().unwrap()).to_path_buf();
    assert_eq!(
        reported.file_name(),
        repo.path().canonicalize().unwrap().file_name()
    );
    assert_eq!(payload["files"], serde_json::json!(["src/main.ts"]));
}
