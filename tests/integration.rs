use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tempfile::TempDir;

fn themes_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("themes");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
url = "sqlite://{}/data/portal.sqlite"

[clustering]
threshold = 0.8
title_sample_size = 4

[embedding]
provider = "hashing"
dims = 64
max_retries = 0
"#,
        root.display()
    );

    let config_path = config_dir.join("themes.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_themes(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = themes_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("TEST_MODE")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run themes binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

async fn seed_opinions(tmp: &TempDir, texts: &[&str]) {
    let url = format!("sqlite://{}/data/portal.sqlite", tmp.path().display());
    let pool = SqlitePool::connect_with(SqliteConnectOptions::from_str(&url).unwrap())
        .await
        .unwrap();
    for (i, text) in texts.iter().enumerate() {
        sqlx::query("INSERT INTO opinions (text, created_at) VALUES (?, ?)")
            .bind(*text)
            .bind(1_700_000_000 + i as i64)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_themes(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/portal.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_themes(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_themes(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_test_mode_without_config_file() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (stdout, stderr, success) = run_themes(&missing, &["run", "--test-mode"]);
    assert!(success, "test-mode run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("opinions processed: 12"));
    assert!(stdout.contains("not persisted (test mode)"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_test_mode_with_fixture_file() {
    let tmp = TempDir::new().unwrap();
    let fixture = tmp.path().join("fixture.toml");
    fs::write(
        &fixture,
        r#"
[[opinions]]
id = 1
text = "Quieter night buses on Harbor Road"
created_at = 10

[[opinions]]
id = 2
text = "Quieter night buses on Harbor Road"
created_at = 20
"#,
    )
    .unwrap();
    let missing = tmp.path().join("nope.toml");

    let (stdout, stderr, success) = run_themes(
        &missing,
        &["run", "--test-mode", "--fixture", fixture.to_str().unwrap()],
    );
    assert!(success, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("new clusters: 1"));
    assert!(stdout.contains("<- opinions [1, 2]"));
}

#[test]
fn test_live_run_without_db_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("themes.toml");
    fs::write(
        &config_path,
        "[clustering]\nthreshold = 0.8\n\n[embedding]\nprovider = \"hashing\"\ndims = 64\n",
    )
    .unwrap();

    let (_, stderr, success) = run_themes(&config_path, &["run"]);
    assert!(!success, "live run without [db] should fail");
    assert!(stderr.contains("[db].url"), "stderr={}", stderr);
}

#[test]
fn test_openai_without_key_fails() {
    let (tmp, _) = setup_test_env();
    let config_path = tmp.path().join("openai.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\nurl = \"sqlite://{}/data/portal.sqlite\"\n\n[clustering]\nthreshold = 0.8\n\n\
             [embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let output = Command::new(themes_binary())
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .env_remove("OPENAI_API_KEY")
        .env_remove("TEST_MODE")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("OPENAI_API_KEY"));
}

#[tokio::test]
async fn test_live_run_persists_and_is_idempotent() {
    let (tmp, config_path) = setup_test_env();
    let (_, _, ok) = run_themes(&config_path, &["init"]);
    assert!(ok);
    seed_opinions(
        &tmp,
        &[
            "Protected bike lanes on Main Street",
            "Protected bike lanes on Main Street please",
            "Extend library opening hours on weekends",
        ],
    )
    .await;

    let (stdout, stderr, success) = run_themes(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("opinions processed: 3"));
    assert!(stdout.contains("persisted"));
    assert!(stdout.contains("opinions assigned: 3"));
    assert!(!stdout.contains("not persisted"));

    // Nothing left to do on the second run.
    let (stdout, _, success) = run_themes(&config_path, &["run"]);
    assert!(success);
    assert!(stdout.contains("opinions processed: 0"));

    let (stdout, stderr, success) = run_themes(&config_path, &["clusters"]);
    assert!(success, "clusters failed: {}", stderr);
    assert!(stdout.contains("Unclustered:  0"));
}

#[tokio::test]
async fn test_limit_caps_batch() {
    let (tmp, config_path) = setup_test_env();
    run_themes(&config_path, &["init"]);
    seed_opinions(&tmp, &["one idea", "another idea", "third idea"]).await;

    let (stdout, _, success) = run_themes(&config_path, &["run", "--limit", "2"]);
    assert!(success);
    assert!(stdout.contains("opinions processed: 2"));

    let (stdout, _, _) = run_themes(&config_path, &["clusters"]);
    assert!(stdout.contains("Unclustered:  1"));
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(themes_binary()).arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    for cmd in ["init", "run", "clusters"] {
        assert!(stdout.contains(cmd), "help missing {}", cmd);
    }
}

#[test]
fn test_test_mode_from_env() {
    let tmp = TempDir::new().unwrap();
    let output = Command::new(themes_binary())
        .arg("--config")
        .arg(tmp.path().join("nope.toml"))
        .arg("run")
        .env("TEST_MODE", "1")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("not persisted (test mode)"));
}
