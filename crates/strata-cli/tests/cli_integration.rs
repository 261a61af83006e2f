//! CLI subprocess integration tests.
//!
//! Each test runs the `strata` binary inside a fresh project directory and
//! checks exit codes, stdout and the JSON output shape.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const LAYERS: &str = r#"
[base]
from = { type = "scratch" }
run = ["echo 1 > a"]

[app]
from = { type = "built", tag = "base" }
run = ["echo 2 > b"]
"#;

fn strata_bin(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_strata"));
    cmd.current_dir(dir);
    cmd.env_remove("STRATA_LOG");
    cmd
}

fn project() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

fn write_recipe(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn run(dir: &Path, args: &[&str]) -> Output {
    strata_bin(dir).args(args).output().unwrap()
}

fn json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("invalid JSON ({e}): {stdout}"))
}

#[test]
fn cli_version_exits_zero() {
    let dir = project();
    let output = run(dir.path(), &["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("strata"));
}

#[test]
fn cli_help_lists_commands() {
    let dir = project();
    let output = run(dir.path(), &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["build", "order", "gc", "cache", "inspect", "completions"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}'");
    }
}

#[test]
fn cli_build_then_rebuild_is_cached() {
    let dir = project();
    write_recipe(dir.path(), "recipe.toml", LAYERS);

    let first = run(dir.path(), &["--json", "build"]);
    assert!(
        first.status.success(),
        "build failed: {}",
        String::from_utf8_lossy(&first.stderr)
    );
    let report = json(&first);
    let layers = report["files"][0]["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 2);
    assert!(layers.iter().all(|l| l["outcome"] == "built"));
    assert!(dir.path().join("oci").exists());
    assert!(dir.path().join("roots").join("app").exists());

    let second = run(dir.path(), &["--json", "build"]);
    assert!(second.status.success());
    let report = json(&second);
    let layers = report["files"][0]["layers"].as_array().unwrap();
    assert!(layers.iter().all(|l| l["outcome"] == "cached"));
}

#[test]
fn cli_failing_command_exits_one() {
    let dir = project();
    write_recipe(
        dir.path(),
        "recipe.toml",
        "[broken]\nfrom = { type = \"scratch\" }\nrun = [\"exit 3\"]\n",
    );
    let output = run(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken"));
}

#[test]
fn cli_cycle_exits_two() {
    let dir = project();
    let a = write_recipe(
        dir.path(),
        "a.toml",
        "[a]\nfrom = { type = \"built\", tag = \"b\" }\n",
    );
    let b = write_recipe(
        dir.path(),
        "b.toml",
        "[b]\nfrom = { type = \"built\", tag = \"a\" }\n",
    );
    let output = strata_bin(dir.path())
        .arg("order")
        .arg(&a)
        .arg(&b)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("dependency cycle"));
}

#[test]
fn cli_missing_recipe_exits_two() {
    let dir = project();
    let output = run(dir.path(), &["build", "nope.toml"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_bad_config_exits_two() {
    let dir = project();
    std::fs::write(dir.path().join("strata.toml"), "colour = \"blue\"\n").unwrap();
    let output = run(dir.path(), &["cache", "list"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_order_json_lists_dependencies() {
    let dir = project();
    let base = write_recipe(
        dir.path(),
        "base.toml",
        "[base]\nfrom = { type = \"scratch\" }\n",
    );
    let app = write_recipe(
        dir.path(),
        "app.toml",
        "[app]\nfrom = { type = \"built\", tag = \"base\" }\n",
    );
    let output = strata_bin(dir.path())
        .args(["--json", "order"])
        .arg(&app)
        .arg(&base)
        .output()
        .unwrap();
    assert!(output.status.success());
    let order = json(&output);
    let entries = order.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0]["file"].as_str().unwrap().ends_with("base.toml"));
    assert_eq!(entries[1]["prerequisites"].as_array().unwrap().len(), 1);
}

#[test]
fn cli_cache_list_and_clear() {
    let dir = project();
    write_recipe(dir.path(), "recipe.toml", LAYERS);
    assert!(run(dir.path(), &["build"]).status.success());

    let listed = json(&run(dir.path(), &["--json", "cache", "list"]));
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["layer"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["app", "base"]);

    assert!(run(dir.path(), &["cache", "forget", "app"]).status.success());
    let listed = json(&run(dir.path(), &["--json", "cache", "list"]));
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let cleared = json(&run(dir.path(), &["--json", "cache", "clear"]));
    assert_eq!(cleared["removed"], 1);

    let listed = json(&run(dir.path(), &["--json", "cache", "list"]));
    assert!(listed.as_array().unwrap().is_empty());
}

#[test]
fn cli_gc_keeps_live_blobs() {
    let dir = project();
    write_recipe(dir.path(), "recipe.toml", LAYERS);
    assert!(run(dir.path(), &["build"]).status.success());

    let dry = json(&run(dir.path(), &["--json", "gc", "--dry-run"]));
    assert_eq!(dry["dry_run"], true);
    assert!(dry["orphaned_blobs"].is_array());

    let output = run(dir.path(), &["gc"]);
    assert!(output.status.success());
    let rebuilt = json(&run(dir.path(), &["--json", "build"]));
    let layers = rebuilt["files"][0]["layers"].as_array().unwrap();
    assert!(layers.iter().all(|l| l["outcome"] == "cached"));
}

#[test]
fn cli_gc_without_images_is_noop() {
    let dir = project();
    let output = run(dir.path(), &["gc"]);
    assert!(output.status.success());
}

#[test]
fn cli_inspect_reports_layer() {
    let dir = project();
    write_recipe(dir.path(), "recipe.toml", LAYERS);
    assert!(run(dir.path(), &["build"]).status.success());

    let info = json(&run(dir.path(), &["--json", "inspect", "app"]));
    assert_eq!(info["layer"], "app");
    assert_eq!(info["snapshot"], true);
    assert!(info["reference"]["digest"].is_string());
    assert!(!info["manifest"]["layers"].as_array().unwrap().is_empty());

    let missing = run(dir.path(), &["inspect", "ghost"]);
    assert_eq!(missing.status.code(), Some(1));
}

#[test]
fn cli_overrides_directories() {
    let dir = project();
    write_recipe(dir.path(), "recipe.toml", LAYERS);
    let output = run(
        dir.path(),
        &["--state-dir", "st", "--rootfs-dir", "rf", "--oci-dir", "img", "build"],
    );
    assert!(output.status.success());
    assert!(dir.path().join("st").exists());
    assert!(dir.path().join("rf").join("base").exists());
    assert!(dir.path().join("img").exists());
}

#[test]
fn cli_completions_bash() {
    let dir = project();
    let output = run(dir.path(), &["completions", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("strata"));
}
