//! Integration tests for commands that need no database.

use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

fn mongofixture_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mongofixture"))
}

fn describe(output: &Output) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

const VALID_FIXTURE: &str = r#"// before
db.col.insertOne({key: "value", v: 1});
// command
db.col.findOneAndUpdate({key: "value"}, {$inc: {v: 1}}, {returnNewDocument: true});
// clear
db.col.drop();
"#;

/// An unreachable server; selecting it fails fast.
const UNREACHABLE_URI: &str = "mongodb://127.0.0.1:9/?serverSelectionTimeoutMS=200";

#[test]
fn test_validate_accepts_fixtures() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("find_one_and_update.js"), VALID_FIXTURE).unwrap();
    fs::create_dir(temp_dir.path().join("nested")).unwrap();
    fs::write(
        temp_dir.path().join("nested").join("drop.js"),
        "// command\ndb.getCollection('col').drop();\n",
    )
    .unwrap();

    let output = mongofixture_cmd()
        .arg("validate")
        .arg(temp_dir.path())
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("All 2 fixture(s) valid"), "{stdout}");
    assert!(stdout.contains("3 statements, 1 command block(s)"), "{stdout}");
}

#[test]
fn test_validate_rejects_fixture_without_command() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("no_command.js");
    fs::write(&path, "// before\ndb.col.insert({a: 1});\n// clear\ndb.col.drop();\n").unwrap();

    let output = mongofixture_cmd().arg("validate").arg(&path).output().unwrap();

    assert!(!output.status.success(), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no_command.js"), "{stderr}");
    assert!(stderr.contains("no `// command` section"), "{stderr}");
}

#[test]
fn test_validate_reports_unbalanced_statement() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("unbalanced.js");
    fs::write(&path, "// command\ndb.col.aggregate([{$match: {a: 1}}\n").unwrap();

    let output = mongofixture_cmd().arg("validate").arg(&path).output().unwrap();

    assert!(!output.status.success(), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("command section"), "{stderr}");
    assert!(stderr.contains("db.col.aggregate"), "{stderr}");
}

#[test]
fn test_run_malformed_fixture_fails_without_database() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("no_command.js"),
        "// before\ndb.col.insert({a: 1});\n",
    )
    .unwrap();

    let output = mongofixture_cmd()
        .arg("run")
        .arg(temp_dir.path())
        .arg("--uri")
        .arg(UNREACHABLE_URI)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load"), "{stderr}");
    assert!(!stderr.contains("Connection failed"), "{stderr}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("0 passed, 1 failed"));
    assert!(!temp_dir.path().join("no_command.expected.json").exists());
}

#[test]
fn test_run_skips_ignored_fixtures() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("skip_me.js"), VALID_FIXTURE).unwrap();
    fs::write(temp_dir.path().join("skip_me-ignored.expected.json"), "").unwrap();

    let output = mongofixture_cmd()
        .arg("run")
        .arg(temp_dir.path())
        .arg("--uri")
        .arg(UNREACHABLE_URI)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("skip_me.js (ignored)"), "{stdout}");
    assert!(stdout.contains("0 passed, 0 failed, 1 skipped"), "{stdout}");
}

#[test]
fn test_run_unreachable_server_fails_fixture() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.js"), VALID_FIXTURE).unwrap();

    let output = mongofixture_cmd()
        .arg("run")
        .arg(temp_dir.path())
        .arg("--uri")
        .arg(UNREACHABLE_URI)
        .arg("--output")
        .arg("json")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["failed"], 1);
    assert_eq!(report["results"][0]["passed"], false);
    assert!(
        report["results"][0]["failures"][0]
            .as_str()
            .unwrap()
            .contains("Connection failed")
    );
}

#[test]
fn test_run_filter_without_match() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.js"), VALID_FIXTURE).unwrap();

    let output = mongofixture_cmd()
        .arg("run")
        .arg(temp_dir.path())
        .arg("--filter")
        .arg("does_not_match")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No fixtures found"));
}

#[test]
fn test_schema_prints_config_and_result() {
    let output = mongofixture_cmd().arg("schema").output().unwrap();

    assert!(output.status.success(), "{}", describe(&output));
    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(schema["config"]["properties"]["uri"].is_object());
    assert!(schema["result"].is_object());
}

#[test]
fn test_init_scaffolds_valid_fixture() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("fixtures").join("example.js");

    let output = mongofixture_cmd().arg("init").arg(&path).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    assert!(path.exists());

    let output = mongofixture_cmd().arg("validate").arg(&path).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));

    // Refuses to overwrite
    let output = mongofixture_cmd().arg("init").arg(&path).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
}
