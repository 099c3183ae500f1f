//! End-to-end CLI tests using `assert_cmd`
#![allow(clippy::expect_used, clippy::panic, reason = "Allow for tests")]

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn barrage() -> Command {
    Command::cargo_bin("barrage").unwrap_or_else(|err| panic!("Binary not found: {err}"))
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("Failed to create temp dir: {err}"))
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(path, contents).expect("write file");
}

#[test]
fn test_cli_help() {
    barrage()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"))
        .stdout(predicate::str::contains("report"));
}

#[test]
fn test_cli_invalid_command() {
    barrage().arg("invalid-command-xyz").assert().failure();
}

#[test]
fn test_compile_empty_project_succeeds() {
    let temp = temp_dir();

    barrage()
        .arg("--project")
        .arg(temp.path())
        .arg("compile")
        .assert()
        .success()
        .stdout(predicate::str::contains("compile(gatling)"))
        .stdout(predicate::str::contains("BUILD SUCCESSFUL"));
}

#[test]
fn test_invalid_configuration_exits_with_two() {
    let temp = temp_dir();
    write(
        temp.path(),
        "barrage.toml",
        "[[source_groups]]\nname = \"web\"\ndepends_on = [\"missing\"]\n",
    );

    barrage()
        .arg("--project")
        .arg(temp.path())
        .arg("compile")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn test_unknown_group_exits_with_two() {
    let temp = temp_dir();

    barrage()
        .arg("--project")
        .arg(temp.path())
        .args(["compile", "nope"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown source group 'nope'"));
}

#[test]
fn test_clean_removes_build_directory() {
    let temp = temp_dir();
    barrage()
        .arg("--project")
        .arg(temp.path())
        .arg("compile")
        .assert()
        .success();
    assert!(temp.path().join("build/barrage").exists());

    barrage()
        .arg("--project")
        .arg(temp.path())
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));
    assert!(!temp.path().join("build/barrage").exists());

    barrage()
        .arg("--project")
        .arg(temp.path())
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to clean"));
}

#[cfg(unix)]
mod runs {
    use super::*;

    const FAKE_COMPILER: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -d) out="$2"; shift 2 ;;
    -cp) shift 2 ;;
    *) name=$(basename "$1"); cp "$1" "$out/${name%.*}.class"; shift ;;
  esac
done
"#;

    const FAKE_ENGINE: &str = r#"#!/bin/sh
sim=""
results=""
while [ $# -gt 0 ]; do
  case "$1" in
    --simulation) sim="$2"; shift 2 ;;
    --results-folder) results="$2"; shift 2 ;;
    *) shift ;;
  esac
done
simple=$(echo "${sim##*.}" | tr 'A-Z' 'a-z')
dir="$results/$simple-$(date +%s)$$"
mkdir -p "$dir/js"
case "$sim" in
  *Failing*)
    echo '{"assertions":[{"result":false,"message":"mean response time < 50"}]}' > "$dir/js/assertions.json"
    exit 2
    ;;
esac
echo '{"assertions":[{"result":true,"message":"failed requests < 1%"}]}' > "$dir/js/assertions.json"
"#;

    fn project(simulations: &[&str]) -> TempDir {
        let temp = temp_dir();
        let root = temp.path();
        write(root, "tools/compiler.sh", FAKE_COMPILER);
        write(root, "tools/engine.sh", FAKE_ENGINE);
        for name in simulations {
            write(
                root,
                &format!("src/web/java/example/{name}.java"),
                &format!("package example;\n\npublic class {name} extends Simulation {{}}\n"),
            );
        }
        write(
            root,
            "barrage.toml",
            &format!(
                r#"jvm_options = ["{root}/tools/engine.sh"]

[[source_groups]]
name = "web"

[engine]
java = "/bin/sh"

[compiler]
program = "/bin/sh"
options = ["{root}/tools/compiler.sh"]
extensions = ["java"]

[execution]
max_workers = 2
"#,
                root = root.display()
            ),
        );
        temp
    }

    #[test]
    fn test_run_passing_simulation() {
        let temp = project(&["BasicSimulation"]);

        barrage()
            .arg("--project")
            .arg(temp.path())
            .args(["run", "-D", "users=5"])
            .assert()
            .success()
            .stdout(predicate::str::contains("run(web)"))
            .stdout(predicate::str::contains("example.BasicSimulation passed (1 assertions)"))
            .stdout(predicate::str::contains("BUILD SUCCESSFUL"));
    }

    #[test]
    fn test_failing_assertions_exit_with_one() {
        let temp = project(&["FailingSimulation"]);

        barrage()
            .arg("--project")
            .arg(temp.path())
            .arg("run")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("mean response time < 50"))
            .stdout(predicate::str::contains("BUILD FAILED"));
    }

    #[test]
    fn test_single_simulation_override() {
        let temp = project(&["BasicSimulation", "FailingSimulation"]);

        barrage()
            .arg("--project")
            .arg(temp.path())
            .args(["run", "--simulation", "BasicSimulation"])
            .assert()
            .success()
            .stdout(predicate::str::contains("example.BasicSimulation passed"))
            .stdout(predicate::str::contains("FailingSimulation").not());
    }
}
