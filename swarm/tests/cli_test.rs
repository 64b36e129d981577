use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn swarm() -> Command {
    let mut cmd = Command::cargo_bin("swarm").unwrap();
    for var in [
        "SWARM_MAX_WORKERS",
        "SWARM_LLM_ENDPOINTS",
        "SWARM_SANDBOX_COMMAND",
        "SWARM_SANDBOX_URL",
        "SWARM_TARGET_REPO",
        "SWARM_MERGE_STRATEGY",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_commands() {
    swarm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_config_check_accepts_valid_file() {
    let temp = tempdir().unwrap();
    let repo = temp.path().join("repo");
    std::fs::create_dir(&repo).unwrap();
    let config_path = temp.path().join("swarm.yml");
    std::fs::write(
        &config_path,
        format!(
            "target:\n  repo-path: {}\nllm:\n  endpoints:\n    - name: local\n      base-url: http://localhost:8000/v1\nworkers:\n  command: [\"sandbox-run\"]\n  max-concurrent: 3\nmerge:\n  strategy: rebase\n",
            repo.display()
        ),
    )
    .unwrap();

    swarm()
        .args(["--log-stderr", "config", "check", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("max-concurrent: 3"))
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn test_config_check_lists_every_problem() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("swarm.yml");
    std::fs::write(
        &config_path,
        "target:\n  repo-path: /definitely/not/here\nworkers:\n  max-concurrent: 0\n",
    )
    .unwrap();

    swarm()
        .args(["--log-stderr", "config", "check", "--config"])
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("max-concurrent must be at least 1"))
        .stderr(predicate::str::contains("at least one llm endpoint"))
        .stderr(predicate::str::contains("is not a directory"));
}
