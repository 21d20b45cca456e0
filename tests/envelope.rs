//! Agent output as read back by the manager

use bivac::core::envelope::{Envelope, Step, StepOutput};
use bivac::core::volume::BackupStatus;

fn step(stdout: &str, rc: i32) -> StepOutput {
    StepOutput {
        stdout: stdout.to_string(),
        rc,
    }
}

fn first_backup() -> Envelope {
    let mut env = Envelope::single(Step::TestInit, step("Is there a repository at the following location?", 1));
    env.merge(Envelope::single(Step::Init, step("created restic repository", 0)));
    env.merge(Envelope::single(Step::Backup, step("snapshot 5f0a9c21 saved", 0)));
    env.merge(Envelope::single(Step::Forget, step("[]", 0)));
    env.merge(Envelope::single(Step::Snapshots, step("[]", 0)));
    env
}

#[test]
fn test_first_backup_of_new_repository() {
    let env = first_backup();
    assert_eq!(env.status(), BackupStatus::Success);

    let json = env.to_json();
    assert!(json.starts_with(r#"{"type":"success","content":{"#));
    assert!(json.contains(r#""testInit":{"stdout":"#));

    let parsed = Envelope::from_agent_output(&format!("warning: cache disabled\n{}\n", json)).unwrap();
    assert_eq!(parsed, env);
    assert_eq!(parsed.status(), BackupStatus::Success);
}

#[test]
fn test_unlock_failure_fails_the_run() {
    let mut env = Envelope::single(Step::TestInit, step("", 0));
    env.merge(Envelope::single(Step::Unlock, step("repository is locked", 1)));

    let parsed = Envelope::from_agent_output(&env.to_json()).unwrap();
    assert_eq!(parsed.status(), BackupStatus::Failed);
    assert!(parsed.step(Step::Backup).is_none());
}

#[test]
fn test_error_envelope() {
    let parsed = Envelope::from_agent_output(r#"{"type":"error","content":"restic: not found"}"#).unwrap();
    assert_eq!(parsed, Envelope::error("restic: not found"));
    assert_eq!(parsed.status(), BackupStatus::Failed);
    assert_eq!(parsed.log_lines()["error"], "restic: not found");
}

#[test]
fn test_garbage_is_rejected() {
    assert!(Envelope::from_agent_output("").is_none());
    assert!(Envelope::from_agent_output("exec format error").is_none());
    assert!(Envelope::from_agent_output(r#"{"type":"pending"}"#).is_none());
}
