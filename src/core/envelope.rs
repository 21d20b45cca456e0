/// Agent result envelope
///
/// The only contract between the agent and the manager:
/// `{"type": "success", "content": {<step>: {"stdout": .., "rc": ..}}}` or
/// `{"type": "error", "content": "<message>"}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::volume::BackupStatus;

/// Engine steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    TestInit,
    Init,
    Unlock,
    Backup,
    Restore,
    Forget,
    Snapshots,
    Verify,
    Raw,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::TestInit => "testInit",
            Step::Init => "init",
            Step::Unlock => "unlock",
            Step::Backup => "backup",
            Step::Restore => "restore",
            Step::Forget => "forget",
            Step::Snapshots => "snapshots",
            Step::Verify => "verify",
            Step::Raw => "raw",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub stdout: String,
    pub rc: i32,
}

pub type Steps = BTreeMap<Step, StepOutput>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Envelope {
    Success(Steps),
    Error(String),
}

/// Body posted by agents to the log receiver. Older agents wrap the
/// envelope in a `data` field.
#[derive(Deserialize)]
#[serde(untagged)]
enum ReceivedBody {
    Wrapped { data: Envelope },
    Bare(Envelope),
}

impl Envelope {
    pub fn single(step: Step, output: StepOutput) -> Self {
        let mut steps = Steps::new();
        steps.insert(step, output);
        Envelope::Success(steps)
    }

    pub fn error(msg: impl std::fmt::Display) -> Self {
        Envelope::Error(msg.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success(_))
    }

    pub fn steps(&self) -> Option<&Steps> {
        match self {
            Envelope::Success(steps) => Some(steps),
            Envelope::Error(_) => None,
        }
    }

    pub fn step(&self, step: Step) -> Option<&StepOutput> {
        self.steps().and_then(|s| s.get(&step))
    }

    /// Run status: success iff every step but `testInit` exited with 0.
    pub fn status(&self) -> BackupStatus {
        match self {
            Envelope::Error(_) => BackupStatus::Failed,
            Envelope::Success(steps) => {
                let failed = steps
                    .iter()
                    .any(|(step, out)| *step != Step::TestInit && out.rc != 0);
                if failed {
                    BackupStatus::Failed
                } else {
                    BackupStatus::Success
                }
            }
        }
    }

    /// Fold the steps of `other` into this envelope. An error on either
    /// side wins.
    pub fn merge(&mut self, other: Envelope) {
        match (self, other) {
            (Envelope::Success(mine), Envelope::Success(theirs)) => mine.extend(theirs),
            (Envelope::Error(_), _) => {}
            (me, err @ Envelope::Error(_)) => *me = err,
        }
    }

    /// Per-step log lines, `[<rc>] <stdout>`
    pub fn log_lines(&self) -> BTreeMap<String, String> {
        match self {
            Envelope::Success(steps) => steps
                .iter()
                .map(|(step, out)| (step.to_string(), format!("[{}] {}", out.rc, out.stdout)))
                .collect(),
            Envelope::Error(msg) => {
                let mut logs = BTreeMap::new();
                logs.insert("error".to_string(), msg.clone());
                logs
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"type":"error","content":"{}"}}"#, e))
    }

    /// Extract the envelope from an agent's captured output. The output may
    /// carry engine chatter on stderr before the envelope, so the last line
    /// holding a valid envelope wins.
    pub fn from_agent_output(output: &str) -> Option<Envelope> {
        let trimmed = output.trim();
        if let Ok(env) = serde_json::from_str::<Envelope>(trimmed) {
            return Some(env);
        }
        trimmed.lines().rev().find_map(|line| {
            let start = line.find('{')?;
            serde_json::from_str::<Envelope>(line[start..].trim()).ok()
        })
    }

    pub fn from_receiver_body(body: &[u8]) -> serde_json::Result<Envelope> {
        Ok(match serde_json::from_slice::<ReceivedBody>(body)? {
            ReceivedBody::Wrapped { data } => data,
            ReceivedBody::Bare(env) => env,
        })
    }
}
