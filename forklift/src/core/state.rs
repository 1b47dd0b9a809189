//! Run state machine.
//!
//! A run starts in [`RunStatus::Init`] and ends in exactly one terminal state.
//! Every state other than `Init` has a single legal predecessor, except the
//! two abort states (`Failed`, `Cancelled`) which any in-flight state may
//! enter.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Lifecycle state of a single forklift run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Init,
    GuardOk,
    WorkspaceReady,
    SandboxRunning,
    SandboxTimeout,
    SandboxExited,
    Verifying,
    Stuck,
    Unverified,
    Verified,
    Publishing,
    Published,
    PublishFailed,
    /// Guard, git, or infrastructure failure outside the publish stage.
    Failed,
    /// Operator interrupt observed before the run reached a verdict.
    Cancelled,
}

impl RunStatus {
    /// True for states that end the run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SandboxTimeout
                | Self::Stuck
                | Self::Unverified
                | Self::Published
                | Self::PublishFailed
                | Self::Failed
                | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus as S;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, S::Failed | S::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (S::Init, S::GuardOk)
                | (S::GuardOk, S::WorkspaceReady)
                | (S::WorkspaceReady, S::SandboxRunning)
                | (S::SandboxRunning, S::SandboxTimeout)
                | (S::SandboxRunning, S::SandboxExited)
                | (S::SandboxExited, S::Verifying)
                | (S::Verifying, S::Stuck)
                | (S::Verifying, S::Unverified)
                | (S::Verifying, S::Verified)
                | (S::Verified, S::Publishing)
                | (S::Publishing, S::Published)
                | (S::Publishing, S::PublishFailed)
        )
    }

    /// Process exit code for a terminal state, `None` while the run is in flight.
    pub fn exit_code(self) -> Option<i32> {
        let code = match self {
            Self::Published => exit_codes::OK,
            Self::Failed => exit_codes::FAILED,
            Self::SandboxTimeout => exit_codes::TIMEOUT,
            Self::Unverified => exit_codes::UNVERIFIED,
            Self::Stuck => exit_codes::STUCK,
            Self::PublishFailed => exit_codes::PUBLISH_FAILED,
            Self::Cancelled => exit_codes::CANCELLED,
            _ => return None,
        };
        Some(code)
    }

    /// Short outcome label used in logs and the final summary line.
    pub fn outcome_label(self) -> &'static str {
        match self {
            Self::Published => "success",
            Self::Failed => "failed",
            Self::SandboxTimeout => "timeout",
            Self::Unverified => "unverified",
            Self::Stuck => "stuck",
            Self::PublishFailed => "publish-error",
            Self::Cancelled => "cancelled",
            _ => "in-progress",
        }
    }
}

/// Tracks the current state and the path taken to reach it.
#[derive(Debug, Clone)]
pub struct RunMachine {
    current: RunStatus,
    history: Vec<RunStatus>,
}

impl Default for RunMachine {
    fn default() -> Self {
        Self {
            current: RunStatus::Init,
            history: vec![RunStatus::Init],
        }
    }
}

impl RunMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RunStatus {
        self.current
    }

    pub fn history(&self) -> &[RunStatus] {
        &self.history
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: RunStatus) -> Result<RunStatus> {
        if !self.current.can_transition_to(next) {
            return Err(anyhow!(
                "illegal run transition {:?} -> {:?}",
                self.current,
                next
            ));
        }
        self.current = next;
        self.history.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RunStatus; 15] = [
        RunStatus::Init,
        RunStatus::GuardOk,
        RunStatus::WorkspaceReady,
        RunStatus::SandboxRunning,
        RunStatus::SandboxTimeout,
        RunStatus::SandboxExited,
        RunStatus::Verifying,
        RunStatus::Stuck,
        RunStatus::Unverified,
        RunStatus::Verified,
        RunStatus::Publishing,
        RunStatus::Published,
        RunStatus::PublishFailed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    #[test]
    fn happy_path_reaches_published() {
        let mut machine = RunMachine::new();
        for next in [
            RunStatus::GuardOk,
            RunStatus::WorkspaceReady,
            RunStatus::SandboxRunning,
            RunStatus::SandboxExited,
            RunStatus::Verifying,
            RunStatus::Verified,
            RunStatus::Publishing,
            RunStatus::Published,
        ] {
            machine.advance(next).expect("legal transition");
        }
        assert_eq!(machine.current(), RunStatus::Published);
        assert_eq!(machine.history().len(), 9);
        assert_eq!(machine.current().exit_code(), Some(exit_codes::OK));
    }

    #[test]
    fn timeout_cannot_reach_verification() {
        let mut machine = RunMachine::new();
        machine.advance(RunStatus::GuardOk).expect("guard");
        machine.advance(RunStatus::WorkspaceReady).expect("workspace");
        machine.advance(RunStatus::SandboxRunning).expect("sandbox");
        machine.advance(RunStatus::SandboxTimeout).expect("timeout");
        let err = machine.advance(RunStatus::Verifying).unwrap_err();
        assert!(err.to_string().contains("illegal run transition"));
        assert!(machine.advance(RunStatus::Cancelled).is_err());
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut machine = RunMachine::new();
        assert!(machine.advance(RunStatus::SandboxRunning).is_err());
        assert_eq!(machine.current(), RunStatus::Init);
    }

    #[test]
    fn each_onward_state_has_one_predecessor() {
        for target in ALL {
            if matches!(
                target,
                RunStatus::Init | RunStatus::Failed | RunStatus::Cancelled
            ) {
                continue;
            }
            let predecessors: Vec<RunStatus> = ALL
                .iter()
                .copied()
                .filter(|from| from.can_transition_to(target))
                .collect();
            assert_eq!(predecessors.len(), 1, "{target:?} from {predecessors:?}");
        }
    }

    #[test]
    fn terminal_exit_codes_are_distinct() {
        let mut codes: Vec<i32> = ALL.iter().filter_map(|s| s.exit_code()).collect();
        let terminal = ALL.iter().filter(|s| s.is_terminal()).count();
        assert_eq!(codes.len(), terminal);
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), terminal);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RunStatus::PublishFailed).expect("json");
        assert_eq!(json, "\"PUBLISH_FAILED\"");
        let parsed: RunStatus = serde_json::from_str("\"SANDBOX_TIMEOUT\"").expect("parse");
        assert_eq!(parsed, RunStatus::SandboxTimeout);
    }
}
