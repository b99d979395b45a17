use serde::{Deserialize, Serialize};
use std::fmt;

/// Run state definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Initial state when the run is created
    #[default]
    Pending,
    /// Run is currently executing steps
    InProgress,
    /// All steps completed successfully
    Complete,
    /// At least one step failed permanently
    Failed,
    /// The run-level deadline was exceeded
    TimedOut,
}

impl RunState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::TimedOut)
    }

    /// Check if the run is actively being processed
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Whether a transition from `self` to `to` is allowed.
    pub fn can_transition_to(&self, to: RunState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Complete)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::TimedOut)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid run state: {s}")),
        }
    }
}

/// Workflow step state definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Initial state when the step is created
    #[default]
    Pending,
    /// Every dependency is complete; eligible for dispatch
    Ready,
    /// Step is currently executing
    Running,
    /// Step completed successfully
    Complete,
    /// Step failed; terminal once the retry budget is exhausted
    Failed,
    /// A failed attempt is waiting for its backoff delay
    Retrying,
}

impl StepState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check if the step is actively executing
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if this step satisfies dependency edges pointing at it
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Whether a transition from `self` to `to` is allowed.
    pub fn can_transition_to(&self, to: StepState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Ready)
                | (Self::Pending, Self::Failed)
                | (Self::Ready, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Retrying)
                | (Self::Retrying, Self::Running)
                | (Self::Retrying, Self::Failed)
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            _ => Err(format!("Invalid step state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal_check() {
        assert!(RunState::Complete.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::TimedOut.is_terminal());
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::InProgress.is_terminal());
    }

    #[test]
    fn test_run_state_transitions() {
        assert!(RunState::Pending.can_transition_to(RunState::InProgress));
        assert!(RunState::InProgress.can_transition_to(RunState::Complete));
        assert!(RunState::InProgress.can_transition_to(RunState::TimedOut));
        assert!(!RunState::Pending.can_transition_to(RunState::Complete));
        assert!(!RunState::Complete.can_transition_to(RunState::InProgress));
        assert!(!RunState::TimedOut.can_transition_to(RunState::Failed));
    }

    #[test]
    fn test_step_state_dependency_satisfaction() {
        assert!(StepState::Complete.satisfies_dependencies());
        assert!(!StepState::Pending.satisfies_dependencies());
        assert!(!StepState::Ready.satisfies_dependencies());
        assert!(!StepState::Running.satisfies_dependencies());
        assert!(!StepState::Failed.satisfies_dependencies());
        assert!(!StepState::Retrying.satisfies_dependencies());
    }

    #[test]
    fn test_step_state_transitions() {
        assert!(StepState::Pending.can_transition_to(StepState::Ready));
        assert!(StepState::Ready.can_transition_to(StepState::Running));
        assert!(StepState::Running.can_transition_to(StepState::Complete));
        assert!(StepState::Running.can_transition_to(StepState::Retrying));
        assert!(StepState::Retrying.can_transition_to(StepState::Running));
        assert!(StepState::Retrying.can_transition_to(StepState::Failed));
        // Short-circuit of never-run dependents
        assert!(StepState::Pending.can_transition_to(StepState::Failed));
        // A step never starts before its dependencies complete
        assert!(!StepState::Pending.can_transition_to(StepState::Running));
        assert!(!StepState::Complete.can_transition_to(StepState::Running));
        assert!(!StepState::Failed.can_transition_to(StepState::Retrying));
    }

    #[test]
    fn test_state_string_roundtrip() {
        assert_eq!(RunState::InProgress.to_string(), "in_progress");
        assert_eq!("timed_out".parse::<RunState>().unwrap(), RunState::TimedOut);
        assert_eq!(StepState::Retrying.to_string(), "retrying");
        assert_eq!("ready".parse::<StepState>().unwrap(), StepState::Ready);
        assert!("bogus".parse::<StepState>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&RunState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        let parsed: StepState = serde_json::from_str("\"retrying\"").unwrap();
        assert_eq!(parsed, StepState::Retrying);
    }
}
