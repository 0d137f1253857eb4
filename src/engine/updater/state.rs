//! Installation State Machine
//!
//! One instance per installation attempt. States only move forward; every
//! non-terminal state may fail. A finished attempt is never resumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::error::FailureReason;

/// Current phase of an installation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstallationState {
    /// Checking signatures of the artifact to be used
    Verifying,
    /// Extracting or patching into a private location
    Staging,
    /// Waiting for write access to the install location
    AwaitingAuthorization,
    /// Replacing the installed bundle
    Swapping,
    /// Quarantine removal and index refresh
    PostProcessing,
    Done,
    Failed(FailureReason),
}

impl InstallationState {
    /// Position in the forward order; `None` for `Failed`.
    fn step(&self) -> Option<u8> {
        match self {
            Self::Verifying => Some(0),
            Self::Staging => Some(1),
            Self::AwaitingAuthorization => Some(2),
            Self::Swapping => Some(3),
            Self::PostProcessing => Some(4),
            Self::Done => Some(5),
            Self::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn can_transition_to(&self, next: &InstallationState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.step(), next.step()) {
            (_, None) => true,
            (Some(from), Some(to)) => to == from + 1,
            (None, Some(_)) => false,
        }
    }
}

impl Default for InstallationState {
    fn default() -> Self {
        Self::Verifying
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal installation transition from {from:?} to {to:?}")]
pub struct IllegalTransition {
    pub from: InstallationState,
    pub to: InstallationState,
}

/// Recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: InstallationState,
    pub to: InstallationState,
    pub at: DateTime<Utc>,
}

/// Enforces the transition rules and keeps the history of an attempt
#[derive(Debug, Clone, Default)]
pub struct InstallStateMachine {
    current: InstallationState,
    history: Vec<StateTransition>,
}

impl InstallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &InstallationState {
        &self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn into_history(self) -> Vec<StateTransition> {
        self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Move to `next` if the rules allow it.
    pub fn transition(&mut self, next: InstallationState) -> Result<(), IllegalTransition> {
        if !self.current.can_transition_to(&next) {
            return Err(IllegalTransition {
                from: self.current.clone(),
                to: next,
            });
        }
        match &next {
            InstallationState::Failed(reason) => warn!("Installation failed: {}", reason),
            other => info!("Installation state: {:?}", other),
        }
        let from = std::mem::replace(&mut self.current, next.clone());
        self.history.push(StateTransition {
            from,
            to: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Fail from the current state. Returns the reason for convenience.
    pub fn fail(&mut self, reason: FailureReason) -> Result<FailureReason, IllegalTransition> {
        self.transition(InstallationState::Failed(reason.clone()))?;
        Ok(reason)
    }
}
