//! Straggler recovery: the resumable decision point reached when the
//! operator interrupts a batch wait.
//!
//! Cancellation is cooperative — the interrupt is caught at the batch-join
//! point and turned into a call to a [`RecoveryPrompt`], never into
//! unstructured control flow. The prompt is injectable so tests (and
//! non-interactive callers) can script decisions.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::info;

/// What to do about the hosts still running when a batch wait is interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Resume waiting for the batch
    KeepWaiting,
    /// Mark every incomplete host failed and stop waiting on the batch
    FailStragglers,
    /// Cancel autoscaled stragglers and terminate their instances; keep
    /// waiting for the rest
    TerminateStragglers,
}

/// A host that had not completed when the operator intervened
#[derive(Debug, Clone)]
pub struct Straggler {
    /// Display name of the host
    pub name: String,
    /// Status timeline so far
    pub timeline: String,
    /// True when the host is instance-backed and autoscaled, i.e. eligible
    /// for termination
    pub can_terminate: bool,
}

/// Decision source consulted during straggler recovery
pub trait RecoveryPrompt: Send + Sync {
    /// Pick an action for the given stragglers; `elapsed` is the `MM:SS`
    /// run time so far
    fn decide(&self, elapsed: &str, stragglers: &[Straggler]) -> RecoveryAction;
}

/// Prompt that always resumes waiting; the default for non-interactive runs
#[derive(Debug, Default)]
pub struct KeepWaitingPrompt;

impl RecoveryPrompt for KeepWaitingPrompt {
    fn decide(&self, elapsed: &str, stragglers: &[Straggler]) -> RecoveryAction {
        info!(
            elapsed,
            stragglers = stragglers.len(),
            "non-interactive run, resuming batch wait"
        );
        RecoveryAction::KeepWaiting
    }
}

/// Prompt fed from a fixed script of actions.
///
/// Each interrupt consumes the next scripted action; an exhausted script
/// keeps waiting. Used by tests and by callers that decided up front.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    actions: Mutex<VecDeque<RecoveryAction>>,
}

impl ScriptedPrompt {
    /// Create a prompt that will answer with `actions` in order
    pub fn new(actions: impl IntoIterator<Item = RecoveryAction>) -> Self {
        Self {
            actions: Mutex::new(actions.into_iter().collect()),
        }
    }
}

impl RecoveryPrompt for ScriptedPrompt {
    fn decide(&self, _elapsed: &str, _stragglers: &[Straggler]) -> RecoveryAction {
        self.actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RecoveryAction::KeepWaiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_prompt_plays_actions_in_order() {
        let prompt = ScriptedPrompt::new([
            RecoveryAction::KeepWaiting,
            RecoveryAction::TerminateStragglers,
        ]);

        assert_eq!(prompt.decide("00:10", &[]), RecoveryAction::KeepWaiting);
        assert_eq!(
            prompt.decide("00:20", &[]),
            RecoveryAction::TerminateStragglers
        );
        // exhausted scripts fall back to waiting
        assert_eq!(prompt.decide("00:30", &[]), RecoveryAction::KeepWaiting);
    }
}
