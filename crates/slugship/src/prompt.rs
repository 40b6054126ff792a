//! Interactive straggler recovery and Ctrl-C wiring

use anyhow::Result;
use async_channel::Receiver;
use dialoguer::Select;
use fleet_deploy::{RecoveryAction, RecoveryPrompt, Straggler};

/// Install a Ctrl-C handler that feeds the orchestrator's interrupt channel.
///
/// Each Ctrl-C becomes one message; the orchestrator pauses the batch wait
/// and consults the prompt instead of the process dying.
pub fn interrupt_channel() -> Result<Receiver<()>> {
    let (sender, receiver) = async_channel::bounded(4);
    ctrlc::set_handler(move || {
        let _ = sender.try_send(());
    })?;
    Ok(receiver)
}

/// Terminal menu shown when a batch wait is interrupted
pub struct InteractivePrompt;

impl RecoveryPrompt for InteractivePrompt {
    fn decide(&self, elapsed: &str, stragglers: &[Straggler]) -> RecoveryAction {
        eprintln!("\nWe are {elapsed} in. Stragglers for this batch:");
        for straggler in stragglers {
            let note = if straggler.can_terminate {
                ""
            } else {
                " [not autoscaled]"
            };
            eprintln!("  {}{} (timeline: {})", straggler.name, note, straggler.timeline);
        }

        let choices = [
            "Keep waiting",
            "Fail the stragglers and stop this batch",
            "Terminate autoscaled stragglers and let their groups replace them",
        ];
        match Select::new()
            .with_prompt("Straggler recovery")
            .items(&choices)
            .default(0)
            .interact()
        {
            Ok(1) => RecoveryAction::FailStragglers,
            Ok(2) => RecoveryAction::TerminateStragglers,
            // includes a second Ctrl-C during the menu
            _ => RecoveryAction::KeepWaiting,
        }
    }
}
