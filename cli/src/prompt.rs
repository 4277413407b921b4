use async_trait::async_trait;
use fmsh_core::EscalationPrompt;
use fmsh_core::FmshErr;
use fmsh_core::program::CommandLine;
use inquire::Confirm;
use tracing::warn;

/// Asks on the terminal before replaying a command with superuser
/// privileges. An aborted or unanswerable prompt counts as a refusal.
#[derive(Debug, Clone, Copy, Default)]
pub struct InquirePrompt;

#[async_trait]
impl EscalationPrompt for InquirePrompt {
    async fn confirm_escalation(&self, command: &CommandLine, cause: &FmshErr) -> bool {
        let message = format!("`{}` failed: {cause}. Retry as superuser?", command.preview());
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::new(&message).with_default(false).prompt()
        })
        .await;
        match answer {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(err)) => {
                warn!("escalation prompt unavailable: {err}");
                false
            }
            Err(err) => {
                warn!("escalation prompt panicked: {err}");
                false
            }
        }
    }
}
