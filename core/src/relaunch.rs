//! Replays programs that failed for lack of permissions on a privileged
//! console, after asking the user.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::console::Console;
use crate::engine::EngineContext;
use crate::engine::EngineEvent;
use crate::error::FmshErr;
use crate::error::Result;
use crate::program::AsyncProgram;
use crate::program::CommandLine;
use crate::program::SyncProgram;

/// Asks whether a failed command may be retried with elevated privileges.
#[async_trait]
pub trait EscalationPrompt: Send + Sync {
    async fn confirm_escalation(&self, command: &CommandLine, cause: &FmshErr) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEscalate;

#[async_trait]
impl EscalationPrompt for AlwaysEscalate {
    async fn confirm_escalation(&self, _command: &CommandLine, _cause: &FmshErr) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEscalate;

#[async_trait]
impl EscalationPrompt for NeverEscalate {
    async fn confirm_escalation(&self, _command: &CommandLine, _cause: &FmshErr) -> bool {
        false
    }
}

/// Runs programs on the engine's current console and replays
/// relaunchable failures on a privileged one.
///
/// The replay uses a clone taken before the first attempt, so whatever
/// state the failed attempt left in the program does not leak into the
/// result.
pub struct RelaunchPolicy<'a> {
    engine: &'a EngineContext,
    prompt: Arc<dyn EscalationPrompt>,
}

impl<'a> RelaunchPolicy<'a> {
    pub fn new(engine: &'a EngineContext, prompt: Arc<dyn EscalationPrompt>) -> Self {
        Self { engine, prompt }
    }

    /// Runs a synchronous program and returns it with its result filled.
    pub async fn execute<P>(&self, program: P) -> Result<P>
    where
        P: SyncProgram + Clone,
    {
        let pristine = program.clone();
        let mut program = program;
        let console = self.engine.get_console(false).await?;
        let err = match console.execute(&mut program).await {
            Ok(()) => return Ok(program),
            Err(err) if err.is_relaunchable() && !console.is_privileged() => err,
            Err(err) => return Err(err),
        };

        let console = self.escalate(pristine.command(), err).await?;
        let mut program = pristine;
        console.execute(&mut program).await?;
        self.relaunched(program.command());
        Ok(program)
    }

    /// Runs an asynchronous program to completion. Every attempt is a full
    /// execution with its own start and end notifications.
    pub async fn execute_async<P>(&self, program: P, cancel: &CancellationToken) -> Result<P>
    where
        P: AsyncProgram + Clone,
    {
        let pristine = program.clone();
        let mut program = program;
        let console = self.engine.get_console(false).await?;
        let err = match console.execute_async(&mut program, cancel).await {
            Ok(()) => return Ok(program),
            Err(err) if err.is_relaunchable() && !console.is_privileged() => err,
            Err(err) => return Err(err),
        };
        if cancel.is_cancelled() {
            return Err(err);
        }

        let console = self.escalate(pristine.command(), err).await?;
        let mut program = pristine;
        console.execute_async(&mut program, cancel).await?;
        self.relaunched(program.command());
        Ok(program)
    }

    /// Asks the prompt and obtains a privileged console. A declined prompt
    /// returns the original failure.
    async fn escalate(
        &self,
        command: &CommandLine,
        cause: FmshErr,
    ) -> Result<Arc<Console>> {
        info!(command = %command.preview(), "relaunchable failure: {cause}");
        self.engine.publish(EngineEvent::RelaunchRequested {
            command: command.preview(),
        });
        if !self.prompt.confirm_escalation(command, &cause).await {
            return Err(cause);
        }
        self.engine
            .get_console(true)
            .await
            .map_err(|err| FmshErr::RelaunchFailed {
                source: Box::new(err),
            })
    }

    fn relaunched(&self, command: &CommandLine) {
        info!(command = %command.preview(), "relaunched on a privileged console");
        self.engine.publish(EngineEvent::Relaunched {
            command: command.preview(),
        });
    }
}
