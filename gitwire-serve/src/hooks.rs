//! Hook callbacks consulted while receiving a push.

use bstr::BString;
use gitwire_protocol::push::CommandUpdate;

/// Decisions a server operator can wire into the receive flow.
///
/// `Err` values carry a message relayed to the client; `pre_receive`
/// refuses the batch as a whole, `update` refuses a single command.
pub trait Hooks {
    /// Called once with the full accepted command list before anything is
    /// applied.
    fn pre_receive(
        &mut self,
        commands: &[CommandUpdate],
        push_options: &[BString],
    ) -> Result<(), String> {
        let _ = (commands, push_options);
        Ok(())
    }

    /// Called per command just before it is applied.
    fn update(&mut self, command: &CommandUpdate) -> Result<(), String> {
        let _ = command;
        Ok(())
    }

    /// Called once with the commands that were applied.
    fn post_receive(&mut self, applied: &[CommandUpdate]) {
        let _ = applied;
    }
}

/// Hooks that always accept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}
