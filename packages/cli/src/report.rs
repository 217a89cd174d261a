// ABOUTME: Turns command failures into the message printed to the user
// ABOUTME: Infrastructure errors are logged in full and shown only in sanitized form

use boxcode_sandbox::SandboxError;
use tracing::error;

/// Message for the terminal. When the chain carries an infrastructure
/// [`SandboxError`] the full chain goes to the log and the user sees the
/// outermost context plus the sanitized message.
pub fn user_facing(err: &anyhow::Error) -> String {
    let Some(sandbox) = err.chain().find_map(|c| c.downcast_ref::<SandboxError>()) else {
        return format!("{:#}", err);
    };
    if !sandbox.is_infrastructure() {
        return format!("{:#}", err);
    }

    error!("Command failed: {:#}", err);

    // A bare sandbox error has no context message to keep
    let bare = err
        .chain()
        .next()
        .is_some_and(|outermost| outermost.is::<SandboxError>());
    if bare {
        sandbox.user_message()
    } else {
        format!("{}: {}", err, sandbox.user_message())
    }
}
