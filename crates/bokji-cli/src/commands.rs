//! Slash commands for interactive mode

use crate::session::Session;

/// Result of executing a slash command
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Forget the conversation
    Clear,
    /// Show a message to the user (not sent to the pipeline)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command. `None` for ordinary utterances.
pub fn execute_command(input: &str, session: &Session) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;
    let command = rest.split_whitespace().next().unwrap_or_default().to_lowercase();

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),
        "clear" | "c" => CommandResult::Clear,
        "quit" | "exit" | "q" => CommandResult::Exit,
        "summary" => CommandResult::Message(
            session
                .rolling_summary()
                .map(|s| format!("Rolling summary:\n{s}"))
                .unwrap_or_else(|| "No rolling summary yet.".to_string()),
        ),
        "session" | "s" => {
            let (user, assistant, tool) = session.message_counts();
            CommandResult::Message(format!(
                "user: {}\nturns: {}\nmessages: {user} user, {assistant} assistant, {tool} bookkeeping",
                session.user_id(),
                session.turn_count(),
            ))
        }
        _ => CommandResult::Unknown(command),
    })
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /summary             Show the rolling summary
  /session, /s         Show turn and message counts
  /clear, /c           Forget the conversation (profile and facts stay stored)
  /quit, /exit, /q     Exit bokji"#
        .to_string()
}
