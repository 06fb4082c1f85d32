/// Slash commands understood by the chat REPL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    New,
    Sessions,
    Exit,
    Unknown(String),
}

pub const HELP_TEXT: &str = "\
/help      show this help
/new       start a new session
/sessions  list saved sessions
/exit      leave the chat (/quit also works)
Ctrl+C cancels the reply in progress.";

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let command = trimmed
        .split_whitespace()
        .next()
        .unwrap_or(trimmed)
        .to_string();

    let parsed = match command.as_str() {
        "/help" => SlashCommand::Help,
        "/new" => SlashCommand::New,
        "/sessions" => SlashCommand::Sessions,
        "/exit" | "/quit" => SlashCommand::Exit,
        _ => SlashCommand::Unknown(command),
    };

    Some(parsed)
}
