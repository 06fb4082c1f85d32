//! Line-based chat REPL with streamed replies and persisted turns.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use agent_provider::{
    collect_completion, CancelSignal, ChatMessage, ChatRole, CompletionError, CompletionProvider,
    CompletionRequest,
};
use session_store::{SessionEntryKind, SessionSelector, SessionStore, SessionStoreError};

use crate::agent::AgentError;
use crate::cancel;
use crate::commands::{parse_slash_command, SlashCommand, HELP_TEXT};
use crate::providers::RequestIds;
use crate::render::render_session_list;

const CHAT_SYSTEM_PROMPT: &str = "You are a concise coding assistant working in the user's \
terminal. Answer questions about their code; do not claim to have run anything.";

pub struct ChatRepl<'a, R, W> {
    provider: &'a dyn CompletionProvider,
    request_ids: &'a RequestIds,
    cancel: CancelSignal,
    model: Option<String>,
    session_root: PathBuf,
    cwd: PathBuf,
    store: SessionStore,
    input: R,
    output: W,
}

impl<'a, R: BufRead, W: Write> ChatRepl<'a, R, W> {
    /// Resumes the latest session under `session_root` unless `fresh`, or
    /// when there is none.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        provider: &'a dyn CompletionProvider,
        request_ids: &'a RequestIds,
        cancel: CancelSignal,
        model: Option<String>,
        session_root: &Path,
        cwd: &Path,
        fresh: bool,
        input: R,
        output: W,
    ) -> Result<Self, SessionStoreError> {
        let store = if fresh {
            SessionStore::create_in(session_root, cwd)?
        } else {
            match SessionStore::load(session_root, &SessionSelector::Latest) {
                Ok(store) => store,
                Err(SessionStoreError::NoSessionsFound { .. }) => {
                    SessionStore::create_in(session_root, cwd)?
                }
                Err(error) => return Err(error),
            }
        };

        Ok(Self {
            provider,
            request_ids,
            cancel,
            model,
            session_root: session_root.to_path_buf(),
            cwd: cwd.to_path_buf(),
            store,
            input,
            output,
        })
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Reads lines until `/exit` or end of input.
    pub fn run(&mut self) -> Result<(), AgentError> {
        self.banner()?;

        loop {
            write!(self.output, "> ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_slash_command(line) {
                Some(SlashCommand::Help) => writeln!(self.output, "{HELP_TEXT}")?,
                Some(SlashCommand::New) => {
                    self.store = SessionStore::create_in(&self.session_root, &self.cwd)?;
                    self.banner()?;
                }
                Some(SlashCommand::Sessions) => {
                    let sessions = SessionStore::list(&self.session_root)?;
                    write!(self.output, "{}", render_session_list(&sessions))?;
                }
                Some(SlashCommand::Exit) => return Ok(()),
                Some(SlashCommand::Unknown(command)) => {
                    writeln!(self.output, "Unknown command {command}. Try /help.")?;
                }
                None => self.turn(line)?,
            }
        }
    }

    fn banner(&mut self) -> Result<(), AgentError> {
        let resumed = self.store.session().chat.len();
        if resumed == 0 {
            writeln!(self.output, "Session {}. /help for commands.", self.store.id())?;
        } else {
            writeln!(
                self.output,
                "Resumed session {} ({resumed} earlier messages). /help for commands.",
                self.store.id()
            )?;
        }
        Ok(())
    }

    fn turn(&mut self, text: &str) -> Result<(), AgentError> {
        cancel::reset(&self.cancel);
        self.store.append(SessionEntryKind::ChatTurn {
            role: ChatRole::User,
            content: text.to_string(),
        })?;

        let mut messages = vec![ChatMessage::system(CHAT_SYSTEM_PROMPT)];
        messages.extend(self.store.session().chat.iter().cloned());
        let request = CompletionRequest::new(self.request_ids.next(), messages)
            .with_model(self.model.clone());

        let output = &mut self.output;
        let mut stream_error: Option<std::io::Error> = None;
        let reply = collect_completion(self.provider, request, self.cancel.clone(), &mut |chunk| {
            if stream_error.is_none() {
                stream_error = write!(output, "{chunk}").and_then(|()| output.flush()).err();
            }
        });
        if let Some(error) = stream_error {
            return Err(error.into());
        }
        writeln!(self.output)?;

        match reply {
            Ok(reply) => {
                self.store.append(SessionEntryKind::ChatTurn {
                    role: ChatRole::Assistant,
                    content: reply,
                })?;
            }
            Err(CompletionError::Cancelled) => {
                cancel::reset(&self.cancel);
                writeln!(self.output, "[cancelled]")?;
            }
            Err(error) => writeln!(self.output, "error: {error}")?,
        }
        Ok(())
    }
}
