//! Prompt construction for the relay.

use crate::model::InboundMessage;

/// Turns an inbound message into the text handed to the relay program.
pub trait PromptBuilder: Send + Sync {
    /// `continuing` is true when the conversation already has a session.
    fn build(&self, message: &InboundMessage, continuing: bool) -> String;

    /// Whether this channel keeps sessions at all. Channels that always send
    /// full context return `false` and never get `--continue`.
    fn uses_sessions(&self) -> bool {
        true
    }

    /// Identity used for session affinity. Sessions follow the person, not
    /// the thread.
    fn session_key(&self, message: &InboundMessage) -> String {
        message.author.id.clone()
    }
}

/// A fixed preamble followed by the message text, raw text when continuing.
#[derive(Debug, Clone)]
pub struct PreamblePrompt {
    preamble: String,
}

impl PreamblePrompt {
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
        }
    }
}

impl PromptBuilder for PreamblePrompt {
    fn build(&self, message: &InboundMessage, continuing: bool) -> String {
        if continuing {
            return message.text.clone();
        }
        format!(
            "{}\n\nMessage from {}:\n{}",
            self.preamble.trim_end(),
            message.author.name,
            message.text
        )
    }
}
