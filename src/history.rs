use serde::{Deserialize, Serialize};

/// Who authored a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One role-tagged text entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: Role::Tool, content: content.into() }
    }
}

/// Append-only transcript of one run.
///
/// Entries are never reordered or rewritten. The optional window bounds the
/// assembled prompt, not the stored log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    window: Option<usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound prompt assembly to the `window` most recent entries.
    pub fn with_window(window: usize) -> Self {
        Self { messages: Vec::new(), window: Some(window) }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Assemble the model prompt: system prompt, task, then the transcript
    /// in original order (windowed to the most recent entries when bounded).
    pub fn build_prompt(&self, system_prompt: &str, task: &str) -> Vec<Message> {
        let tail = match self.window {
            Some(n) if self.messages.len() > n => &self.messages[self.messages.len() - n..],
            _ => &self.messages[..],
        };
        let mut prompt = Vec::with_capacity(tail.len() + 2);
        prompt.push(Message::system(system_prompt));
        prompt.push(Message::user(format!("Task: {task}\n\nBegin working on the task.")));
        prompt.extend_from_slice(tail);
        prompt
    }
}
