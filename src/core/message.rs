#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
/// Role of a message in a chat conversation.
pub enum Role {
    /// System messages provide instructions to the model.
    System,
    /// User messages are sent from the user to the model.
    User,
    /// Assistant messages are responses from the model.
    Assistant,
}

impl Role {
    /// Returns the string representation of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// An individual message in a chat.
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    /// Create a message with an explicit role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a new system message.
    ///
    /// System messages replace the model's default preamble.
    /// It's not recommended to use more than one of these in a given chat.
    pub fn system(content: &str) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a new user message.
    pub fn user(content: &str) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    ///
    /// Assistant messages are used to store responses from the model.
    pub fn assistant(content: &str) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Get the role of the message.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the content of the message.
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Trait extension for Vec<Message> that provides convenient methods for
/// accessing common message types without verbose iterator chains.
pub trait MessageVecExt {
    /// Content of the last user message in the conversation, if any.
    fn last_user(&self) -> Option<&str>;

    /// Content of the last assistant message in the conversation, if any.
    fn last_assistant(&self) -> Option<&str>;

    /// Content of the first system message in the conversation, if any.
    fn system(&self) -> Option<&str>;
}

impl<T: AsRef<[Message]>> MessageVecExt for T {
    fn last_user(&self) -> Option<&str> {
        self.as_ref()
            .iter()
            .rev()
            .find(|message| message.role() == Role::User)
            .map(|msg| msg.content())
    }

    fn last_assistant(&self) -> Option<&str> {
        self.as_ref()
            .iter()
            .rev()
            .find(|message| message.role() == Role::Assistant)
            .map(|msg| msg.content())
    }

    fn system(&self) -> Option<&str> {
        self.as_ref()
            .iter()
            .find(|message| message.role() == Role::System)
            .map(|msg| msg.content())
    }
}
