//! Conversations and turns

use serde::{Deserialize, Serialize};

/// Unique conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Message role in a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// User input
    User,
    /// Model output
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One request within a conversation.
///
/// Turn content is frozen at dataset generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Message role (user for requests sent to the endpoint)
    pub role: Role,

    /// Prompt text
    pub text: String,

    /// Pre-tokenized prompt, when the source provides ids directly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_ids: Option<Vec<u32>>,

    /// Image attachment (URL or base64 payload)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Audio attachment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,

    /// Video attachment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,

    /// Generation cap for this turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Generation floor for this turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_tokens: Option<u32>,

    /// Ask the server to keep generating past EOS up to `max_tokens`
    #[serde(default)]
    pub ignore_eos: bool,

    /// Per-turn model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Think-time to apply before the *next* turn is sent, in milliseconds.
    /// The first turn of a conversation never has a pre-delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_after_ms: Option<u64>,
}

impl Turn {
    /// Create a plain user turn with the given text
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            input_ids: None,
            image: None,
            audio: None,
            video: None,
            max_tokens: None,
            min_tokens: None,
            ignore_eos: false,
            model: None,
            delay_after_ms: None,
        }
    }

    /// Set the generation cap
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A session of one or more ordered turns.
///
/// Immutable after dataset finalization; shared read-only across services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier
    pub id: ConversationId,

    /// Sequential session number assigned at dataset finalization
    pub session_num: usize,

    /// Ordered turns
    pub turns: Vec<Turn>,

    /// Wall-clock offset for fixed-schedule (trace replay) mode, in
    /// milliseconds from the trace origin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

impl Conversation {
    /// Create a single-turn conversation
    pub fn single_turn(id: impl Into<ConversationId>, session_num: usize, turn: Turn) -> Self {
        Self {
            id: id.into(),
            session_num,
            turns: vec![turn],
            timestamp_ms: None,
        }
    }

    /// Number of turns
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}
