//! Conversation history sent as context on every completion request

use chrono::{DateTime, Utc};
use strum::{AsRefStr, Display, EnumString};

/// Author of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A file carried inline with a user turn.
///
/// Only the MIME type and the encoded bytes travel to the remote API; the
/// display name stays local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAttachment {
    pub mime_type: String,
    pub data_base64: String,
    pub display_name: Option<String>,
}

impl InlineAttachment {
    pub fn new(mime_type: impl Into<String>, data_base64: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data_base64: data_base64.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// One message unit in the conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    role: Role,
    content: String,
    attachment: Option<InlineAttachment>,
    timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>, attachment: Option<InlineAttachment>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachment,
            timestamp: Utc::now(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
            attachment: None,
            timestamp: Utc::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attachment(&self) -> Option<&InlineAttachment> {
        self.attachment.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Ordered, append-only log of turns for the current session
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Reset to empty. Only reachable through an explicit user action.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }
}

impl<'a> IntoIterator for &'a ConversationHistory {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let mut history = ConversationHistory::new();
        history.push(Turn::user("Hello", None));
        history.push(Turn::model("**Hi** there"));
        history.push(Turn::user("Again", None));

        let roles: Vec<Role> = history.iter().map(Turn::role).collect();
        assert_eq!(roles, vec![Role::User, Role::Model, Role::User]);
        assert_eq!(history.last().map(Turn::content), Some("Again"));
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut history = ConversationHistory::new();
        history.push(Turn::user("Hello", None));
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.len(), 0);
    }

    #[test]
    fn role_names_match_wire_format() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Model.as_ref(), "model");
        assert_eq!("model".parse::<Role>().ok(), Some(Role::Model));
    }
}
