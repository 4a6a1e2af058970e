//! Chat history attached to generation nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expr::Expr;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A rendered message as sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// An unevaluated history turn; `content` is evaluated per lane to text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: Expr,
}

/// Builder for the turns that precede a generation node's prompt.
///
/// ```ignore
/// let history = ChatHistory::new()
///     .system("You are a terse assistant.")
///     .user("Name a colour.")
///     .assistant(Expr::constant("Blue."));
/// let gen = GenNode::new("Name another one, unlike {{previous}}.").history(history);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(mut self, role: Role, content: impl Into<Expr>) -> Self {
        self.turns.push(ChatTurn {
            role,
            content: content.into(),
        });
        self
    }

    /// System message rendered as a template.
    pub fn system(self, template: impl Into<String>) -> Self {
        self.turn(Role::System, Expr::template(template))
    }

    /// User message rendered as a template.
    pub fn user(self, template: impl Into<String>) -> Self {
        self.turn(Role::User, Expr::template(template))
    }

    /// Assistant message; usually the output of an earlier generation.
    pub fn assistant(self, content: impl Into<Expr>) -> Self {
        self.turn(Role::Assistant, content)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl From<ChatHistory> for Vec<ChatTurn> {
    fn from(history: ChatHistory) -> Self {
        history.turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_turn_order() {
        let turns: Vec<ChatTurn> = ChatHistory::new()
            .system("sys")
            .user("hi {{name}}")
            .assistant(Expr::constant("hello"))
            .into();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::System.to_string(), "system");
    }
}
