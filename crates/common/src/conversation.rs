//! Conversation turns as received from the chat client

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a structured message. Only text parts carry content the
/// pipeline reads; other part kinds (sources, step markers, files) are kept
/// but ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// Message body: plain text or a list of parts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single immutable turn of the conversation.
///
/// Accepts both `content` and the UI message field name `parts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub role: Role,

    #[serde(alias = "parts")]
    pub content: MessageContent,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Flattened text of the turn; text parts are joined by a single space.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// True when the turn carries no readable text
    pub fn is_blank(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// Text of the most recent non-blank user turn
pub fn last_user_utterance(turns: &[ConversationTurn]) -> Option<String> {
    turns
        .iter()
        .rev()
        .filter(|turn| turn.role == Role::User)
        .map(|turn| turn.text().trim().to_string())
        .find(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_content() {
        let turn: ConversationTurn = serde_json::from_str(
            r#"{"role":"user","content":"What is the punishment for copyright infringement?"}"#,
        )
        .unwrap();
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.text(), "What is the punishment for copyright infringement?");
    }

    #[test]
    fn test_ui_message_parts() {
        let turn: ConversationTurn = serde_json::from_str(
            r#"{
                "id": "msg-1",
                "role": "assistant",
                "parts": [
                    {"type": "step-start"},
                    {"type": "text", "text": "Under the Copyright Ordinance"},
                    {"type": "source-url", "sourceId": "clic-1-0", "url": "https://clic.org.hk"},
                    {"type": "text", "text": "infringement is an offence."}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.text(), "Under the Copyright Ordinance infringement is an offence.");
    }

    #[test]
    fn test_last_user_utterance_skips_blank_turns() {
        let turns = vec![
            ConversationTurn::user("Can my landlord keep the deposit?"),
            ConversationTurn::assistant("It depends on the tenancy agreement."),
            ConversationTurn::user("   "),
        ];
        assert_eq!(
            last_user_utterance(&turns).as_deref(),
            Some("Can my landlord keep the deposit?")
        );
        assert_eq!(last_user_utterance(&[]), None);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let parsed = serde_json::from_str::<ConversationTurn>(r#"{"role":"tool","content":"x"}"#);
        assert!(parsed.is_err());
    }
}
