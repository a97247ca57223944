//! Event and session-key types for the session log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies a session: (application, user, session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app: String,
    pub user: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(
        app: impl Into<String>,
        user: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            session: session.into(),
        }
    }

    /// A key with a freshly generated session id.
    pub fn generate(app: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(app, user, Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app, self.user, self.session)
    }
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Tool,
}

/// One piece of event content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Data { value: Value },
}

/// An entry in a session's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub author: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp: DateTime<Utc>,
    /// Final response of a run. Exactly one per run.
    pub terminal: bool,
    /// Suppressed events stay in the log but are not shown to the caller.
    pub visible: bool,
    /// Set on events that report a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(author: impl Into<String>, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: author.into(),
            role,
            parts,
            timestamp: Utc::now(),
            terminal: false,
            visible: true,
            error: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", Role::User, vec![Part::Text { text: text.into() }])
    }

    /// Agent output carrying a structured payload.
    pub fn agent(author: impl Into<String>, value: Value) -> Self {
        Self::new(author, Role::Agent, vec![Part::Data { value }])
    }

    /// An event reporting a failure. Mark it [`terminal`](Self::terminal) when it ends a run.
    pub fn error(author: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut event = Self::new(
            author,
            Role::Agent,
            vec![Part::Text {
                text: message.clone(),
            }],
        );
        event.error = Some(message);
        event
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn suppressed(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// All text parts, joined by newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                Part::Data { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The first structured payload, if any.
    pub fn data(&self) -> Option<&Value> {
        self.parts.iter().find_map(|part| match part {
            Part::Data { value } => Some(value),
            Part::Text { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_error_event() {
        let event = Event::error("runner", "boom").terminal();
        assert!(event.terminal);
        assert!(event.visible);
        assert!(event.is_error());
        assert_eq!(event.text(), "boom");
    }

    #[test]
    fn agent_event_exposes_payload() {
        let event = Event::agent("classifier", json!({"items": [1, 2, 3]})).suppressed();
        assert!(!event.visible);
        assert_eq!(event.data(), Some(&json!({"items": [1, 2, 3]})));
        assert_eq!(event.text(), "");
    }

    #[test]
    fn part_serializes_with_type_tag() {
        let part = Part::Text { text: "hi".into() };
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            json!({"type": "text", "text": "hi"})
        );
    }

    #[test]
    fn key_display() {
        let key = SessionKey::new("app", "u1", "s1");
        assert_eq!(key.to_string(), "app/u1/s1");
    }
}
