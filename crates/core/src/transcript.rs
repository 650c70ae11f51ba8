//! The ordered, append-only message history of a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The remote conversational counterpart (the simulated patient).
    Counterpart,
    /// The human operator (the therapist).
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message stamped now. Returns `None` if `text` is blank.
    pub fn new(sender: Sender, text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::new_v4().to_string(),
            sender,
            text: text.to_string(),
            timestamp: Utc::now(),
        })
    }
}

/// Messages are only ever appended; nothing here hands out mutable access.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_is_trimmed() {
        let message = Message::new(Sender::Operator, "  hola  ").unwrap();
        assert_eq!(message.text, "hola");
        assert_eq!(message.sender, Sender::Operator);
    }

    #[test]
    fn test_blank_message_is_rejected() {
        assert!(Message::new(Sender::Operator, "   \n\t").is_none());
        assert!(Message::new(Sender::Counterpart, "").is_none());
    }

    #[test]
    fn test_transcript_preserves_order() {
        let mut transcript = Transcript::new();
        transcript.push(Message::new(Sender::Operator, "hola").unwrap());
        transcript.push(Message::new(Sender::Counterpart, "buenas").unwrap());

        let senders: Vec<Sender> = transcript.messages().iter().map(|m| m.sender).collect();
        assert_eq!(senders, vec![Sender::Operator, Sender::Counterpart]);
        assert_eq!(transcript.last().unwrap().text, "buenas");
    }

    #[test]
    fn test_sender_serialization() {
        assert_eq!(
            serde_json::to_string(&Sender::Counterpart).unwrap(),
            "\"counterpart\""
        );
        assert_eq!(serde_json::to_string(&Sender::Operator).unwrap(), "\"operator\"");
    }
}
