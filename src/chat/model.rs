//! Chat and message records
//!
//! These are the typed views of the documents stored in the `chats` and
//! `messages` collections. Timestamps are stored as epoch milliseconds.

use std::collections::BTreeSet;
use std::fmt;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use charla_document::document::DocumentStoreError;

/// A chat room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat id
    #[serde(rename = "_id")]
    pub id: String,
    /// Creation time
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Participants, unique by alias
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Running statistics
    #[serde(default)]
    pub stats: ChatStats,
}

impl Chat {
    /// Create an empty chat
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            participants: Vec::new(),
            stats: ChatStats::default(),
        }
    }

    /// Add a participant
    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    /// Look up a participant by alias
    pub fn participant(&self, alias: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.alias == alias)
    }

    /// Whether `alias` is a participant that can still post
    pub fn is_active_participant(&self, alias: &str) -> bool {
        self.participant(alias).is_some_and(|p| p.active)
    }

    /// Reject duplicate or empty aliases
    pub fn validate(&self) -> Result<(), DocumentStoreError> {
        if self.id.is_empty() {
            return Err(DocumentStoreError::ValidationError(
                "chat id cannot be empty".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for participant in &self.participants {
            if participant.alias.is_empty() {
                return Err(DocumentStoreError::ValidationError(
                    "participant alias cannot be empty".into(),
                ));
            }
            if !seen.insert(participant.alias.as_str()) {
                return Err(DocumentStoreError::ValidationError(format!(
                    "duplicate participant alias {:?} in chat {}",
                    participant.alias, self.id
                )));
            }
        }
        Ok(())
    }
}

/// Chat participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Alias, unique within a chat
    pub alias: String,
    /// Whether the participant can still post
    pub active: bool,
    /// Join time
    #[serde(with = "ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// Create an active participant
    pub fn new(alias: impl Into<String>, joined_at: DateTime<Utc>) -> Self {
        Self {
            alias: alias.into(),
            active: true,
            joined_at,
        }
    }
}

/// Per-chat statistics maintained on every send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    /// Time of the newest message
    #[serde(default, with = "ts_milliseconds_option")]
    pub last_message: Option<DateTime<Utc>>,
    /// Number of messages sent
    #[serde(default)]
    pub total_messages: u64,
}

/// Message visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Visible to every participant
    Public,
    /// Addressed to a single recipient
    Private,
}

impl MessageType {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Public => "public",
            MessageType::Private => "private",
        }
    }
}

/// Kind tag of a message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text
    Text,
    /// A proposal participants can vote on
    Proposal,
    /// A vote on a proposal
    Vote,
    /// A game or chat action
    Action,
}

impl ContentKind {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Proposal => "proposal",
            ContentKind::Vote => "vote",
            ContentKind::Action => "action",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Content {
    /// Plain text
    Text {
        /// Body
        text: String,
    },
    /// Proposal with its options
    Proposal {
        /// Proposal text
        text: String,
        /// Options to vote on
        #[serde(default)]
        options: Vec<String>,
    },
    /// Vote on a proposal
    Vote {
        /// Message id of the proposal
        proposal_id: String,
        /// Chosen option
        choice: String,
    },
    /// Action
    Action {
        /// Action name
        action: String,
        /// Alias the action targets
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl Content {
    /// Plain text content
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    /// Kind tag
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Text { .. } => ContentKind::Text,
            Content::Proposal { .. } => ContentKind::Proposal,
            Content::Vote { .. } => ContentKind::Vote,
            Content::Action { .. } => ContentKind::Action,
        }
    }
}

/// Moderation state of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationState {
    /// Visible
    #[default]
    Active,
    /// Hidden pending review
    Moderated,
    /// Removed for good
    Removed,
}

impl ModerationState {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationState::Active => "active",
            ModerationState::Moderated => "moderated",
            ModerationState::Removed => "removed",
        }
    }

    /// Whether a message in this state may move to `next`
    ///
    /// `Removed` is terminal. Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: ModerationState) -> bool {
        *self == next || *self != ModerationState::Removed
    }
}

impl fmt::Display for ModerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A report filed against a message
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Report {
    /// Alias of the reporter
    pub reporter: String,
    /// Free-form reason
    pub reason: String,
}

impl Report {
    /// Create a report
    pub fn new(reporter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reporter: reporter.into(),
            reason: reason.into(),
        }
    }
}

/// Likes and reports on a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interactions {
    /// Aliases that liked the message
    #[serde(default)]
    pub likes: BTreeSet<String>,
    /// Reports filed against the message
    #[serde(default)]
    pub reports: BTreeSet<Report>,
}

/// A message posted to a chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id
    #[serde(rename = "_id")]
    pub id: String,
    /// Chat the message belongs to
    pub chat_id: String,
    /// Visibility
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Alias of the sender
    pub sender: String,
    /// Alias of the recipient, private messages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Send time
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Body
    pub content: Content,
    /// Moderation state
    #[serde(default)]
    pub state: ModerationState,
    /// Likes and reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactions: Option<Interactions>,
}

impl Message {
    /// Create a public message with a fresh id
    pub fn public(
        chat_id: impl Into<String>,
        sender: impl Into<String>,
        timestamp: DateTime<Utc>,
        content: Content,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            message_type: MessageType::Public,
            sender: sender.into(),
            recipient: None,
            timestamp,
            content,
            state: ModerationState::Active,
            interactions: None,
        }
    }

    /// Create a private message with a fresh id
    pub fn private(
        chat_id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        timestamp: DateTime<Utc>,
        content: Content,
    ) -> Self {
        Self {
            message_type: MessageType::Private,
            recipient: Some(recipient.into()),
            ..Self::public(chat_id, sender, timestamp, content)
        }
    }

    /// Replace the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Number of likes
    pub fn like_count(&self) -> usize {
        self.interactions.as_ref().map_or(0, |i| i.likes.len())
    }

    /// Number of reports
    pub fn report_count(&self) -> usize {
        self.interactions.as_ref().map_or(0, |i| i.reports.len())
    }

    /// Check the recipient rules of the message type
    pub fn validate(&self) -> Result<(), DocumentStoreError> {
        if self.id.is_empty() || self.chat_id.is_empty() || self.sender.is_empty() {
            return Err(DocumentStoreError::ValidationError(
                "message id, chat_id and sender are required".into(),
            ));
        }

        match (self.message_type, self.recipient.as_deref()) {
            (MessageType::Public, None) => Ok(()),
            (MessageType::Public, Some(_)) => Err(DocumentStoreError::ValidationError(
                "public messages have no recipient".into(),
            )),
            (MessageType::Private, None) | (MessageType::Private, Some("")) => Err(
                DocumentStoreError::ValidationError("private messages need a recipient".into()),
            ),
            (MessageType::Private, Some(recipient)) if recipient == self.sender => {
                Err(DocumentStoreError::ValidationError(
                    "sender cannot message themselves privately".into(),
                ))
            }
            (MessageType::Private, Some(_)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_message_document_shape() {
        let message = Message::private("c1", "Seba", "Ana", at(2), Content::text("psst"))
            .with_id("m2");
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(
            value,
            json!({
                "_id": "m2",
                "chat_id": "c1",
                "type": "private",
                "sender": "Seba",
                "recipient": "Ana",
                "timestamp": 2,
                "content": { "kind": "text", "text": "psst" },
                "state": "active",
            })
        );

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_public_message_omits_recipient() {
        let message = Message::public("c1", "Ana", at(1), Content::text("hola"));
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("recipient").is_none());
        assert!(value.get("interactions").is_none());
    }

    #[test]
    fn test_message_validation() {
        let public = Message::public("c1", "Ana", at(1), Content::text("hola"));
        assert!(public.validate().is_ok());

        let mut addressed = public.clone();
        addressed.recipient = Some("Seba".into());
        assert!(addressed.validate().is_err());

        let private = Message::private("c1", "Ana", "Seba", at(1), Content::text("hola"));
        assert!(private.validate().is_ok());

        let mut unaddressed = private.clone();
        unaddressed.recipient = None;
        assert!(unaddressed.validate().is_err());

        let to_self = Message::private("c1", "Ana", "Ana", at(1), Content::text("hola"));
        assert!(to_self.validate().is_err());
    }

    #[test]
    fn test_content_kinds() {
        let vote: Content = serde_json::from_value(json!({
            "kind": "vote", "proposal_id": "m1", "choice": "si"
        }))
        .unwrap();
        assert_eq!(vote.kind(), ContentKind::Vote);

        let proposal: Content = serde_json::from_value(json!({
            "kind": "proposal", "text": "¿Revancha?"
        }))
        .unwrap();
        assert_eq!(proposal.kind(), ContentKind::Proposal);
        assert_eq!(
            serde_json::to_value(&proposal).unwrap(),
            json!({ "kind": "proposal", "text": "¿Revancha?", "options": [] })
        );
    }

    #[test]
    fn test_moderation_transitions() {
        use ModerationState::*;

        assert!(Active.can_transition_to(Moderated));
        assert!(Moderated.can_transition_to(Active));
        assert!(Moderated.can_transition_to(Removed));
        assert!(Removed.can_transition_to(Removed));
        assert!(!Removed.can_transition_to(Active));
        assert!(!Removed.can_transition_to(Moderated));
    }

    #[test]
    fn test_chat_rejects_duplicate_alias() {
        let chat = Chat::new("c1", at(0))
            .with_participant(Participant::new("Ana", at(0)))
            .with_participant(Participant::new("Ana", at(1)));
        assert!(matches!(
            chat.validate(),
            Err(DocumentStoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_chat_stats_default_to_empty() {
        let chat: Chat = serde_json::from_value(json!({
            "_id": "c1", "created_at": 0
        }))
        .unwrap();
        assert_eq!(chat.stats, ChatStats::default());
        assert!(chat.participants.is_empty());
    }
}
