//! Chat lifecycle and messaging on top of a document backend

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use charla_document::document::{
    with_timeout, DocumentBackend, DocumentId, DocumentStore, DocumentStoreError, IndexSpec,
    IndexStats, RegisterOutcome, UpdateOperation,
};

use super::analytics::Analytics;
use super::model::{Chat, Message, ModerationState, Participant, Report};
use super::schema::{builtin_indexes, chats_schema, messages_schema, CHATS, MESSAGES};
use crate::config::Config;
use crate::error::{CharlaError, Result};

/// Chats and messages to preload, as a JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    /// Chats, created first
    pub chats: Vec<Chat>,
    /// Messages, sent in order
    pub messages: Vec<Message>,
}

impl Fixtures {
    /// Read fixtures from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Chat store
///
/// Owns the `chats` and `messages` collections of a backend. Every backend
/// call runs under the configured query timeout.
#[derive(Clone)]
pub struct ChatStore {
    backend: Arc<dyn DocumentBackend>,
    query_timeout: Duration,
}

impl ChatStore {
    /// Open an in-memory store configured by `config`
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn DocumentBackend> =
            Arc::new(DocumentStore::new(config.store.document_store()));
        Self::with_backend(backend, config.store.query_timeout, &config.indexes).await
    }

    /// Use an existing backend, creating collections and indexes it lacks
    pub async fn with_backend(
        backend: Arc<dyn DocumentBackend>,
        query_timeout: Duration,
        extra_indexes: &[IndexSpec],
    ) -> Result<Self> {
        let store = Self {
            backend,
            query_timeout,
        };

        for (name, schema) in [(CHATS, chats_schema()), (MESSAGES, messages_schema())] {
            match store.timed(store.backend.create_collection(name, schema)).await {
                Ok(()) | Err(CharlaError::Store(DocumentStoreError::CollectionExists(_))) => {}
                Err(e) => return Err(e),
            }
        }

        let specs = builtin_indexes()
            .into_iter()
            .chain(extra_indexes.iter().cloned());
        let created = store
            .ensure_indexes(specs)
            .await?
            .into_iter()
            .filter(|outcome| *outcome == RegisterOutcome::Created)
            .count();

        info!(indexes_created = created, "chat store ready");
        Ok(store)
    }

    /// Underlying backend
    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Timeout applied to each backend call
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Read side of the store
    pub fn analytics(&self) -> Analytics {
        Analytics::new(Arc::clone(&self.backend), self.query_timeout)
    }

    /// Register indexes; already registered identical specs are left alone
    pub async fn ensure_indexes(
        &self,
        specs: impl IntoIterator<Item = IndexSpec>,
    ) -> Result<Vec<RegisterOutcome>> {
        let mut outcomes = Vec::new();
        for spec in specs {
            outcomes.push(self.timed(self.backend.create_index(spec)).await?);
        }
        Ok(outcomes)
    }

    /// Index specifications of both collections
    pub async fn list_indexes(&self) -> Result<Vec<IndexSpec>> {
        let mut specs = self.timed(self.backend.list_indexes(CHATS)).await?;
        specs.extend(self.timed(self.backend.list_indexes(MESSAGES)).await?);
        Ok(specs)
    }

    /// Index statistics, by collection
    pub async fn index_stats(&self) -> Result<BTreeMap<&'static str, Vec<IndexStats>>> {
        let mut stats = BTreeMap::new();
        for collection in [CHATS, MESSAGES] {
            stats.insert(collection, self.timed(self.backend.index_stats(collection)).await?);
        }
        Ok(stats)
    }

    /// Create a chat
    ///
    /// Statistics always start empty; `send_message` maintains them.
    pub async fn create_chat(&self, chat: &Chat) -> Result<()> {
        chat.validate()?;

        let document = serde_json::to_value(Chat {
            stats: Default::default(),
            ..chat.clone()
        })?;

        self.timed(self.backend.insert(CHATS, document)).await?;
        info!(chat = %chat.id, participants = chat.participants.len(), "chat created");
        Ok(())
    }

    /// Fetch a chat
    pub async fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        let doc = self.timed(self.backend.get(CHATS, &key(id))).await?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_value(doc.data.clone())?)),
            None => Ok(None),
        }
    }

    /// Add a participant; the alias must be new to the chat
    pub async fn add_participant(&self, chat_id: &str, participant: Participant) -> Result<Chat> {
        if participant.alias.is_empty() {
            return Err(DocumentStoreError::ValidationError(
                "participant alias cannot be empty".into(),
            )
            .into());
        }

        let update =
            UpdateOperation::new().push("participants", serde_json::to_value(&participant)?);
        let chat = self.update_chat(chat_id, &update).await?;
        debug!(chat = chat_id, alias = %participant.alias, "participant added");
        Ok(chat)
    }

    /// Mark a participant inactive; they keep their alias
    pub async fn deactivate_participant(&self, chat_id: &str, alias: &str) -> Result<Chat> {
        self.set_participant_active(chat_id, alias, false).await
    }

    /// Let an inactive participant post again
    pub async fn reactivate_participant(&self, chat_id: &str, alias: &str) -> Result<Chat> {
        self.set_participant_active(chat_id, alias, true).await
    }

    async fn set_participant_active(
        &self,
        chat_id: &str,
        alias: &str,
        active: bool,
    ) -> Result<Chat> {
        let update =
            UpdateOperation::new().set_where("participants", "alias", alias, "active", active);
        let chat = self.update_chat(chat_id, &update).await?;
        debug!(chat = chat_id, alias, active, "participant state changed");
        Ok(chat)
    }

    async fn update_chat(&self, chat_id: &str, update: &UpdateOperation) -> Result<Chat> {
        let doc = self
            .timed(self.backend.update(CHATS, &key(chat_id), update))
            .await?;
        Ok(serde_json::from_value(doc.data.clone())?)
    }

    /// Post a message and update the chat statistics
    ///
    /// The sender must be an active participant. A private recipient must be
    /// a participant.
    ///
    /// The message insert and the statistics update are two separate writes.
    /// Resending a message that is already stored with the same chat, sender,
    /// recipient, time and content returns its id and leaves the statistics
    /// alone; reusing the id for a different message is a validation error.
    pub async fn send_message(&self, message: &Message) -> Result<DocumentId> {
        message.validate()?;

        if let Some(stored) = self.get_message(&message.id).await? {
            if is_resend(&stored, message) {
                debug!(message = %message.id, "message already stored");
                return Ok(key(&message.id));
            }
            return Err(DocumentStoreError::ValidationError(format!(
                "message id {} is already used by another message",
                message.id
            ))
            .into());
        }

        let chat = self.get_chat(&message.chat_id).await?.ok_or_else(|| {
            DocumentStoreError::DocumentNotFound(format!("chat {}", message.chat_id))
        })?;

        if !chat.is_active_participant(&message.sender) {
            return Err(DocumentStoreError::ValidationError(format!(
                "{} is not an active participant of chat {}",
                message.sender, chat.id
            ))
            .into());
        }
        if let Some(recipient) = &message.recipient {
            if chat.participant(recipient).is_none() {
                return Err(DocumentStoreError::ValidationError(format!(
                    "{} is not a participant of chat {}",
                    recipient, chat.id
                ))
                .into());
            }
        }

        let id = self
            .timed(self.backend.insert(MESSAGES, serde_json::to_value(message)?))
            .await?;

        let stats = UpdateOperation::new()
            .max("stats.last_message", message.timestamp.timestamp_millis())
            .inc("stats.total_messages", 1u64);
        self.update_chat(&chat.id, &stats).await?;

        debug!(
            chat = %chat.id,
            message = %id,
            sender = %message.sender,
            kind = %message.content.kind(),
            "message sent"
        );
        Ok(id)
    }

    /// Fetch a message
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let doc = self.timed(self.backend.get(MESSAGES, &key(id))).await?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_value(doc.data.clone())?)),
            None => Ok(None),
        }
    }

    /// Record a like; liking twice has no further effect
    pub async fn like_message(&self, id: &str, alias: &str) -> Result<Message> {
        let update = UpdateOperation::new().add_to_set("interactions.likes", alias);
        self.update_message(id, &update).await
    }

    /// File a report; an identical report is stored once
    pub async fn report_message(&self, id: &str, report: &Report) -> Result<Message> {
        let update = UpdateOperation::new()
            .add_to_set("interactions.reports", serde_json::to_value(report)?);
        let message = self.update_message(id, &update).await?;
        info!(
            message = id,
            reporter = %report.reporter,
            reports = message.report_count(),
            "message reported"
        );
        Ok(message)
    }

    /// Move a message to another moderation state
    ///
    /// Fails with a validation error when leaving `Removed` or when the state
    /// changed concurrently.
    pub async fn moderate_message(&self, id: &str, next: ModerationState) -> Result<Message> {
        let current = self
            .get_message(id)
            .await?
            .ok_or_else(|| DocumentStoreError::DocumentNotFound(format!("message {}", id)))?;

        if !current.state.can_transition_to(next) {
            return Err(DocumentStoreError::ValidationError(format!(
                "message {} cannot move from {} to {}",
                id, current.state, next
            ))
            .into());
        }

        let update = UpdateOperation::new()
            .require("state", current.state.as_str())
            .set("state", next.as_str());
        let message = self.update_message(id, &update).await?;
        info!(message = id, from = %current.state, to = %next, "message moderated");
        Ok(message)
    }

    async fn update_message(&self, id: &str, update: &UpdateOperation) -> Result<Message> {
        let doc = self
            .timed(self.backend.update(MESSAGES, &key(id), update))
            .await?;
        Ok(serde_json::from_value(doc.data.clone())?)
    }

    /// Create the fixture chats, then send the fixture messages in order
    pub async fn load_fixtures(&self, fixtures: &Fixtures) -> Result<()> {
        for chat in &fixtures.chats {
            self.create_chat(chat).await?;
        }
        for message in &fixtures.messages {
            self.send_message(message).await?;
        }
        info!(
            chats = fixtures.chats.len(),
            messages = fixtures.messages.len(),
            "fixtures loaded"
        );
        Ok(())
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, DocumentStoreError>>,
    {
        Ok(with_timeout(self.query_timeout, fut).await?)
    }
}

fn is_resend(stored: &Message, message: &Message) -> bool {
    stored.chat_id == message.chat_id
        && stored.message_type == message.message_type
        && stored.sender == message.sender
        && stored.recipient == message.recipient
        && stored.timestamp.timestamp_millis() == message.timestamp.timestamp_millis()
        && stored.content == message.content
}

fn key(id: &str) -> DocumentId {
    DocumentId::String(id.to_string())
}
