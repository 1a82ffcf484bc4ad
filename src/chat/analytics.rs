//! Analytical queries over chats and messages
//!
//! Every query is an aggregation pipeline whose leading `$match` lets the
//! backend pick an index. Results are plain records in a fixed order.

use std::sync::Arc;
use std::time::Duration;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use charla_document::document::{
    aggregate, with_timeout, Accumulator, AggregateOptions, AggregationPipeline,
    CancellationHandle, DocumentBackend, DocumentQuery, Expression, GroupSpec, ProjectSpec,
    SortDirection,
};

use super::model::{Chat, ContentKind, Message, MessageType, ModerationState};
use super::schema::{CHATS, MESSAGES};
use crate::error::{CharlaError, Result};

use SortDirection::{Ascending, Descending};

/// One public message in a chat timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Send time
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Sender alias
    pub sender: String,
    /// Text body, absent for votes and actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Number of likes
    pub like_count: u64,
    /// Number of reports
    pub report_count: u64,
}

/// The sender with the most messages in a chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderActivity {
    /// Sender alias
    pub alias: String,
    /// Messages sent
    pub message_count: u64,
}

/// One private message sent or received by a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateThreadEntry {
    /// Send time
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Sender alias
    pub sender: String,
    /// Recipient alias
    pub recipient: String,
    /// Text body, absent for votes and actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Number of likes
    pub like_count: u64,
}

/// Public messages of a chat, oldest first, with interaction counts
pub fn timeline_pipeline(chat_id: &str) -> AggregationPipeline {
    AggregationPipeline::new()
        .filter(
            DocumentQuery::new()
                .eq("chat_id", chat_id)
                .eq("type", MessageType::Public.as_str()),
        )
        .sort(&[("timestamp", Ascending)])
        .project(
            ProjectSpec::new()
                .exclude("_id")
                .include("timestamp")
                .include("sender")
                .computed("text", Expression::field("content.text"))
                .computed("like_count", Expression::count_of("interactions.likes"))
                .computed("report_count", Expression::count_of("interactions.reports")),
        )
}

/// Message count per sender of a chat, keeping the top one
///
/// Equal counts are broken by alias, ascending.
pub fn most_active_sender_pipeline(chat_id: &str) -> AggregationPipeline {
    AggregationPipeline::new()
        .filter(DocumentQuery::new().eq("chat_id", chat_id))
        .group(
            GroupSpec::new(Expression::field("sender"))
                .accumulate("count", Accumulator::Sum(Expression::literal(1))),
        )
        .sort(&[("count", Descending), ("_id", Ascending)])
        .limit(1)
        .project(
            ProjectSpec::new()
                .exclude("_id")
                .computed("alias", Expression::field("_id"))
                .computed("message_count", Expression::field("count")),
        )
}

/// Private messages of a chat that `alias` sent or received
pub fn private_thread_pipeline(chat_id: &str, alias: &str) -> AggregationPipeline {
    AggregationPipeline::new()
        .filter(
            DocumentQuery::new()
                .eq("chat_id", chat_id)
                .eq("type", MessageType::Private.as_str())
                .or(vec![
                    DocumentQuery::new().eq("sender", alias),
                    DocumentQuery::new().eq("recipient", alias),
                ]),
        )
        .project(
            ProjectSpec::new()
                .exclude("_id")
                .include("timestamp")
                .include("sender")
                .include("recipient")
                .computed("text", Expression::field("content.text"))
                .computed("like_count", Expression::count_of("interactions.likes")),
        )
        .sort(&[
            ("timestamp", Ascending),
            ("sender", Ascending),
            ("recipient", Ascending),
        ])
}

/// Read-only queries over a chat store
#[derive(Clone)]
pub struct Analytics {
    backend: Arc<dyn DocumentBackend>,
    options: AggregateOptions,
}

impl Analytics {
    /// Queries against `backend`, each bounded by `timeout`
    pub fn new(backend: Arc<dyn DocumentBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            options: AggregateOptions {
                timeout: Some(timeout),
                cancel: CancellationHandle::new(),
            },
        }
    }

    /// Override the per-query timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Run queries under a caller-held cancellation handle
    pub fn with_cancellation(mut self, cancel: CancellationHandle) -> Self {
        self.options.cancel = cancel;
        self
    }

    /// Handle that cancels queries in flight
    pub fn cancellation(&self) -> &CancellationHandle {
        &self.options.cancel
    }

    /// Run an arbitrary pipeline
    pub async fn run(
        &self,
        collection: &str,
        pipeline: &AggregationPipeline,
    ) -> Result<Vec<serde_json::Value>> {
        Ok(aggregate(self.backend.as_ref(), collection, pipeline, &self.options).await?)
    }

    async fn run_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        pipeline: &AggregationPipeline,
    ) -> Result<Vec<T>> {
        self.run(collection, pipeline)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(CharlaError::from))
            .collect()
    }

    /// Public messages of a chat in send order
    ///
    /// An unknown chat yields an empty timeline.
    pub async fn public_timeline(&self, chat_id: &str) -> Result<Vec<TimelineEntry>> {
        let entries: Vec<TimelineEntry> = self.run_as(MESSAGES, &timeline_pipeline(chat_id)).await?;
        debug!(chat = chat_id, entries = entries.len(), "public timeline");
        Ok(entries)
    }

    /// The participant who sent the most messages in a chat
    pub async fn most_active_sender(&self, chat_id: &str) -> Result<Option<SenderActivity>> {
        let top: Vec<SenderActivity> = self
            .run_as(MESSAGES, &most_active_sender_pipeline(chat_id))
            .await?;
        debug!(chat = chat_id, found = !top.is_empty(), "most active sender");
        Ok(top.into_iter().next())
    }

    /// Private messages `alias` exchanged in a chat, oldest first
    pub async fn private_thread(
        &self,
        chat_id: &str,
        alias: &str,
    ) -> Result<Vec<PrivateThreadEntry>> {
        let entries: Vec<PrivateThreadEntry> = self
            .run_as(MESSAGES, &private_thread_pipeline(chat_id, alias))
            .await?;
        debug!(chat = chat_id, alias, entries = entries.len(), "private thread");
        Ok(entries)
    }

    /// Every chat, oldest first
    pub async fn chats_by_creation(&self) -> Result<Vec<Chat>> {
        let pipeline =
            AggregationPipeline::new().sort(&[("created_at", Ascending), ("_id", Ascending)]);
        self.run_as(CHATS, &pipeline).await
    }

    /// Chats with the most recent message first; silent chats come last
    pub async fn chats_by_recent_activity(&self, limit: usize) -> Result<Vec<Chat>> {
        let mut pipeline = AggregationPipeline::new()
            .sort(&[("stats.last_message", Descending), ("_id", Ascending)]);
        if limit > 0 {
            pipeline = pipeline.limit(limit);
        }
        self.run_as(CHATS, &pipeline).await
    }

    /// Chats where `alias` is an active participant
    pub async fn chats_with_active_participant(&self, alias: &str) -> Result<Vec<Chat>> {
        let pipeline = AggregationPipeline::new()
            .filter(
                DocumentQuery::new()
                    .eq("participants.alias", alias)
                    .eq("participants.active", true),
            )
            .sort(&[("created_at", Ascending), ("_id", Ascending)]);

        // The filter matches alias and activity on any element; require both on one
        let mut chats: Vec<Chat> = self.run_as(CHATS, &pipeline).await?;
        chats.retain(|chat| chat.is_active_participant(alias));
        Ok(chats)
    }

    /// Messages `alias` sent, newest first
    pub async fn sent_by(&self, alias: &str) -> Result<Vec<Message>> {
        let pipeline = AggregationPipeline::new()
            .filter(DocumentQuery::new().eq("sender", alias))
            .sort(&[("timestamp", Descending), ("_id", Ascending)]);
        self.run_as(MESSAGES, &pipeline).await
    }

    /// Private messages addressed to `alias`, newest first
    pub async fn received_by(&self, alias: &str) -> Result<Vec<Message>> {
        let pipeline = AggregationPipeline::new()
            .filter(DocumentQuery::new().eq("recipient", alias))
            .sort(&[("timestamp", Descending), ("_id", Ascending)]);
        self.run_as(MESSAGES, &pipeline).await
    }

    /// Private messages addressed to `alias`, oldest first
    pub async fn private_inbox(&self, alias: &str) -> Result<Vec<Message>> {
        let pipeline = AggregationPipeline::new()
            .filter(
                DocumentQuery::new()
                    .eq("recipient", alias)
                    .eq("type", MessageType::Private.as_str()),
            )
            .sort(&[("timestamp", Ascending), ("_id", Ascending)]);
        self.run_as(MESSAGES, &pipeline).await
    }

    /// Messages in a moderation state, oldest first
    pub async fn messages_by_state(&self, state: ModerationState) -> Result<Vec<Message>> {
        let pipeline = AggregationPipeline::new()
            .filter(DocumentQuery::new().eq("state", state.as_str()))
            .sort(&[("timestamp", Ascending), ("_id", Ascending)]);
        self.run_as(MESSAGES, &pipeline).await
    }

    /// Messages with a content kind, oldest first
    pub async fn messages_by_content_kind(&self, kind: ContentKind) -> Result<Vec<Message>> {
        let pipeline = AggregationPipeline::new()
            .filter(DocumentQuery::new().eq("content.kind", kind.as_str()))
            .sort(&[("timestamp", Ascending), ("_id", Ascending)]);
        self.run_as(MESSAGES, &pipeline).await
    }

    /// Number of messages `alias` sent in a chat
    pub async fn sender_message_count(&self, chat_id: &str, alias: &str) -> Result<u64> {
        let filter = DocumentQuery::new().eq("chat_id", chat_id).eq("sender", alias);
        let count = match self.options.timeout {
            Some(limit) => with_timeout(limit, self.backend.count(MESSAGES, &filter)).await?,
            None => self.backend.count(MESSAGES, &filter).await?,
        };
        Ok(count as u64)
    }
}
