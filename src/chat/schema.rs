//! Collection layout and built-in indexes

use serde_json::json;

use charla_document::document::{CollectionSchema, IndexSpec};

/// Chats collection name
pub const CHATS: &str = "chats";

/// Messages collection name
pub const MESSAGES: &str = "messages";

/// Declared fields of the chats collection
pub fn chats_schema() -> CollectionSchema {
    CollectionSchema::new(
        [
            "created_at",
            "participants",
            "participants.alias",
            "participants.active",
            "participants.joined_at",
            "stats",
            "stats.last_message",
            "stats.total_messages",
        ],
        &["created_at"],
    )
}

/// Declared fields of the messages collection
pub fn messages_schema() -> CollectionSchema {
    CollectionSchema::new(
        [
            "chat_id",
            "type",
            "sender",
            "recipient",
            "timestamp",
            "content",
            "content.kind",
            "content.text",
            "content.options",
            "content.proposal_id",
            "content.choice",
            "content.action",
            "content.target",
            "state",
            "interactions",
            "interactions.likes",
            "interactions.reports",
        ],
        &["chat_id", "type", "sender", "timestamp", "content.kind", "state"],
    )
}

/// Indexes every store carries
pub fn builtin_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new(CHATS, "by-creation").asc("created_at"),
        IndexSpec::new(CHATS, "by-last-message").desc("stats.last_message"),
        IndexSpec::new(CHATS, "active-participants")
            .asc("participants.alias")
            .partial(json!({ "participants.active": true })),
        IndexSpec::new(CHATS, "unique-participant")
            .asc("_id")
            .asc("participants.alias")
            .unique(),
        IndexSpec::new(MESSAGES, "chat-timeline")
            .asc("chat_id")
            .asc("timestamp"),
        IndexSpec::new(MESSAGES, "private-thread")
            .asc("chat_id")
            .asc("type")
            .asc("sender")
            .asc("recipient"),
        IndexSpec::new(MESSAGES, "sender-history")
            .asc("sender")
            .desc("timestamp"),
        IndexSpec::new(MESSAGES, "recipient-history")
            .asc("recipient")
            .desc("timestamp"),
        IndexSpec::new(MESSAGES, "sender-per-chat")
            .asc("chat_id")
            .asc("sender"),
        IndexSpec::new(MESSAGES, "recipient-by-time-asc")
            .asc("recipient")
            .asc("timestamp"),
        IndexSpec::new(MESSAGES, "by-moderation-state").asc("state"),
        IndexSpec::new(MESSAGES, "by-content-kind").asc("content.kind"),
    ]
}
