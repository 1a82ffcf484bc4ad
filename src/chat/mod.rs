//! Chat domain: records, storage layout, lifecycle operations and analytics

pub mod analytics;
pub mod model;
pub mod schema;
pub mod store;

pub use analytics::{
    most_active_sender_pipeline, private_thread_pipeline, timeline_pipeline, Analytics,
    PrivateThreadEntry, SenderActivity, TimelineEntry,
};
pub use model::{
    Chat, ChatStats, Content, ContentKind, Interactions, Message, MessageType, ModerationState,
    Participant, Report,
};
pub use schema::{builtin_indexes, CHATS, MESSAGES};
pub use store::{ChatStore, Fixtures};
