//! # Charla
//!
//! Indexed chat and message store with an aggregation engine for chat
//! analytics.
//!
//! Chats and messages live in two collections of a [`charla_document`]
//! backend. The [`chat::ChatStore`] owns their lifecycle and keeps the
//! built-in secondary indexes registered; [`chat::Analytics`] answers the
//! read-side queries as validated aggregation pipelines.
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`chat`] | Records, collection layout, store operations and analytics |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error type wrapping store failures |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use charla::chat::{Chat, ChatStore, Content, Message, Participant};
//! use charla::Config;
//!
//! let store = ChatStore::open(&Config::default()).await?;
//! store.create_chat(&Chat::new("c1", now).with_participant(Participant::new("Ana", now))).await?;
//! store.send_message(&Message::public("c1", "Ana", now, Content::text("hola"))).await?;
//!
//! let timeline = store.analytics().public_timeline("c1").await?;
//! ```

pub mod chat;
pub mod config;
pub mod error;

pub use charla_document as document;

pub use config::Config;
pub use error::{CharlaError, Result};
