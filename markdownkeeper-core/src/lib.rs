//! # MarkdownKeeper Core
//!
//! Shared, I/O-free logic for MarkdownKeeper: data models, the Markdown
//! parser, the hybrid scoring algorithm, the embedding vector utilities,
//! and the `Store`/`EmbeddingProvider` trait surfaces.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The application
//! crate implements these traits against SQLite and wires them to the
//! watcher, event queue, and HTTP/CLI surfaces.

pub mod embedding;
pub mod error;
pub mod models;
pub mod parser;
pub mod search;
pub mod store;
