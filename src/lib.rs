//! Memory Engine - Persistent, Queryable Long-Term Memory Service
//!
//! A stdio-driven memory service for a conversational assistant, combining:
//! - A document store over five logical collections (`ConversationMessage`,
//!   `Summary`, `VectorIndexEntry`, `Scope`, `UserProfileItem`), backed by
//!   SQLite with FTS5 for lexical search.
//! - An asynchronous embedding index with a bounded LRU cache and a worker
//!   pool, feeding hybrid (lexical + semantic) retrieval.
//! - A request dispatcher with bounded retry, per-action circuit breaking,
//!   and health accounting.
//! - A newline-framed stdio JSON transport.
//!
//! # Example
//!
//! ```ignore
//! use memory_engine::config::EngineConfig;
//! use memory_engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load()?;
//!     let engine = Engine::start(config).await?;
//!     engine.serve().await?;
//!     Ok(())
//! }
//! ```

// Core modules (order matters: store/embedding are leaves, repository
// builds on both, service builds on repository, dispatcher/handlers/
// transport build on service).
pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod embedding;
pub mod repository;
pub mod service;
pub mod dispatcher;
pub mod handlers;
pub mod transport;

use std::sync::Arc;

use config::EngineConfig;
use dispatcher::Dispatcher;
use embedding::EmbeddingService;
use error::EngineError;
use repository::MemoryRepository;
use service::MemoryService;
use store::sqlite::SqliteStore;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info.
pub fn info() -> String {
    format!("{} v{} - Persistent memory engine for a conversational assistant", NAME, VERSION)
}

/// Wires the store, embedding service, repository, business service, and
/// dispatcher together. `Engine::start` is the one place that owns the
/// concrete `SqliteStore` backend; everything above it is generic over
/// `store::StoreAdapter`.
pub struct Engine {
    dispatcher: Dispatcher,
}

impl Engine {
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(SqliteStore::open(&config.database.path).await?);
        let embeddings = Arc::new(EmbeddingService::new(config.embedding.cache_size, config.embedding.async_enabled, false));
        let repo = Arc::new(MemoryRepository::new(store, embeddings));
        let service = Arc::new(MemoryService::new(repo, config.memory.clone()));

        let mut dispatcher = Dispatcher::new();
        handlers::register_all(&mut dispatcher, service);

        Ok(Self { dispatcher })
    }

    /// Run the stdio request loop until stdin is closed.
    pub async fn serve(&self) -> std::io::Result<()> {
        transport::run_stdio_server(&self.dispatcher).await
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_starts_against_an_in_memory_database_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.database.path = dir.path().join("memory.sqlite3");
        config.embedding.async_enabled = false;

        let engine = Engine::start(config).await.unwrap();
        let response = engine.dispatcher().dispatch(r#"{"action": "ping"}"#).await;
        assert_eq!(response["status"], "OK");
    }
}
