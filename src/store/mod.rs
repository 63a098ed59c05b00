//! Store adapter: typed CRUD over the five logical collections.
//!
//! Narrow, typed interface with secondary-index creation on startup. Two
//! implementations share this contract: [`sqlite::SqliteStore`] (the
//! concrete backend) and [`memory::InMemoryStore`] (a mockable variant used
//! by tests, with equivalent filter semantics for flat-field equality and
//! substring matches on `text`).

pub mod memory;
pub mod sqlite;

use crate::error::EngineError;
use crate::model::{ConversationMessage, Scope, Summary, UserProfileItem, VectorIndexEntry};

/// Filters accepted by lexical/listing queries over `conversation_history`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub conversation_id: Option<String>,
    pub scope: Option<String>,
    pub tag: Option<String>,
    pub text_contains: Option<String>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-scope/source-collection aggregate stats.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub total_messages: u64,
    pub total_summaries: u64,
    pub total_vector_entries: u64,
    pub messages_per_scope: std::collections::BTreeMap<String, u64>,
    pub top_tags: Vec<(String, u64)>,
}

/// A per-conversation aggregate row, as produced by `list_conversations`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSummaryRow {
    pub conversation_id: String,
    pub first_timestamp: chrono::DateTime<chrono::Utc>,
    pub last_timestamp: chrono::DateTime<chrono::Utc>,
    pub message_count: u64,
    pub scope: String,
    pub first_message: Option<ConversationMessage>,
    pub preview_messages: Vec<ConversationMessage>,
}

/// Typed CRUD + index contract every store backend implements.
///
/// Object-safe by construction (no generic methods, no `async-trait` needed):
/// every method already returns a concrete `Pin<Box<dyn Future>>`-free `async
/// fn` because the trait is only ever used behind a concrete `Arc<SqliteStore>`
/// or `Arc<InMemoryStore>` in this crate, selected once at startup — there is
/// no call site that needs a `dyn StoreAdapter`. Methods are `async fn`
/// directly; both implementations happen to share the same inherent method
/// set, which is what the rest of the engine calls through generics over
/// `S: StoreAdapter`.
pub trait StoreAdapter: Send + Sync + 'static {
    fn insert_message(
        &self,
        msg: ConversationMessage,
    ) -> impl std::future::Future<Output = Result<ConversationMessage, EngineError>> + Send;

    fn update_message(
        &self,
        msg: ConversationMessage,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;

    fn get_message(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ConversationMessage>, EngineError>> + Send;

    fn delete_message(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, EngineError>> + Send;

    fn find_messages(
        &self,
        filter: &MessageFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationMessage>, EngineError>> + Send;

    fn delete_messages_by_scope(
        &self,
        scope: &str,
    ) -> impl std::future::Future<Output = Result<u64, EngineError>> + Send;

    fn delete_messages_by_tag(
        &self,
        tag: &str,
    ) -> impl std::future::Future<Output = Result<u64, EngineError>> + Send;

    fn conversation_history(
        &self,
        conversation_id: &str,
        limit: u64,
        offset: u64,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationMessage>, EngineError>> + Send;

    fn list_conversations(
        &self,
        limit: u64,
        scope: Option<&str>,
        include_messages: bool,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationSummaryRow>, EngineError>> + Send;

    fn insert_summary(
        &self,
        summary: Summary,
    ) -> impl std::future::Future<Output = Result<Summary, EngineError>> + Send;

    fn summaries_by_conversation(
        &self,
        conversation_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Summary>, EngineError>> + Send;

    fn latest_summaries(
        &self,
        limit: u64,
        scope: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Summary>, EngineError>> + Send;

    fn upsert_vector_entry(
        &self,
        entry: VectorIndexEntry,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;

    fn delete_vector_entry_by_source(
        &self,
        source_id: &str,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;

    fn vector_entries(
        &self,
        source_collection: crate::model::SourceCollection,
        scope: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<VectorIndexEntry>, EngineError>> + Send;

    fn get_scope(
        &self,
        scope_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Scope>, EngineError>> + Send;

    fn create_scope(
        &self,
        scope: Scope,
    ) -> impl std::future::Future<Output = Result<Scope, EngineError>> + Send;

    fn all_scopes(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Scope>, EngineError>> + Send;

    fn upsert_user_profile_item(
        &self,
        item: UserProfileItem,
    ) -> impl std::future::Future<Output = Result<UserProfileItem, EngineError>> + Send;

    fn stats(&self) -> impl std::future::Future<Output = Result<StoreStats, EngineError>> + Send;

    fn optimize(&self) -> impl std::future::Future<Output = Result<Vec<String>, EngineError>> + Send;
}
