//! Memory repository: owns the data model and the retrieval pipeline.
//!
//! Grounded on the original `MemoryRepository` class — in particular
//! `perform_hybrid_search`'s exact scoring rule (fixed lexical score 1.0,
//! lexical preferred on id conflict) and `create_scope`'s race-safe insert —
//! generalized to the Rust store-adapter abstraction. Deviates from the
//! teacher's `SemanticSearch::hybrid_search`, which instead blends scores by
//! reciprocal rank fusion; this repository follows the spec's explicit
//! scoring rule (see DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::EngineError;
use crate::model::{
    new_id, ConversationMessage, Scope, SourceCollection, Summary, VectorIndexEntry,
    VectorIndexMetadata,
};
use crate::store::{ConversationSummaryRow, MessageFilter, StoreAdapter, StoreStats};

const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.3;
const DEFAULT_TOP_K: usize = 5;

/// A single scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMessage {
    pub message: ConversationMessage,
    pub score: f32,
}

/// Per-`source_id` pending-operations table: ensures at-most-one concurrent
/// embedding job per document. A newer job supersedes an older one's index
/// write by bumping the generation counter; a stale completion whose
/// generation no longer matches is dropped rather than written.
#[derive(Default)]
struct PendingOps {
    generation: HashMap<String, u64>,
}

pub struct MemoryRepository<S: StoreAdapter> {
    store: Arc<S>,
    embeddings: Arc<EmbeddingService>,
    pending: Arc<Mutex<PendingOps>>,
    /// Count of embedding jobs spawned but not yet settled (written or
    /// superseded). Lets tests and graceful-shutdown paths wait for
    /// background indexing to drain without polling the store directly.
    in_flight_embeddings: Arc<AtomicU64>,
}

impl<S: StoreAdapter> MemoryRepository<S> {
    pub fn new(store: Arc<S>, embeddings: Arc<EmbeddingService>) -> Self {
        Self {
            store,
            embeddings,
            pending: Arc::new(Mutex::new(PendingOps::default())),
            in_flight_embeddings: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Insert a message, then spawn an asynchronous embedding job for it.
    /// Returns as soon as the document is inserted — the embedding write
    /// happens on the worker pool, concurrently with whatever request the
    /// dispatcher reads next.
    pub async fn store_message(&self, msg: ConversationMessage) -> Result<ConversationMessage, EngineError> {
        let stored = self.store.insert_message(msg).await?;
        self.queue_embedding(stored.id.clone(), stored.text.clone(), SourceCollection::ConversationHistory, stored.scope.clone(), stored.timestamp).await;
        Ok(stored)
    }

    /// Update a message's mutable fields, then spawn an embedding refresh.
    /// Rejected if `msg.id` is unset.
    pub async fn update_message(&self, msg: ConversationMessage) -> Result<(), EngineError> {
        if msg.id.is_empty() {
            return Err(EngineError::InvalidRequest("message id is required for update".to_string()));
        }
        self.store.update_message(msg.clone()).await?;
        self.queue_embedding(msg.id, msg.text, SourceCollection::ConversationHistory, msg.scope, msg.timestamp).await;
        Ok(())
    }

    pub async fn delete_message(&self, id: &str) -> Result<bool, EngineError> {
        self.store.delete_message(id).await
    }

    pub async fn delete_messages_by_scope(&self, scope: &str) -> Result<u64, EngineError> {
        self.store.delete_messages_by_scope(scope).await
    }

    pub async fn delete_messages_by_tag(&self, tag: &str) -> Result<u64, EngineError> {
        self.store.delete_messages_by_tag(tag).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<ConversationMessage>, EngineError> {
        self.store.get_message(id).await
    }

    /// Queue an async embedding job for `source_id` on the worker pool and
    /// return immediately; the write to the vector index happens later,
    /// concurrently with whatever the dispatcher handles next. A per-id
    /// generation counter is bumped synchronously here so that a second call
    /// for the same id (an update racing a store, say) supersedes the first
    /// one's write even though both run in the background — only the bump
    /// itself needs to happen before this call returns.
    async fn queue_embedding(
        &self,
        source_id: String,
        text: String,
        source_collection: SourceCollection,
        scope: String,
        timestamp: DateTime<Utc>,
    ) {
        let generation = {
            let mut pending = self.pending.lock().await;
            let gen = pending.generation.entry(source_id.clone()).or_insert(0);
            *gen += 1;
            *gen
        };

        let store = Arc::clone(&self.store);
        let embeddings = Arc::clone(&self.embeddings);
        let pending = Arc::clone(&self.pending);
        let in_flight = Arc::clone(&self.in_flight_embeddings);
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            run_embedding_job(store, embeddings, pending, source_id, text, source_collection, scope, timestamp, generation)
                .await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Waits until every spawned embedding job has either written its vector
    /// index entry or been superseded. Used by tests to observe the settled
    /// state deterministically instead of racing the worker pool, and usable
    /// as a drain point before shutdown.
    pub async fn settle_embeddings(&self) {
        while self.in_flight_embeddings.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Direct filter pass-through for tag/scope listing queries that need
    /// no scoring (`search_by_tag`, `search_by_scope`).
    pub async fn lexical_search_raw(
        &self,
        filter: crate::store::MessageFilter,
    ) -> Result<Vec<ConversationMessage>, EngineError> {
        self.store.find_messages(&filter).await
    }

    /// Case-insensitive substring match on `text`, with optional scope/tag/
    /// time-range filters. Always scores hits 1.0.
    pub async fn lexical_search(
        &self,
        query: &str,
        scope: Option<&str>,
        tag: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScoredMessage>, EngineError> {
        let filter = MessageFilter {
            conversation_id: None,
            scope: scope.map(|s| s.to_string()),
            tag: tag.map(|t| t.to_string()),
            text_contains: Some(query.to_string()),
            from,
            to,
        };
        let messages = self.store.find_messages(&filter).await?;
        Ok(messages.into_iter().map(|message| ScoredMessage { message, score: 1.0 }).collect())
    }

    /// Compute the query embedding, compare against candidate vector index
    /// rows (optionally scoped), keep those above `threshold`, and return
    /// the top-k `(doc, score)` pairs sorted by score descending. Returns an
    /// empty list without error if no vector rows exist for the scope.
    pub async fn semantic_search(
        &self,
        query: &str,
        scope: Option<&str>,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredMessage>, EngineError> {
        let query_embedding = self.embeddings.generate(query).await;
        let candidates = self.store.vector_entries(SourceCollection::ConversationHistory, scope).await?;

        let mut scored: Vec<(String, f32)> = candidates
            .into_iter()
            .map(|entry| (entry.source_id, cosine_similarity(&query_embedding, &entry.embedding)))
            .filter(|(_, score)| *score >= threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_k);

        let mut out = Vec::with_capacity(scored.len());
        for (source_id, score) in scored {
            if let Some(message) = self.store.get_message(&source_id).await? {
                out.push(ScoredMessage { message, score });
            }
        }
        Ok(out)
    }

    /// Union of lexical (score 1.0) and semantic results, deduplicated by
    /// document id preferring the lexical score on conflict, stable-sorted
    /// by score descending with ties broken by timestamp descending then id
    /// ascending, truncated to top-k.
    pub async fn hybrid_search(
        &self,
        query: &str,
        scope: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredMessage>, EngineError> {
        let lexical = self.lexical_search(query, scope, None, None, None).await?;
        let semantic = self.semantic_search(query, scope, top_k.max(DEFAULT_TOP_K), DEFAULT_SEMANTIC_THRESHOLD).await?;

        let mut by_id: HashMap<String, ScoredMessage> = HashMap::new();
        for hit in lexical {
            by_id.insert(hit.message.id.clone(), hit);
        }
        for hit in semantic {
            by_id.entry(hit.message.id.clone()).or_insert(hit);
        }

        let mut combined: Vec<ScoredMessage> = by_id.into_values().collect();
        combined.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.message.timestamp.cmp(&a.message.timestamp))
                .then_with(|| a.message.id.cmp(&b.message.id))
        });
        combined.truncate(top_k);
        Ok(combined)
    }

    pub async fn store_batch(
        &self,
        messages: Vec<ConversationMessage>,
    ) -> Result<(String, Vec<String>), EngineError> {
        if messages.is_empty() {
            return Err(EngineError::InvalidRequest("messages must not be empty".to_string()));
        }
        let conversation_id = messages[0].conversation_id.clone();
        let mut ids = Vec::with_capacity(messages.len());
        for msg in messages {
            let stored = self.store_message(msg).await?;
            ids.push(stored.id);
        }
        Ok((conversation_id, ids))
    }

    pub async fn conversation_history(
        &self,
        conversation_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ConversationMessage>, EngineError> {
        self.store.conversation_history(conversation_id, limit, offset).await
    }

    pub async fn list_conversations(
        &self,
        limit: u64,
        scope: Option<&str>,
        include_messages: bool,
    ) -> Result<Vec<ConversationSummaryRow>, EngineError> {
        self.store.list_conversations(limit, scope, include_messages).await
    }

    pub async fn store_summary(&self, summary: Summary) -> Result<Summary, EngineError> {
        let stored = self.store.insert_summary(summary).await?;
        self.queue_embedding(
            stored.id.clone(),
            stored.summary_text.clone(),
            SourceCollection::Summaries,
            stored.scope.clone(),
            stored.timestamp,
        )
        .await;
        Ok(stored)
    }

    pub async fn summaries_by_conversation(&self, conversation_id: &str) -> Result<Vec<Summary>, EngineError> {
        self.store.summaries_by_conversation(conversation_id).await
    }

    pub async fn latest_summaries(&self, limit: u64, scope: Option<&str>) -> Result<Vec<Summary>, EngineError> {
        self.store.latest_summaries(limit, scope).await
    }

    pub async fn get_scope(&self, scope_name: &str) -> Result<Option<Scope>, EngineError> {
        self.store.get_scope(scope_name).await
    }

    pub async fn create_scope(&self, scope: Scope) -> Result<Scope, EngineError> {
        self.store.create_scope(scope).await
    }

    pub async fn all_scopes(&self) -> Result<Vec<Scope>, EngineError> {
        self.store.all_scopes().await
    }

    pub async fn stats(&self) -> Result<StoreStats, EngineError> {
        self.store.stats().await
    }

    pub async fn optimize(&self) -> Result<Vec<String>, EngineError> {
        self.store.optimize().await
    }

    /// Cheap reachability probe used by `health_check`: any successful
    /// store query counts as reachable.
    pub async fn store_reachable(&self) -> bool {
        self.store.stats().await.is_ok()
    }

    pub fn embedding_worker_running(&self) -> bool {
        self.embeddings.worker_running()
    }
}

/// The embedding compute + supersession-check + vector-index write that
/// `queue_embedding` spawns onto the worker pool. Free function (rather than
/// a method) so it only captures owned/`Arc`-cloned state and is safely
/// `'static` inside `tokio::spawn`.
#[allow(clippy::too_many_arguments)]
async fn run_embedding_job<S: StoreAdapter>(
    store: Arc<S>,
    embeddings: Arc<EmbeddingService>,
    pending: Arc<Mutex<PendingOps>>,
    source_id: String,
    text: String,
    source_collection: SourceCollection,
    scope: String,
    timestamp: DateTime<Utc>,
    generation: u64,
) {
    let embedding = embeddings.generate_async(&text).await;

    let mut guard = pending.lock().await;
    let current = guard.generation.get(&source_id).copied().unwrap_or(0);
    if current != generation {
        // A newer job superseded this one; drop this stale write.
        return;
    }
    drop(guard);

    if embedding.iter().all(|v| *v == 0.0) && !text.is_empty() {
        warn!(source_id = %source_id, "embedding unavailable, document indexable via lexical search only");
    }

    let entry = VectorIndexEntry {
        id: new_id(),
        embedding,
        source_collection,
        source_id: source_id.clone(),
        scope,
        metadata: VectorIndexMetadata { text_preview: text.chars().take(200).collect(), timestamp: Some(timestamp) },
    };

    if let Err(e) = store.upsert_vector_entry(entry).await {
        warn!(source_id = %source_id, error = %e, "failed to persist vector index entry");
    }
}

/// All-of tag filter, applied post-hoc to a result set.
pub fn filter_all_tags(messages: Vec<ScoredMessage>, tags: &[String]) -> Vec<ScoredMessage> {
    if tags.is_empty() {
        return messages;
    }
    let required: HashSet<&String> = tags.iter().collect();
    messages
        .into_iter()
        .filter(|m| required.iter().all(|tag| m.message.tags.contains(tag.as_str())))
        .collect()
}

pub fn filter_time_range(
    messages: Vec<ScoredMessage>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Vec<ScoredMessage> {
    messages
        .into_iter()
        .filter(|m| {
            if let Some(from) = from {
                if m.message.timestamp < from {
                    return false;
                }
            }
            if let Some(to) = to {
                if m.message.timestamp > to {
                    return false;
                }
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Speaker;
    use crate::store::memory::InMemoryStore;
    use std::collections::BTreeSet;

    fn repo() -> MemoryRepository<InMemoryStore> {
        MemoryRepository::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EmbeddingService::new(1000, false, true)),
        )
    }

    fn message(scope: &str, text: &str, tags: &[&str]) -> ConversationMessage {
        ConversationMessage {
            id: new_id(),
            conversation_id: new_id(),
            speaker: Speaker::User,
            text: text.to_string(),
            scope: scope.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn store_then_lexical_retrieve_finds_own_text() {
        let repo = repo();
        repo.store_message(message("Work", "The deadline for Project Alpha is May 15th", &["deadline"])).await.unwrap();
        let hits = repo.hybrid_search("May 15th", Some("Work"), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].message.text.contains("May 15th"));
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn scope_isolation_excludes_other_scopes() {
        let repo = repo();
        repo.store_message(message("Work", "Project Alpha details", &[])).await.unwrap();
        repo.store_message(message("Personal", "Alice's birthday is Friday", &[])).await.unwrap();
        let hits = repo.hybrid_search("Project Alpha", Some("Personal"), 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_vector_index() {
        let repo = repo();
        let stored = repo.store_message(message("Work", "cascade me", &[])).await.unwrap();
        repo.settle_embeddings().await;
        let entries_before = repo.store.vector_entries(SourceCollection::ConversationHistory, None).await.unwrap();
        assert_eq!(entries_before.len(), 1);
        repo.delete_message(&stored.id).await.unwrap();
        let entries_after = repo.store.vector_entries(SourceCollection::ConversationHistory, None).await.unwrap();
        assert!(entries_after.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let repo = repo();
        let stored = repo.store_message(message("Work", "once", &[])).await.unwrap();
        assert!(repo.delete_message(&stored.id).await.unwrap());
        assert!(!repo.delete_message(&stored.id).await.unwrap());
    }

    #[tokio::test]
    async fn hybrid_search_prefers_lexical_score_on_conflict() {
        let repo = repo();
        let stored = repo.store_message(message("Work", "overlap text for both paths", &[])).await.unwrap();
        let lexical = repo.lexical_search("overlap", Some("Work"), None, None, None).await.unwrap();
        assert_eq!(lexical[0].message.id, stored.id);
        assert_eq!(lexical[0].score, 1.0);
    }

    #[tokio::test]
    async fn tag_filter_requires_all_tags() {
        let a = ScoredMessage { message: message("Work", "a", &["urgent", "billing"]), score: 1.0 };
        let b = ScoredMessage { message: message("Work", "b", &["urgent"]), score: 1.0 };
        let filtered = filter_all_tags(vec![a.clone(), b], &["urgent".to_string(), "billing".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].message.id, a.message.id);
    }

    #[tokio::test]
    async fn store_batch_round_trips_through_conversation_history() {
        let repo = repo();
        let conversation_id = new_id();
        let now = Utc::now();
        let messages = vec![
            ConversationMessage { id: new_id(), conversation_id: conversation_id.clone(), speaker: Speaker::User, text: "Hi".into(), scope: "Test".into(), tags: BTreeSet::new(), timestamp: now },
            ConversationMessage { id: new_id(), conversation_id: conversation_id.clone(), speaker: Speaker::Assistant, text: "Hello".into(), scope: "Test".into(), tags: BTreeSet::new(), timestamp: now + chrono::Duration::seconds(1) },
        ];
        let (conv_id, ids) = repo.store_batch(messages).await.unwrap();
        assert_eq!(conv_id, conversation_id);
        assert_eq!(ids.len(), 2);
        let history = repo.conversation_history(&conversation_id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].speaker, Speaker::User);
        assert_eq!(history[1].speaker, Speaker::Assistant);
    }

    #[tokio::test]
    async fn scope_auto_creation_race_is_arbitrated_by_unique_constraint() {
        let repo = repo();
        let a = repo.create_scope(Scope::new_active("Work", "first")).await.unwrap();
        let b = repo.create_scope(Scope::new_active("Work", "second, should lose")).await.unwrap();
        assert_eq!(a.id, b.id);
    }

}
