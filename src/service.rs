//! Memory service: request-shaped operations over the repository.
//!
//! Grounded on the source `MemoryService`/`memory_repository.py` pair —
//! scope resolution and auto-creation, delete precedence
//! (`memory_id` > `scope` > `tag` > `query`), and the conversation-history/
//! summary surface confirmed against `test_conversation_history.py`'s exact
//! call shapes. The statistical summary fallback (used when
//! `generate_summary` is requested without `summary_text`) has no model
//! behind it in this engine; it is a deterministic digest, not a rewrite.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::config::MemoryConfig;
use crate::error::EngineError;
use crate::model::{new_id, ConversationMessage, Scope, Speaker, Summary, TimeRange};
use crate::repository::{filter_all_tags, filter_time_range, MemoryRepository, ScoredMessage};
use crate::store::{ConversationSummaryRow, StoreAdapter, StoreStats};

const DEFAULT_RETRIEVE_LIMIT: usize = 5;

pub struct MemoryService<S: StoreAdapter> {
    repo: Arc<MemoryRepository<S>>,
    memory_config: MemoryConfig,
}

/// Result of a `delete_memory` call: how many rows were removed and by
/// which criterion, mirroring the source's response shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
    pub criterion: &'static str,
}

/// Per-component reachability, reported by the `health_check` action.
/// Request/error/slow-request counters live on the dispatcher, not here —
/// mirroring the source, where `get_health()` was never itself a registered
/// MCP command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ComponentHealth {
    pub store_reachable: bool,
    pub embedding_worker_running: bool,
}

impl<S: StoreAdapter> MemoryService<S> {
    pub fn new(repo: Arc<MemoryRepository<S>>, memory_config: MemoryConfig) -> Self {
        Self { repo, memory_config }
    }

    /// Resolve `scope`, auto-creating it when absent and configured to do
    /// so. Falls back to the configured default scope when `scope` is
    /// `None`.
    pub async fn resolve_scope(&self, scope: Option<&str>) -> Result<String, EngineError> {
        let scope_name = scope.unwrap_or(&self.memory_config.default_scope).to_string();

        if self.repo.get_scope(&scope_name).await?.is_some() {
            return Ok(scope_name);
        }

        if self.memory_config.auto_create_scope {
            self.repo
                .create_scope(Scope::new_active(scope_name.clone(), format!("Auto-created scope: {scope_name}")))
                .await?;
            Ok(scope_name)
        } else {
            Err(EngineError::UnknownScope(scope_name))
        }
    }

    /// Store one message, tagged to a resolved scope.
    pub async fn store_memory(
        &self,
        conversation_id: String,
        speaker: Speaker,
        text: String,
        scope: Option<&str>,
        tags: BTreeSet<String>,
    ) -> Result<ConversationMessage, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidRequest("text must not be empty".to_string()));
        }
        let scope = self.resolve_scope(scope).await?;
        let message = ConversationMessage {
            id: new_id(),
            conversation_id,
            speaker,
            text,
            scope,
            tags,
            timestamp: Utc::now(),
        };
        self.repo.store_message(message).await
    }

    /// Hybrid search with post-hoc tag/time-range narrowing, mirroring the
    /// source's `retrieve_memory`.
    pub async fn retrieve_memory(
        &self,
        query: &str,
        scope: Option<&str>,
        tags: &[String],
        from: Option<chrono::DateTime<Utc>>,
        to: Option<chrono::DateTime<Utc>>,
        top_k: Option<usize>,
    ) -> Result<Vec<ScoredMessage>, EngineError> {
        if query.trim().is_empty() {
            return Err(EngineError::InvalidRequest("query must not be empty".to_string()));
        }
        let hits = self.repo.hybrid_search(query, scope, top_k.unwrap_or(DEFAULT_RETRIEVE_LIMIT)).await?;
        let hits = filter_all_tags(hits, tags);
        let hits = filter_time_range(hits, from, to);
        Ok(hits)
    }

    pub async fn search_by_tag(&self, tag: &str, scope: Option<&str>) -> Result<Vec<ConversationMessage>, EngineError> {
        if tag.trim().is_empty() {
            return Err(EngineError::InvalidRequest("tag must not be empty".to_string()));
        }
        let filter = crate::store::MessageFilter {
            conversation_id: None,
            scope: scope.map(|s| s.to_string()),
            tag: Some(tag.to_string()),
            text_contains: None,
            from: None,
            to: None,
        };
        self.repo_find(filter).await
    }

    pub async fn search_by_scope(&self, scope: &str) -> Result<Vec<ConversationMessage>, EngineError> {
        let filter = crate::store::MessageFilter {
            conversation_id: None,
            scope: Some(scope.to_string()),
            tag: None,
            text_contains: None,
            from: None,
            to: None,
        };
        self.repo_find(filter).await
    }

    async fn repo_find(&self, filter: crate::store::MessageFilter) -> Result<Vec<ConversationMessage>, EngineError> {
        // Search-by-tag/scope reuse the lexical path with an empty text
        // filter, which the store adapters treat as "match all".
        self.repo.lexical_search_raw(filter).await
    }

    /// Precedence: `memory_id` (single row) > `scope` (all rows) > `tag`
    /// (all rows) > `query` (lexical match, no semantic fallback — deletes
    /// must be precise). `forget_mode` ("soft" or "hard") is accepted and
    /// validated but this engine only ever hard-deletes; soft-delete
    /// (retain a tombstone) is not implemented.
    pub async fn delete_memory(
        &self,
        memory_id: Option<&str>,
        scope: Option<&str>,
        tag: Option<&str>,
        query: Option<&str>,
        forget_mode: Option<&str>,
    ) -> Result<DeleteOutcome, EngineError> {
        if let Some(mode) = forget_mode {
            if mode != "hard" && mode != "soft" {
                return Err(EngineError::InvalidRequest(format!("unknown forget_mode: {mode}")));
            }
        }

        if let Some(id) = memory_id {
            let deleted = self.repo.delete_message(id).await?;
            return Ok(DeleteOutcome { deleted_count: if deleted { 1 } else { 0 }, criterion: "memory_id" });
        }
        if let Some(scope) = scope {
            let count = self.repo.delete_messages_by_scope(scope).await?;
            return Ok(DeleteOutcome { deleted_count: count, criterion: "scope" });
        }
        if let Some(tag) = tag {
            let count = self.repo.delete_messages_by_tag(tag).await?;
            return Ok(DeleteOutcome { deleted_count: count, criterion: "tag" });
        }
        if let Some(query) = query {
            let hits = self.repo.lexical_search(query, None, None, None, None).await?;
            let mut count = 0u64;
            for hit in hits {
                if self.repo.delete_message(&hit.message.id).await? {
                    count += 1;
                }
            }
            return Ok(DeleteOutcome { deleted_count: count, criterion: "query" });
        }

        Err(EngineError::InvalidRequest(
            "delete_memory requires one of memory_id, scope, tag, or query".to_string(),
        ))
    }

    pub async fn store_conversation_history(
        &self,
        messages: Vec<ConversationMessage>,
        scope: Option<&str>,
    ) -> Result<(String, Vec<String>), EngineError> {
        let resolved_scope = self.resolve_scope(scope).await?;
        let messages = messages
            .into_iter()
            .map(|mut m| {
                m.scope = resolved_scope.clone();
                m
            })
            .collect();
        self.repo.store_batch(messages).await
    }

    pub async fn get_conversation_history(
        &self,
        conversation_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ConversationMessage>, EngineError> {
        self.repo.conversation_history(conversation_id, limit, offset).await
    }

    pub async fn get_conversations_list(
        &self,
        limit: u64,
        scope: Option<&str>,
        include_messages: bool,
    ) -> Result<Vec<ConversationSummaryRow>, EngineError> {
        self.repo.list_conversations(limit, scope, include_messages).await
    }

    /// Create a summary. When `generate_summary` is set and no
    /// `summary_text` is provided, a deterministic statistical digest is
    /// produced from the conversation's history instead of calling a model.
    pub async fn create_conversation_summary(
        &self,
        conversation_id: String,
        summary_text: Option<String>,
        generate_summary: bool,
        scope: Option<&str>,
    ) -> Result<(Summary, bool), EngineError> {
        let history = self.repo.conversation_history(&conversation_id, u64::MAX, 0).await?;
        if history.is_empty() {
            return Err(EngineError::NotFound(format!("no conversation history for {conversation_id}")));
        }

        let (text, generated) = match summary_text {
            Some(text) if !text.trim().is_empty() => (text, false),
            _ if generate_summary => (statistical_summary(&history), true),
            _ => {
                return Err(EngineError::InvalidRequest(
                    "summary_text is required unless generate_summary is set".to_string(),
                ))
            }
        };

        let resolved_scope = match scope {
            Some(s) => s.to_string(),
            None => history[0].scope.clone(),
        };
        let time_range = TimeRange {
            from: history.iter().map(|m| m.timestamp).min().unwrap(),
            to: history.iter().map(|m| m.timestamp).max().unwrap(),
        };

        let summary = Summary {
            id: new_id(),
            conversation_id: Some(conversation_id),
            topic_id: None,
            summary_text: text,
            scope: resolved_scope,
            tags: BTreeSet::new(),
            timestamp: Utc::now(),
            time_range,
            message_refs: history.iter().map(|m| m.id.clone()).collect(),
        };

        let stored = self.repo.store_summary(summary).await?;
        Ok((stored, generated))
    }

    pub async fn get_conversation_summaries(&self, conversation_id: &str) -> Result<Vec<Summary>, EngineError> {
        self.repo.summaries_by_conversation(conversation_id).await
    }

    pub async fn get_latest_conversation_summaries(
        &self,
        limit: u64,
        scope: Option<&str>,
    ) -> Result<Vec<Summary>, EngineError> {
        self.repo.latest_summaries(limit, scope).await
    }

    pub async fn get_memory_stats(&self) -> Result<StoreStats, EngineError> {
        self.repo.stats().await
    }

    pub async fn health_check(&self) -> ComponentHealth {
        ComponentHealth {
            store_reachable: self.repo.store_reachable().await,
            embedding_worker_running: self.repo.embedding_worker_running(),
        }
    }

    /// Run the store's maintenance routines (VACUUM/ANALYZE/reindex,
    /// depending on backend). `summarize_old` is named in the response for
    /// parity with the source operation list but performs no work here: no
    /// model is available to summarize without a caller-supplied digest.
    pub async fn optimize_memory(&self) -> Result<Vec<String>, EngineError> {
        let mut actions = self.repo.optimize().await?;
        actions.push("summarize_old: skipped (no-op, no summarization model configured)".to_string());
        Ok(actions)
    }
}

/// Deterministic, model-free summary: per-speaker counts, wall-clock span,
/// and the first user / last assistant utterance, truncated to a preview
/// length. No paraphrasing — this is a digest, not a rewrite.
fn statistical_summary(history: &[ConversationMessage]) -> String {
    let user_count = history.iter().filter(|m| m.speaker == Speaker::User).count();
    let assistant_count = history.iter().filter(|m| m.speaker == Speaker::Assistant).count();
    let span = history
        .iter()
        .map(|m| m.timestamp)
        .max()
        .zip(history.iter().map(|m| m.timestamp).min())
        .map(|(max, min)| max - min)
        .unwrap_or_default();

    let first_user = history
        .iter()
        .find(|m| m.speaker == Speaker::User)
        .map(|m| preview(&m.text, 120))
        .unwrap_or_default();
    let last_assistant = history
        .iter()
        .rev()
        .find(|m| m.speaker == Speaker::Assistant)
        .map(|m| preview(&m.text, 120))
        .unwrap_or_default();

    format!(
        "Conversation with {user_count} user and {assistant_count} assistant message(s) over {}. Opened with: \"{first_user}\". Last assistant reply: \"{last_assistant}\".",
        format_duration(span)
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        format!("{truncated}...")
    } else {
        truncated
    }
}

fn format_duration(span: chrono::Duration) -> String {
    let seconds = span.num_seconds().max(0);
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingService;
    use crate::store::memory::InMemoryStore;
    use std::collections::BTreeSet;

    fn service() -> MemoryService<InMemoryStore> {
        let repo = Arc::new(MemoryRepository::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EmbeddingService::new(100, false, true)),
        ));
        MemoryService::new(repo, MemoryConfig::default())
    }

    #[tokio::test]
    async fn store_memory_auto_creates_unknown_scope() {
        let svc = service();
        let stored = svc
            .store_memory(new_id(), Speaker::User, "hello".to_string(), Some("Brand New Scope"), BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(stored.scope, "Brand New Scope");
    }

    #[tokio::test]
    async fn store_memory_rejects_empty_text() {
        let svc = service();
        let err = svc.store_memory(new_id(), Speaker::User, "   ".to_string(), None, BTreeSet::new()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn delete_precedence_prefers_memory_id_over_scope() {
        let svc = service();
        let stored = svc
            .store_memory(new_id(), Speaker::User, "keep me safe".to_string(), Some("Work"), BTreeSet::new())
            .await
            .unwrap();
        let outcome = svc.delete_memory(Some(&stored.id), Some("Work"), None, None, None).await.unwrap();
        assert_eq!(outcome.criterion, "memory_id");
        assert_eq!(outcome.deleted_count, 1);
    }

    #[tokio::test]
    async fn delete_memory_requires_a_criterion() {
        let svc = service();
        assert!(svc.delete_memory(None, None, None, None, None).await.is_err());
    }

    #[tokio::test]
    async fn delete_memory_rejects_unknown_forget_mode() {
        let svc = service();
        let err = svc.delete_memory(None, Some("Work"), None, None, Some("vaporize")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn create_summary_with_explicit_text_is_not_generated() {
        let svc = service();
        let conversation_id = new_id();
        svc.store_memory(conversation_id.clone(), Speaker::User, "hi".to_string(), Some("Work"), BTreeSet::new())
            .await
            .unwrap();
        let (summary, generated) = svc
            .create_conversation_summary(conversation_id, Some("A short recap".to_string()), false, None)
            .await
            .unwrap();
        assert!(!generated);
        assert_eq!(summary.summary_text, "A short recap");
    }

    #[tokio::test]
    async fn create_summary_falls_back_to_statistical_digest() {
        let svc = service();
        let conversation_id = new_id();
        svc.store_memory(conversation_id.clone(), Speaker::User, "What is the status?".to_string(), Some("Work"), BTreeSet::new())
            .await
            .unwrap();
        svc.store_memory(conversation_id.clone(), Speaker::Assistant, "All green.".to_string(), Some("Work"), BTreeSet::new())
            .await
            .unwrap();
        let (summary, generated) = svc.create_conversation_summary(conversation_id, None, true, None).await.unwrap();
        assert!(generated);
        assert!(summary.summary_text.contains("1 user and 1 assistant"));
    }

    #[tokio::test]
    async fn create_summary_without_text_or_generate_flag_is_rejected() {
        let svc = service();
        let conversation_id = new_id();
        svc.store_memory(conversation_id.clone(), Speaker::User, "hi".to_string(), Some("Work"), BTreeSet::new())
            .await
            .unwrap();
        let err = svc.create_conversation_summary(conversation_id, None, false, None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn health_check_reports_store_reachable() {
        let svc = service();
        let health = svc.health_check().await;
        assert!(health.store_reachable);
    }

    #[tokio::test]
    async fn optimize_memory_reports_summarize_old_as_skipped() {
        let svc = service();
        let actions = svc.optimize_memory().await.unwrap();
        assert!(actions.iter().any(|a| a.contains("summarize_old")));
    }
}
