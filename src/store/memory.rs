//! In-memory store adapter.
//!
//! A mockable variant of [`StoreAdapter`] satisfying the same contract as
//! the SQLite backend: flat-field equality filters and substring matching on
//! `text`, guarded by a single `tokio::sync::Mutex` over plain `Vec`s. Used
//! by unit and integration tests so the repository and service layers can be
//! exercised without touching disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::model::{
    ConversationMessage, Scope, SourceCollection, Summary, UserProfileItem, VectorIndexEntry,
};

use super::{ConversationSummaryRow, MessageFilter, StoreAdapter, StoreStats};

#[derive(Default)]
struct Inner {
    messages: Vec<ConversationMessage>,
    summaries: Vec<Summary>,
    vector_entries: BTreeMap<String, VectorIndexEntry>, // keyed by source_id
    scopes: BTreeMap<String, Scope>,                    // keyed by scope_name
    user_profile: BTreeMap<(String, String), UserProfileItem>, // keyed by (user_id, key)
}

pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())) }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(msg: &ConversationMessage, filter: &MessageFilter) -> bool {
    if let Some(c) = &filter.conversation_id {
        if &msg.conversation_id != c {
            return false;
        }
    }
    if let Some(s) = &filter.scope {
        if &msg.scope != s {
            return false;
        }
    }
    if let Some(t) = &filter.tag {
        if !msg.tags.contains(t) {
            return false;
        }
    }
    if let Some(text) = &filter.text_contains {
        if !msg.text.to_lowercase().contains(&text.to_lowercase()) {
            return false;
        }
    }
    if let Some(from) = filter.from {
        if msg.timestamp < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if msg.timestamp > to {
            return false;
        }
    }
    true
}

impl StoreAdapter for InMemoryStore {
    async fn insert_message(&self, msg: ConversationMessage) -> Result<ConversationMessage, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.messages.push(msg.clone());
        Ok(msg)
    }

    async fn update_message(&self, msg: ConversationMessage) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let existing = inner.messages.iter_mut().find(|m| m.id == msg.id);
        match existing {
            Some(slot) => {
                *slot = msg;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("message {}", msg.id))),
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<ConversationMessage>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn delete_message(&self, id: &str) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| m.id != id);
        inner.vector_entries.remove(id);
        Ok(inner.messages.len() != before)
    }

    async fn find_messages(&self, filter: &MessageFilter) -> Result<Vec<ConversationMessage>, EngineError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.messages.iter().filter(|m| matches(m, filter)).cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn delete_messages_by_scope(&self, scope: &str) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock().await;
        let removed_ids: Vec<String> =
            inner.messages.iter().filter(|m| m.scope == scope).map(|m| m.id.clone()).collect();
        inner.messages.retain(|m| m.scope != scope);
        for id in &removed_ids {
            inner.vector_entries.remove(id);
        }
        Ok(removed_ids.len() as u64)
    }

    async fn delete_messages_by_tag(&self, tag: &str) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock().await;
        let removed_ids: Vec<String> =
            inner.messages.iter().filter(|m| m.tags.contains(tag)).map(|m| m.id.clone()).collect();
        inner.messages.retain(|m| !m.tags.contains(tag));
        for id in &removed_ids {
            inner.vector_entries.remove(id);
        }
        Ok(removed_ids.len() as u64)
    }

    async fn conversation_history(
        &self,
        conversation_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ConversationMessage>, EngineError> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<_> =
            inner.messages.iter().filter(|m| m.conversation_id == conversation_id).cloned().collect();
        matching.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(matching.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn list_conversations(
        &self,
        limit: u64,
        scope: Option<&str>,
        include_messages: bool,
    ) -> Result<Vec<ConversationSummaryRow>, EngineError> {
        let inner = self.inner.lock().await;
        let mut by_conversation: BTreeMap<String, Vec<ConversationMessage>> = BTreeMap::new();
        for msg in &inner.messages {
            if let Some(s) = scope {
                if msg.scope != s {
                    continue;
                }
            }
            by_conversation.entry(msg.conversation_id.clone()).or_default().push(msg.clone());
        }

        let mut rows: Vec<ConversationSummaryRow> = by_conversation
            .into_iter()
            .map(|(conversation_id, mut msgs)| {
                msgs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                let first = msgs.first().cloned();
                let last_ts = msgs.last().map(|m| m.timestamp).unwrap_or_default();
                let first_ts = msgs.first().map(|m| m.timestamp).unwrap_or_default();
                let scope = msgs.first().map(|m| m.scope.clone()).unwrap_or_default();
                let preview = if include_messages { msgs.iter().take(3).cloned().collect() } else { Vec::new() };
                ConversationSummaryRow {
                    conversation_id,
                    first_timestamp: first_ts,
                    last_timestamp: last_ts,
                    message_count: msgs.len() as u64,
                    scope,
                    first_message: first,
                    preview_messages: preview,
                }
            })
            .collect();

        rows.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn insert_summary(&self, summary: Summary) -> Result<Summary, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.summaries.push(summary.clone());
        Ok(summary)
    }

    async fn summaries_by_conversation(&self, conversation_id: &str) -> Result<Vec<Summary>, EngineError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .summaries
            .iter()
            .filter(|s| s.conversation_id.as_deref() == Some(conversation_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    async fn latest_summaries(&self, limit: u64, scope: Option<&str>) -> Result<Vec<Summary>, EngineError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .summaries
            .iter()
            .filter(|s| scope.map(|sc| s.scope == sc).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn upsert_vector_entry(&self, entry: VectorIndexEntry) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.vector_entries.insert(entry.source_id.clone(), entry);
        Ok(())
    }

    async fn delete_vector_entry_by_source(&self, source_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.vector_entries.remove(source_id);
        Ok(())
    }

    async fn vector_entries(
        &self,
        source_collection: SourceCollection,
        scope: Option<&str>,
    ) -> Result<Vec<VectorIndexEntry>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vector_entries
            .values()
            .filter(|e| e.source_collection == source_collection)
            .filter(|e| scope.map(|s| e.scope == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_scope(&self, scope_name: &str) -> Result<Option<Scope>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.scopes.get(scope_name).cloned())
    }

    async fn create_scope(&self, scope: Scope) -> Result<Scope, EngineError> {
        let mut inner = self.inner.lock().await;
        // The map entry is the race arbiter: the first writer to claim the
        // key wins, later callers get the winner's row back as success.
        let winner = inner.scopes.entry(scope.scope_name.clone()).or_insert(scope);
        Ok(winner.clone())
    }

    async fn all_scopes(&self) -> Result<Vec<Scope>, EngineError> {
        let inner = self.inner.lock().await;
        Ok(inner.scopes.values().cloned().collect())
    }

    async fn upsert_user_profile_item(&self, item: UserProfileItem) -> Result<UserProfileItem, EngineError> {
        let mut inner = self.inner.lock().await;
        inner.user_profile.insert((item.user_id.clone(), item.key.clone()), item.clone());
        Ok(item)
    }

    async fn stats(&self) -> Result<StoreStats, EngineError> {
        let inner = self.inner.lock().await;
        let mut messages_per_scope = BTreeMap::new();
        let mut tag_counts: BTreeMap<String, u64> = BTreeMap::new();
        for msg in &inner.messages {
            *messages_per_scope.entry(msg.scope.clone()).or_insert(0u64) += 1;
            for tag in &msg.tags {
                *tag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        let mut top_tags: Vec<(String, u64)> = tag_counts.into_iter().collect();
        top_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_tags.truncate(10);

        Ok(StoreStats {
            total_messages: inner.messages.len() as u64,
            total_summaries: inner.summaries.len() as u64,
            total_vector_entries: inner.vector_entries.len() as u64,
            messages_per_scope,
            top_tags,
        })
    }

    async fn optimize(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["noop (in-memory store)".to_string(), "summarize_old: not implemented".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_id, Speaker};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn sample(text: &str) -> ConversationMessage {
        ConversationMessage {
            id: new_id(),
            conversation_id: new_id(),
            speaker: Speaker::User,
            text: text.to_string(),
            scope: "Global".to_string(),
            tags: BTreeSet::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scope_creation_is_idempotent_under_race() {
        let store = InMemoryStore::new();
        let a = store.create_scope(Scope::new_active("Work", "first")).await.unwrap();
        let b = store.create_scope(Scope::new_active("Work", "second")).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn find_messages_filters_by_text() {
        let store = InMemoryStore::new();
        store.insert_message(sample("hello world")).await.unwrap();
        store.insert_message(sample("goodbye world")).await.unwrap();
        let filter = MessageFilter { text_contains: Some("hello".to_string()), ..Default::default() };
        let found = store.find_messages(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
