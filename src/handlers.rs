//! Wire-facing command handlers: one function per registered action.
//!
//! Grounded on the source `commands.py` (`handle_ping`, `handle_store_memory`,
//! `handle_retrieve_memory`, `handle_search_by_tag`, `handle_search_by_scope`,
//! `handle_delete_memory`) and supplemented with the conversation-history and
//! summary handlers confirmed against `test_conversation_history.py`'s exact
//! request/response shapes (the thin `commands.py` on disk never grew these,
//! but the richer repository and its tests show the surface they were meant
//! to expose).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::EngineError;
use crate::model::{ConversationMessage, Speaker};
use crate::repository::ScoredMessage;
use crate::service::MemoryService;
use crate::store::StoreAdapter;

fn field<'a>(request: &'a Value, key: &str) -> Option<&'a Value> {
    request.get(key)
}

fn str_field(request: &Value, key: &str) -> Option<String> {
    field(request, key).and_then(Value::as_str).map(str::to_string)
}

fn u64_field(request: &Value, key: &str, default: u64) -> u64 {
    field(request, key).and_then(Value::as_u64).unwrap_or(default)
}

fn parse_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&chrono::Utc))
}

fn scored_to_json(hit: &ScoredMessage) -> Value {
    json!({
        "text": hit.message.text,
        "source": "conversation",
        "timestamp": hit.message.timestamp.to_rfc3339(),
        "scope": hit.message.scope,
        "tags": hit.message.tags,
        "confidence": hit.score,
        "memory_id": hit.message.id,
    })
}

fn message_to_json(msg: &ConversationMessage) -> Value {
    json!({
        "memory_id": msg.id,
        "conversation_id": msg.conversation_id,
        "speaker": msg.speaker.to_string(),
        "text": msg.text,
        "scope": msg.scope,
        "tags": msg.tags,
        "timestamp": msg.timestamp.to_rfc3339(),
    })
}

pub async fn handle_ping(request: Value) -> Result<Value, EngineError> {
    let message = str_field(&request, "message").unwrap_or_default();
    Ok(json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().timestamp(),
        "echo": message,
    }))
}

pub async fn handle_get_memory_stats<S: StoreAdapter>(
    service: &MemoryService<S>,
    _request: Value,
) -> Result<Value, EngineError> {
    let stats = service.get_memory_stats().await?;
    Ok(json!({"status": "OK", "stats": stats}))
}

pub async fn handle_store_memory<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let content = str_field(&request, "content")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'content' field".to_string()))?;

    let metadata = field(&request, "metadata").cloned().unwrap_or(json!({}));
    let scope = metadata.get("scope").and_then(Value::as_str).map(str::to_string);
    let tags: BTreeSet<String> = metadata
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let conversation_id = metadata
        .get("conversation_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(crate::model::new_id);
    let speaker = metadata
        .get("speaker")
        .and_then(Value::as_str)
        .unwrap_or("user")
        .parse::<Speaker>()?;

    let stored = service.store_memory(conversation_id, speaker, content, scope.as_deref(), tags).await?;
    Ok(json!({"status": "OK", "memory_id": stored.id, "scope": stored.scope}))
}

pub async fn handle_retrieve_memory<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let query = str_field(&request, "query")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'query' field".to_string()))?;

    let filter = field(&request, "filter").cloned().unwrap_or(json!({}));
    let scope = filter.get("scope").and_then(Value::as_str).map(str::to_string);
    let tags: Vec<String> = filter
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let time_range = filter.get("time_range");
    let from = time_range.and_then(|t| t.get("from")).and_then(Value::as_str).and_then(parse_timestamp);
    let to = time_range.and_then(|t| t.get("to")).and_then(Value::as_str).and_then(parse_timestamp);
    let top_k = u64_field(&request, "top_k", 5) as usize;

    let hits = service.retrieve_memory(&query, scope.as_deref(), &tags, from, to, Some(top_k)).await?;
    let results: Vec<Value> = hits.iter().map(scored_to_json).collect();
    Ok(json!({"status": "OK", "results": results}))
}

pub async fn handle_search_by_tag<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let tag = str_field(&request, "tag")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'tag' field".to_string()))?;
    let query = str_field(&request, "query");

    let mut messages = service.search_by_tag(&tag, None).await?;
    if let Some(q) = query {
        let q = q.to_lowercase();
        messages.retain(|m| m.text.to_lowercase().contains(&q));
    }
    let results: Vec<Value> = messages.iter().map(|m| scored_to_json(&ScoredMessage { message: m.clone(), score: 1.0 })).collect();
    Ok(json!({"status": "OK", "results": results}))
}

pub async fn handle_search_by_scope<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let scope = str_field(&request, "scope")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'scope' field".to_string()))?;
    let query = str_field(&request, "query");

    let mut messages = service.search_by_scope(&scope).await?;
    if let Some(q) = query {
        let q = q.to_lowercase();
        messages.retain(|m| m.text.to_lowercase().contains(&q));
    }
    let results: Vec<Value> = messages.iter().map(|m| scored_to_json(&ScoredMessage { message: m.clone(), score: 1.0 })).collect();
    Ok(json!({"status": "OK", "results": results}))
}

pub async fn handle_delete_memory<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let target = field(&request, "target").cloned().unwrap_or(json!({}));
    let memory_id = target.get("memory_id").and_then(Value::as_str).map(str::to_string);
    let scope = target.get("scope").and_then(Value::as_str).map(str::to_string);
    let tag = target.get("tag").and_then(Value::as_str).map(str::to_string);
    let query = target.get("query").and_then(Value::as_str).map(str::to_string);
    let forget_mode = str_field(&request, "forget_mode").unwrap_or_else(|| "soft".to_string());

    if memory_id.is_none() && scope.is_none() && tag.is_none() && query.is_none() {
        return Err(EngineError::InvalidRequest("at least one deletion criterion is required".to_string()));
    }

    let outcome = service
        .delete_memory(memory_id.as_deref(), scope.as_deref(), tag.as_deref(), query.as_deref(), Some(&forget_mode))
        .await?;
    Ok(json!({
        "status": "OK",
        "deleted_count": outcome.deleted_count,
        "criterion": outcome.criterion,
    }))
}

pub async fn handle_store_conversation_history<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let raw_messages = field(&request, "messages")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'messages' field".to_string()))?;
    let metadata = field(&request, "metadata").cloned().unwrap_or(json!({}));
    let scope = metadata.get("scope").and_then(Value::as_str).map(str::to_string);
    let conversation_id = field(&request, "conversation_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(crate::model::new_id);

    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw in raw_messages {
        let speaker = raw.get("speaker").and_then(Value::as_str).unwrap_or("user").parse::<Speaker>()?;
        let text = raw
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidRequest("message missing 'text' field".to_string()))?
            .to_string();
        messages.push(ConversationMessage {
            id: crate::model::new_id(),
            conversation_id: conversation_id.clone(),
            speaker,
            text,
            scope: String::new(),
            tags: BTreeSet::new(),
            timestamp: chrono::Utc::now(),
        });
    }

    let (conversation_id, memory_ids) = service.store_conversation_history(messages, scope.as_deref()).await?;
    Ok(json!({"status": "OK", "conversation_id": conversation_id, "memory_ids": memory_ids}))
}

pub async fn handle_get_conversation_history<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let conversation_id = str_field(&request, "conversation_id")
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'conversation_id' field".to_string()))?;
    let limit = u64_field(&request, "limit", 50);
    let offset = u64_field(&request, "offset", 0);

    let messages = service.get_conversation_history(&conversation_id, limit, offset).await?;
    let count = messages.len();
    let messages: Vec<Value> = messages.iter().map(message_to_json).collect();
    Ok(json!({"status": "OK", "conversation_id": conversation_id, "messages": messages, "count": count}))
}

pub async fn handle_get_conversations_list<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let limit = u64_field(&request, "limit", 20);
    let scope = str_field(&request, "scope");
    let include_messages = field(&request, "include_messages").and_then(Value::as_bool).unwrap_or(false);

    let rows = service.get_conversations_list(limit, scope.as_deref(), include_messages).await?;
    let conversations: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut value = json!({
                "conversation_id": row.conversation_id,
                "first_timestamp": row.first_timestamp.to_rfc3339(),
                "last_timestamp": row.last_timestamp.to_rfc3339(),
                "message_count": row.message_count,
                "scope": row.scope,
                "first_message": row.first_message.as_ref().map(message_to_json),
            });
            if include_messages {
                value["preview_messages"] =
                    Value::Array(row.preview_messages.iter().map(message_to_json).collect());
            }
            value
        })
        .collect();
    Ok(json!({"status": "OK", "conversations": conversations}))
}

pub async fn handle_create_conversation_summary<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let conversation_id = str_field(&request, "conversation_id")
        .ok_or_else(|| EngineError::InvalidRequest("missing required 'conversation_id' field".to_string()))?;
    let summary_text = str_field(&request, "summary_text");
    let generate_summary = field(&request, "generate_summary").and_then(Value::as_bool).unwrap_or(false);
    let scope = str_field(&request, "scope");

    let (summary, generated) = service
        .create_conversation_summary(conversation_id.clone(), summary_text, generate_summary, scope.as_deref())
        .await?;

    Ok(json!({
        "status": "OK",
        "conversation_id": conversation_id,
        "summary_id": summary.id,
        "summary_text": summary.summary_text,
        "generated": generated,
    }))
}

fn summary_to_json(summary: &crate::model::Summary) -> Value {
    json!({
        "summary_id": summary.id,
        "conversation_id": summary.conversation_id,
        "topic_id": summary.topic_id,
        "summary_text": summary.summary_text,
        "scope": summary.scope,
        "tags": summary.tags,
        "timestamp": summary.timestamp.to_rfc3339(),
        "time_range": {
            "from": summary.time_range.from.to_rfc3339(),
            "to": summary.time_range.to.to_rfc3339(),
        },
        "message_refs": summary.message_refs,
    })
}

/// Covers both `get_conversation_summaries_by_conversation` (routed when
/// `conversation_id` is present) and `get_latest_conversation_summaries`
/// (routed when it's absent) — one action, branching on the request shape,
/// matching how the original test suite exercises a single handler for
/// both call patterns.
pub async fn handle_get_conversation_summaries<S: StoreAdapter>(
    service: &MemoryService<S>,
    request: Value,
) -> Result<Value, EngineError> {
    let summaries = if let Some(conversation_id) = str_field(&request, "conversation_id") {
        service.get_conversation_summaries(&conversation_id).await?
    } else {
        let limit = u64_field(&request, "limit", 10);
        let scope = str_field(&request, "scope");
        service.get_latest_conversation_summaries(limit, scope.as_deref()).await?
    };

    let summaries: Vec<Value> = summaries.iter().map(summary_to_json).collect();
    Ok(json!({"status": "OK", "summaries": summaries}))
}

pub async fn handle_health_check<S: StoreAdapter>(
    service: &MemoryService<S>,
    _request: Value,
) -> Result<Value, EngineError> {
    let health = service.health_check().await;
    Ok(json!({
        "status": "OK",
        "components": {
            "store": if health.store_reachable { "ok" } else { "unreachable" },
            "embedding_worker": if health.embedding_worker_running { "running" } else { "stopped" },
        },
    }))
}

pub async fn handle_optimize_memory<S: StoreAdapter>(
    service: &MemoryService<S>,
    _request: Value,
) -> Result<Value, EngineError> {
    let actions = service.optimize_memory().await?;
    Ok(json!({"status": "OK", "actions": actions}))
}

/// Convenience wrapper binding a `MemoryService` into a dispatcher-shaped
/// handler set. Kept as free functions above (rather than methods) so each
/// can also be called directly in tests without going through JSON.
pub fn register_all<S: StoreAdapter + 'static>(dispatcher: &mut crate::dispatcher::Dispatcher, service: Arc<MemoryService<S>>) {
    dispatcher.register("ping", |req| Box::pin(handle_ping(req)));

    macro_rules! bind {
        ($action:literal, $handler:path) => {{
            let service = Arc::clone(&service);
            dispatcher.register($action, move |req| {
                let service = Arc::clone(&service);
                Box::pin(async move { $handler(&service, req).await })
            });
        }};
    }

    bind!("get_memory_stats", handle_get_memory_stats);
    bind!("store_memory", handle_store_memory);
    bind!("retrieve_memory", handle_retrieve_memory);
    bind!("search_by_tag", handle_search_by_tag);
    bind!("search_by_scope", handle_search_by_scope);
    bind!("delete_memory", handle_delete_memory);
    bind!("store_conversation_history", handle_store_conversation_history);
    bind!("get_conversation_history", handle_get_conversation_history);
    bind!("get_conversations_list", handle_get_conversations_list);
    bind!("create_conversation_summary", handle_create_conversation_summary);
    bind!("get_conversation_summaries", handle_get_conversation_summaries);
    bind!("health_check", handle_health_check);
    bind!("optimize_memory", handle_optimize_memory);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::embedding::EmbeddingService;
    use crate::repository::MemoryRepository;
    use crate::store::memory::InMemoryStore;

    fn service() -> MemoryService<InMemoryStore> {
        let repo = Arc::new(MemoryRepository::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EmbeddingService::new(100, false, true)),
        ));
        MemoryService::new(repo, MemoryConfig::default())
    }

    #[tokio::test]
    async fn ping_echoes_message() {
        let response = handle_ping(json!({"message": "hi"})).await.unwrap();
        assert_eq!(response["status"], "OK");
        assert_eq!(response["echo"], "hi");
    }

    #[tokio::test]
    async fn store_memory_requires_content() {
        let svc = service();
        let err = handle_store_memory(&svc, json!({})).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trip() {
        let svc = service();
        let stored = handle_store_memory(
            &svc,
            json!({"content": "Project Alpha deadline is May 15th", "metadata": {"scope": "Work", "tags": ["deadline"]}}),
        )
        .await
        .unwrap();
        assert_eq!(stored["status"], "OK");

        let retrieved = handle_retrieve_memory(&svc, json!({"query": "May 15th", "filter": {"scope": "Work"}})).await.unwrap();
        let results = retrieved["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["confidence"], 1.0);
    }

    #[tokio::test]
    async fn delete_memory_requires_a_criterion() {
        let svc = service();
        let err = handle_delete_memory(&svc, json!({"target": {}})).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn store_conversation_history_then_round_trip() {
        let svc = service();
        let stored = handle_store_conversation_history(
            &svc,
            json!({
                "messages": [
                    {"speaker": "user", "text": "Hello, Claude!"},
                    {"speaker": "assistant", "text": "Hello! How can I help you today?"}
                ],
                "metadata": {"scope": "TestScope"}
            }),
        )
        .await
        .unwrap();
        assert_eq!(stored["status"], "OK");
        let conversation_id = stored["conversation_id"].as_str().unwrap().to_string();
        assert_eq!(stored["memory_ids"].as_array().unwrap().len(), 2);

        let history = handle_get_conversation_history(&svc, json!({"conversation_id": conversation_id, "limit": 10})).await.unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["speaker"], "user");
        assert_eq!(messages[1]["speaker"], "assistant");
    }

    #[tokio::test]
    async fn create_summary_then_fetch_by_conversation_and_latest() {
        let svc = service();
        let stored = handle_store_conversation_history(
            &svc,
            json!({"messages": [{"speaker": "user", "text": "hi"}, {"speaker": "assistant", "text": "hello"}], "metadata": {"scope": "TestScope"}}),
        )
        .await
        .unwrap();
        let conversation_id = stored["conversation_id"].as_str().unwrap().to_string();

        let summary = handle_create_conversation_summary(
            &svc,
            json!({"conversation_id": conversation_id, "generate_summary": true}),
        )
        .await
        .unwrap();
        assert_eq!(summary["generated"], true);
        assert!(summary["summary_text"].as_str().unwrap().len() > 0);

        let by_conv = handle_get_conversation_summaries(&svc, json!({"conversation_id": conversation_id})).await.unwrap();
        assert_eq!(by_conv["summaries"].as_array().unwrap().len(), 1);

        let latest = handle_get_conversation_summaries(&svc, json!({"limit": 10, "scope": "TestScope"})).await.unwrap();
        assert_eq!(latest["summaries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_check_reports_components() {
        let svc = service();
        let response = handle_health_check(&svc, json!({})).await.unwrap();
        assert_eq!(response["components"]["store"], "ok");
    }

    #[tokio::test]
    async fn get_conversations_list_includes_preview_messages_when_requested() {
        let svc = service();
        handle_store_conversation_history(
            &svc,
            json!({"messages": [{"speaker": "user", "text": "hi"}], "metadata": {"scope": "TestScope"}}),
        )
        .await
        .unwrap();

        let listed = handle_get_conversations_list(&svc, json!({"limit": 5, "scope": "TestScope", "include_messages": true})).await.unwrap();
        let conversations = listed["conversations"].as_array().unwrap();
        assert_eq!(conversations.len(), 1);
        assert!(conversations[0].get("preview_messages").is_some());
    }
}
