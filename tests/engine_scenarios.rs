//! Cross-module integration tests over the real SQLite-backed engine,
//! covering the store/retrieve, scope isolation, circuit breaker,
//! embedding async+cache, conversation round-trip, and delete cascade
//! scenarios.

use std::collections::BTreeSet;
use std::sync::Arc;

use memory_engine::config::MemoryConfig;
use memory_engine::dispatcher::Dispatcher;
use memory_engine::embedding::EmbeddingService;
use memory_engine::handlers;
use memory_engine::model::{new_id, ConversationMessage, Speaker};
use memory_engine::repository::MemoryRepository;
use memory_engine::service::MemoryService;
use memory_engine::store::sqlite::SqliteStore;
use memory_engine::store::StoreAdapter;
use serde_json::json;

async fn temp_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("memory.sqlite3")).await.unwrap());
    (dir, store)
}

fn build_dispatcher(store: Arc<SqliteStore>) -> Dispatcher {
    let embeddings = Arc::new(EmbeddingService::new(1000, false, true));
    let repo = Arc::new(MemoryRepository::new(store, embeddings));
    let service = Arc::new(MemoryService::new(repo, MemoryConfig::default()));
    let mut dispatcher = Dispatcher::new();
    handlers::register_all(&mut dispatcher, service);
    dispatcher
}

// Scenario A: store then retrieve finds the stored memory via the stdio-shaped dispatcher.
#[tokio::test]
async fn scenario_a_store_then_retrieve() {
    let (_dir, store) = temp_store().await;
    let dispatcher = build_dispatcher(store);

    let stored = dispatcher
        .dispatch(&json!({"action": "store_memory", "content": "The quarterly report is due on the 3rd", "metadata": {"scope": "Work"}}).to_string())
        .await;
    assert_eq!(stored["status"], "OK");

    let retrieved = dispatcher
        .dispatch(&json!({"action": "retrieve_memory", "query": "quarterly report", "filter": {"scope": "Work"}}).to_string())
        .await;
    let results = retrieved["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["text"].as_str().unwrap().contains("quarterly report"));
}

// Scenario B: a memory stored in one scope is invisible to queries scoped elsewhere.
#[tokio::test]
async fn scenario_b_scope_isolation() {
    let (_dir, store) = temp_store().await;
    let dispatcher = build_dispatcher(store);

    dispatcher
        .dispatch(&json!({"action": "store_memory", "content": "Alice's birthday is in March", "metadata": {"scope": "Personal"}}).to_string())
        .await;
    dispatcher
        .dispatch(&json!({"action": "store_memory", "content": "Ship the March release", "metadata": {"scope": "Work"}}).to_string())
        .await;

    let work_results = dispatcher
        .dispatch(&json!({"action": "retrieve_memory", "query": "March", "filter": {"scope": "Work"}}).to_string())
        .await;
    let results = work_results["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["text"].as_str().unwrap().contains("release"));
}

// Scenario C: after enough consecutive failures the circuit opens and rejects
// further requests for that action without invoking the handler.
#[tokio::test]
async fn scenario_c_circuit_breaker_opens_after_repeated_failure() {
    let mut dispatcher = Dispatcher::new();
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    dispatcher.register("always_fails", move |_req| {
        let calls = Arc::clone(&calls_clone);
        Box::pin(async move {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(memory_engine::error::EngineError::StoreError("simulated".to_string()))
        })
    });

    let mut last_response = json!({});
    for _ in 0..3 {
        last_response = dispatcher.dispatch(r#"{"action": "always_fails"}"#).await;
        assert_eq!(last_response["status"], "ERROR");
    }
    assert!(last_response["error"].as_str().unwrap().contains("failed after"));

    let calls_after_open = calls.load(std::sync::atomic::Ordering::Relaxed);
    let rejected = dispatcher.dispatch(r#"{"action": "always_fails"}"#).await;
    assert_eq!(rejected["status"], "ERROR");
    assert!(rejected["error"].as_str().unwrap().contains("temporarily unavailable"));
    assert!(rejected["retry_after"].is_u64());
    assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), calls_after_open);
}

// Scenario D: async embedding generation resolves and subsequently hits the
// cache, which never grows past its configured bound.
#[tokio::test]
async fn scenario_d_embedding_async_and_cache_bound() {
    let mut service = EmbeddingService::new(2, true, true);
    let a = service.generate_async("first memory text").await;
    let b = service.generate_async("second memory text").await;
    let c = service.generate_async("third memory text").await;
    assert_eq!(a.len(), b.len());
    assert_eq!(b.len(), c.len());
    assert!(service.cache_len().await <= 2);
    service.stop_worker(std::time::Duration::from_secs(2)).await;
}

// Scenario E: a batch conversation store round-trips through history lookup
// in original order.
#[tokio::test]
async fn scenario_e_conversation_round_trip() {
    let (_dir, store) = temp_store().await;
    let dispatcher = build_dispatcher(store);

    let stored = dispatcher
        .dispatch(
            &json!({
                "action": "store_conversation_history",
                "messages": [
                    {"speaker": "user", "text": "What's on my calendar today?"},
                    {"speaker": "assistant", "text": "You have a 2pm meeting with the design team."}
                ],
                "metadata": {"scope": "Work"}
            })
            .to_string(),
        )
        .await;
    assert_eq!(stored["status"], "OK");
    let conversation_id = stored["conversation_id"].as_str().unwrap();

    let history = dispatcher
        .dispatch(&json!({"action": "get_conversation_history", "conversation_id": conversation_id, "limit": 10}).to_string())
        .await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["speaker"], "user");
    assert_eq!(messages[1]["speaker"], "assistant");
}

// Scenario F: deleting a memory removes it from lookup and its vector index
// entry, and the delete is idempotent.
#[tokio::test]
async fn scenario_f_delete_cascades_and_is_idempotent() {
    let (_dir, store) = temp_store().await;
    let repo = Arc::new(MemoryRepository::new(Arc::clone(&store), Arc::new(EmbeddingService::new(100, false, true))));

    let message = ConversationMessage {
        id: new_id(),
        conversation_id: new_id(),
        speaker: Speaker::User,
        text: "delete this memory".to_string(),
        scope: "Work".to_string(),
        tags: BTreeSet::new(),
        timestamp: chrono::Utc::now(),
    };
    let stored = repo.store_message(message).await.unwrap();
    repo.settle_embeddings().await;

    let entries_before = store.vector_entries(memory_engine::model::SourceCollection::ConversationHistory, None).await.unwrap();
    assert_eq!(entries_before.len(), 1);

    assert!(repo.delete_message(&stored.id).await.unwrap());
    assert!(!repo.delete_message(&stored.id).await.unwrap());

    let entries_after = store.vector_entries(memory_engine::model::SourceCollection::ConversationHistory, None).await.unwrap();
    assert!(entries_after.is_empty());
    assert!(repo.get_message(&stored.id).await.unwrap().is_none());
}
