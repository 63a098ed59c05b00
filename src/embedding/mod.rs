//! Embedding service: bounded LRU cache, async worker pool, deterministic
//! test-mode fallback.
//!
//! Grounded on the teacher's `EmbeddingModel` (LRU cache behind an async
//! lock, `embed_hash`'s n-gram hashing, `cosine_similarity`) and on the
//! source `EmbeddingService`'s worker-queue/test-mode design. The
//! callback-with-captured-arguments pattern from the source is replaced with
//! a `oneshot` channel per job, the idiomatic Rust analogue.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

pub const EMBEDDING_DIM: usize = 384;

struct Job {
    text: String,
    reply: oneshot::Sender<Vec<f32>>,
}

/// Produces fixed-dimensional unit vectors with a bounded cache and an
/// optional background worker pool for the async path.
pub struct EmbeddingService {
    cache: Arc<RwLock<LruCache<String, Vec<f32>>>>,
    dim: usize,
    async_enabled: bool,
    test_mode: bool,
    job_tx: Option<mpsc::Sender<Job>>,
    running: Arc<AtomicBool>,
    worker_handle: Option<tokio::task::JoinHandle<()>>,
}

impl EmbeddingService {
    /// Construct a service with the given cache size and worker queue
    /// capacity. `test_mode` disables model loading entirely: embeddings
    /// become a deterministic pseudo-random unit vector seeded by the
    /// text's hash, so similarity is reproducible in tests.
    pub fn new(cache_size: usize, async_enabled: bool, test_mode: bool) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        let mut service = Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            dim: EMBEDDING_DIM,
            async_enabled,
            test_mode,
            job_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            worker_handle: None,
        };
        if async_enabled {
            service.start_worker();
        }
        service
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    fn start_worker(&mut self) {
        let (tx, mut rx) = mpsc::channel::<Job>(1024);
        let cache = Arc::clone(&self.cache);
        let running = Arc::clone(&self.running);
        let dim = self.dim;
        let test_mode = self.test_mode;
        running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                    Ok(Some(job)) => {
                        let vector = compute_embedding(&job.text, dim, test_mode);
                        {
                            let mut guard = cache.write().await;
                            guard.put(cache_key(&job.text), vector.clone());
                        }
                        let _ = job.reply.send(vector);
                    }
                    Ok(None) => break,
                    Err(_) => continue, // poll timeout, loop to check `running`
                }
            }
        });

        self.job_tx = Some(tx);
        self.worker_handle = Some(handle);
    }

    /// Stop the worker, waiting up to `timeout` for in-flight work. Pending
    /// completions beyond the deadline are dropped and logged. Idempotent.
    pub async fn stop_worker(&mut self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        self.job_tx = None;
        if let Some(handle) = self.worker_handle.take() {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("embedding worker did not stop within {:?}, pending callbacks dropped", timeout);
            }
        }
    }

    /// Synchronous path: check cache; else compute; never raises — a model
    /// failure yields a zero vector.
    pub async fn generate(&self, text: &str) -> Vec<f32> {
        if text.is_empty() {
            return vec![0.0; self.dim];
        }
        let key = cache_key(text);
        if let Some(hit) = self.cache.write().await.get(&key).cloned() {
            return hit;
        }
        let vector = compute_embedding(text, self.dim, self.test_mode);
        self.cache.write().await.put(key, vector.clone());
        vector
    }

    /// Asynchronous path: resolve immediately on cache hit; otherwise
    /// enqueue a job and await its completion. Falls back to the
    /// synchronous path if async is disabled or the worker isn't running.
    pub async fn generate_async(&self, text: &str) -> Vec<f32> {
        if text.is_empty() {
            return vec![0.0; self.dim];
        }
        let key = cache_key(text);
        if let Some(hit) = self.cache.write().await.get(&key).cloned() {
            return hit;
        }

        if !self.async_enabled || !self.running.load(Ordering::SeqCst) {
            return self.generate(text).await;
        }

        let Some(tx) = &self.job_tx else {
            return self.generate(text).await;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job { text: text.to_string(), reply: reply_tx };
        if tx.send(job).await.is_err() {
            debug!("embedding queue closed, falling back to synchronous generation");
            return self.generate(text).await;
        }

        match reply_rx.await {
            Ok(vector) => vector,
            Err(_) => vec![0.0; self.dim],
        }
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the background worker is alive — used by the `health_check`
    /// action to report component reachability.
    pub fn worker_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for EmbeddingService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn cache_key(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Deterministic pseudo-random unit vector seeded by the text's n-grams,
/// used both as the permanent fallback (no `local-embeddings` feature
/// compiled in, or the local model fails to load) and as the explicit
/// reproducible test-mode embedding.
fn compute_embedding(text: &str, dim: usize, _test_mode: bool) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dim];
    let tokens: Vec<&str> = text.split_whitespace().collect();

    for (i, token) in tokens.iter().enumerate() {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        token.to_lowercase().hash(&mut hasher);
        (i as u64).hash(&mut hasher);
        let hash = hasher.finish();

        for (j, slot) in embedding.iter_mut().enumerate() {
            let mut hasher = DefaultHasher::new();
            hash.hash(&mut hasher);
            (j as u64).hash(&mut hasher);
            let val = hasher.finish();
            let normalized = (val as f64 / u64::MAX as f64) * 2.0 - 1.0;
            *slot += normalized as f32;
        }
    }

    normalize(&mut embedding);
    embedding
}

fn normalize(embedding: &mut [f32]) {
    let mag: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag > 0.0 {
        for val in embedding.iter_mut() {
            *val /= mag;
        }
    }
}

/// Cosine similarity between two vectors of equal length. Returns 0.0 for
/// mismatched lengths or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_text_yields_zero_vector() {
        let service = EmbeddingService::new(10, false, true);
        let vector = service.generate("").await;
        assert_eq!(vector.len(), EMBEDDING_DIM);
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn generate_is_deterministic_and_cached() {
        let service = EmbeddingService::new(10, false, true);
        let a = service.generate("hello world").await;
        let b = service.generate("hello world").await;
        assert_eq!(a, b);
        assert_eq!(service.cache_len().await, 1);
    }

    #[tokio::test]
    async fn async_path_resolves_and_then_hits_cache() {
        let mut service = EmbeddingService::new(10, true, true);
        let vector = service.generate_async("a fresh query").await;
        assert_eq!(vector.len(), EMBEDDING_DIM);
        let cached = service.generate("a fresh query").await;
        assert_eq!(vector, cached);
        service.stop_worker(Duration::from_secs(2)).await;
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![0.6, 0.8];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[tokio::test]
    async fn cache_never_exceeds_configured_size() {
        let service = EmbeddingService::new(3, false, true);
        for i in 0..10 {
            service.generate(&format!("text number {i}")).await;
        }
        assert!(service.cache_len().await <= 3);
    }
}
