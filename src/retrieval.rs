//! Code retrieval
//!
//! Retrieval port consumed by the workflows and the agent, plus two local
//! implementations:
//! - `InMemoryIndex`: cosine search over embedded code chunks
//! - `CachedRetrieval`: TTL cache in front of any port, keyed by SHA-256
//!
//! Retrieval never aborts a run: `retrieve_context` degrades to an empty
//! string on failure or an empty index.

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::workspace::FilePort;

/// Extensions picked up by [`InMemoryIndex::index_workspace`]
const INDEXED_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "sh", "toml", "md",
];
/// Directories never descended into
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv", "dist", "build"];

/// A ranked chunk of source code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    /// Free-form metadata, usually `{path, start_line, end_line}`
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub score: f32,
}

impl RetrievedChunk {
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("path").and_then(|p| p.as_str())
    }
}

/// Retrieval port.
///
/// Implementations must be safe for concurrent reads from multiple sessions.
#[async_trait]
pub trait RetrievalPort: Send + Sync {
    /// Ranked search, best first
    async fn search(&self, query: &str, limit: usize, min_score: f32) -> Result<Vec<RetrievedChunk>>;

    /// Condensed project-structure summary, if the index has one
    async fn project_map(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Render chunks as prompt context
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        match chunk.source() {
            Some(path) => out.push_str(&format!("# {} (score {:.2})\n", path, chunk.score)),
            None => out.push_str(&format!("# snippet (score {:.2})\n", chunk.score)),
        }
        out.push_str(chunk.content.trim_end());
        out.push_str("\n\n");
    }
    out.trim_end().to_string()
}

/// Search and format, degrading to an empty string on any failure
pub async fn retrieve_context(
    port: Option<&dyn RetrievalPort>,
    query: &str,
    limit: usize,
    min_score: f32,
) -> String {
    let Some(port) = port else {
        return String::new();
    };
    match port.search(query, limit, min_score).await {
        Ok(chunks) => {
            debug!("Retrieved {} chunk(s) for '{}'", chunks.len(), query.chars().take(60).collect::<String>());
            format_context(&chunks)
        }
        Err(e) => {
            warn!("Retrieval failed, continuing without context: {}", e);
            String::new()
        }
    }
}

/// Project map, degrading to an empty string on any failure
pub async fn project_map_or_empty(port: Option<&dyn RetrievalPort>) -> String {
    let Some(port) = port else {
        return String::new();
    };
    match port.project_map().await {
        Ok(map) => map.unwrap_or_default(),
        Err(e) => {
            warn!("Project map unavailable: {}", e);
            String::new()
        }
    }
}

/// Text embedding provider
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Stop words dropped before hashing
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "it", "in", "on", "of", "to", "and", "or", "for", "with", "this",
    "that", "be", "are", "was", "as", "at", "by", "from", "if", "not", "no", "self", "let",
    "def", "fn", "return", "pub", "const", "var",
];

/// Feature-hashing embedder, fully local.
///
/// Identifiers are split on non-alphanumerics and snake/camel case so
/// `parse_config` and `parseConfig` land on the same buckets.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        // split camelCase
        let mut current = String::new();
        let mut prev_lower = false;
        for c in word.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
        .into_iter()
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

struct IndexedChunk {
    content: String,
    metadata: serde_json::Value,
    embedding: Vec<f32>,
}

/// In-memory vector index over code chunks
pub struct InMemoryIndex {
    embedder: Arc<dyn Embedder>,
    chunks: RwLock<Vec<IndexedChunk>>,
    chunk_lines: usize,
}

impl InMemoryIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            chunks: RwLock::new(Vec::new()),
            chunk_lines: 40,
        }
    }

    /// Index with the local hashing embedder
    pub fn local() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }

    pub fn with_chunk_lines(mut self, lines: usize) -> Self {
        self.chunk_lines = lines.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    /// Add a single chunk
    pub async fn add(&self, content: &str, metadata: serde_json::Value) -> Result<()> {
        let embedding = self
            .embedder
            .embed(content)
            .await
            .context("Failed to embed chunk")?;

        self.chunks.write().push(IndexedChunk {
            content: content.to_string(),
            metadata,
            embedding,
        });
        Ok(())
    }

    /// Split a file into fixed line windows and index each
    pub async fn add_file(&self, path: &str, content: &str) -> Result<usize> {
        let lines: Vec<&str> = content.lines().collect();
        let mut added = 0;

        for (i, window) in lines.chunks(self.chunk_lines).enumerate() {
            let text = window.join("\n");
            if text.trim().is_empty() {
                continue;
            }
            let start = i * self.chunk_lines + 1;
            let metadata = serde_json::json!({
                "path": path,
                "start_line": start,
                "end_line": start + window.len() - 1,
            });
            self.add(&text, metadata).await?;
            added += 1;
        }

        debug!("Indexed {} chunk(s) from {}", added, path);
        Ok(added)
    }

    pub fn clear(&self) {
        self.chunks.write().clear();
    }

    /// Walk the workspace breadth-first and index up to `max_files` source files.
    /// Hidden entries, build output and unreadable files are skipped.
    pub async fn index_workspace(&self, files: &dyn FilePort, max_files: usize) -> Result<usize> {
        let mut pending = vec![String::new()];
        let mut indexed = 0usize;

        while let Some(dir) = pending.pop() {
            let entries = match files.list(if dir.is_empty() { "." } else { &dir }).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping directory '{}': {}", dir, e);
                    continue;
                }
            };

            for entry in entries {
                if entry.name.starts_with('.') {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };

                if entry.is_dir {
                    if !SKIPPED_DIRS.contains(&entry.name.as_str()) {
                        pending.push(path);
                    }
                    continue;
                }

                let indexable = path
                    .rsplit_once('.')
                    .map(|(_, ext)| INDEXED_EXTENSIONS.contains(&ext))
                    .unwrap_or(false);
                if !indexable {
                    continue;
                }
                if indexed >= max_files {
                    info!("Index limit of {} file(s) reached", max_files);
                    return Ok(indexed);
                }

                match files.read(&path).await {
                    Ok(content) => {
                        self.add_file(&path, &content).await?;
                        indexed += 1;
                    }
                    Err(e) => debug!("Skipping unreadable file {}: {}", path, e),
                }
            }
        }

        info!("Indexed {} file(s), {} chunk(s)", indexed, self.len());
        Ok(indexed)
    }
}

#[async_trait]
impl RetrievalPort for InMemoryIndex {
    async fn search(&self, query: &str, limit: usize, min_score: f32) -> Result<Vec<RetrievedChunk>> {
        if self.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .context("Failed to embed query")?;

        let chunks = self.chunks.read();
        let mut results: Vec<RetrievedChunk> = chunks
            .iter()
            .map(|c| RetrievedChunk {
                content: c.content.clone(),
                metadata: c.metadata.clone(),
                score: cosine_similarity(&query_embedding, &c.embedding),
            })
            .filter(|c| c.score >= min_score)
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    async fn project_map(&self) -> Result<Option<String>> {
        let chunks = self.chunks.read();
        let mut files: BTreeMap<&str, usize> = BTreeMap::new();
        for chunk in chunks.iter() {
            if let Some(path) = chunk.metadata.get("path").and_then(|p| p.as_str()) {
                *files.entry(path).or_insert(0) += 1;
            }
        }
        if files.is_empty() {
            return Ok(None);
        }

        let map = files
            .iter()
            .map(|(path, n)| format!("{} ({} chunk{})", path, n, if *n == 1 { "" } else { "s" }))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Some(map))
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache decorator for any retrieval port. Errors are never cached.
pub struct CachedRetrieval {
    inner: Arc<dyn RetrievalPort>,
    cache: Cache<String, Vec<RetrievedChunk>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedRetrieval {
    pub fn new(inner: Arc<dyn RetrievalPort>, max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self {
            inner,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Key = SHA256(normalized query, limit, min_score)
    pub fn compute_key(query: &str, limit: usize, min_score: f32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.trim().to_lowercase().as_bytes());
        hasher.update(limit.to_le_bytes());
        hasher.update(min_score.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RetrievalPort for CachedRetrieval {
    async fn search(&self, query: &str, limit: usize, min_score: f32) -> Result<Vec<RetrievedChunk>> {
        let key = Self::compute_key(query, limit, min_score);

        if let Some(hit) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Retrieval cache hit: {}...", &key[..16]);
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let results = self.inner.search(query, limit, min_score).await?;
        self.cache.insert(key, results.clone()).await;
        Ok(results)
    }

    async fn project_map(&self) -> Result<Option<String>> {
        self.inner.project_map().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRetrieval;

    #[async_trait]
    impl RetrievalPort for FailingRetrieval {
        async fn search(&self, _query: &str, _limit: usize, _min_score: f32) -> Result<Vec<RetrievedChunk>> {
            anyhow::bail!("vector store offline")
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_tokenize_splits_identifiers() {
        let tokens = tokenize("def parseConfig(path): return load_file(path)");
        assert!(tokens.contains(&"parse".to_string()));
        assert!(tokens.contains(&"config".to_string()));
        assert!(tokens.contains(&"load".to_string()));
        assert!(!tokens.contains(&"def".to_string()));
    }

    #[test]
    fn test_hashing_embedder_is_normalized() {
        let embedder = HashingEmbedder::new(64);
        let v = embedder.embed_sync("fetch user profile from cache");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
        assert_eq!(v, embedder.embed_sync("fetch user profile from cache"));
    }

    #[tokio::test]
    async fn test_index_ranks_relevant_chunk_first() {
        let index = InMemoryIndex::local();
        index
            .add("def add(a, b):\n    return a + b", serde_json::json!({"path": "math_utils.py"}))
            .await
            .unwrap();
        index
            .add("def send_email(to, body):\n    smtp.send(to, body)", serde_json::json!({"path": "mail.py"}))
            .await
            .unwrap();

        let results = index.search("send an email body", 5, 0.0).await.unwrap();
        assert_eq!(results[0].source(), Some("mail.py"));

        let strict = index.search("send an email body", 5, 0.99).await.unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn test_add_file_and_project_map() {
        let index = InMemoryIndex::local().with_chunk_lines(2);
        let added = index.add_file("src/lib.py", "a = 1\nb = 2\nc = 3\n").await.unwrap();
        assert_eq!(added, 2);

        let map = index.project_map().await.unwrap().unwrap();
        assert_eq!(map, "src/lib.py (2 chunks)");
    }

    #[tokio::test]
    async fn test_index_workspace_skips_noise() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "def run():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("target/out.rs"), "fn x() {}\n").unwrap();
        std::fs::write(dir.path().join(".git/config.toml"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("logo.png"), "not text").unwrap();

        let files = crate::workspace::LocalWorkspace::new(dir.path());
        let index = InMemoryIndex::local();
        let indexed = index.index_workspace(&files, 100).await.unwrap();

        assert_eq!(indexed, 1);
        let map = index.project_map().await.unwrap().unwrap();
        assert_eq!(map, "src/app.py (1 chunk)");
    }

    #[tokio::test]
    async fn test_failure_degrades_to_empty_context() {
        let port = FailingRetrieval;
        let context = retrieve_context(Some(&port), "anything", 5, 0.0).await;
        assert!(context.is_empty());

        assert!(retrieve_context(None, "anything", 5, 0.0).await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_hits() {
        let index = Arc::new(InMemoryIndex::local());
        index.add("fn main() {}", serde_json::json!({"path": "main.rs"})).await.unwrap();

        let cached = CachedRetrieval::new(index, 100, Duration::from_secs(60));
        cached.search("main function", 3, 0.0).await.unwrap();
        cached.search("  MAIN function ", 3, 0.0).await.unwrap();

        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_format_context() {
        let chunks = vec![RetrievedChunk {
            content: "x = 1\n".into(),
            metadata: serde_json::json!({"path": "a.py"}),
            score: 0.5,
        }];
        assert_eq!(format_context(&chunks), "# a.py (score 0.50)\nx = 1");
    }
}
