//! External capability interfaces consumed by RAG pipeline nodes.
//!
//! These traits are the only contact points between the execution core and
//! real plugins (document loaders, embedding models, vector stores,
//! rerankers, LLM clients). This crate ships only small in-memory mock
//! adapters for each — enough to exercise a full pipeline in tests and in the
//! CLI demo — never a production, network-backed implementation.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;

/// A loaded document, prior to chunking.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: Value,
}

impl Document {
    /// Split the document into fixed-size, non-overlapping text chunks.
    ///
    /// Returns a finite sequence; the last chunk may be shorter than `size`.
    pub fn chunk(&self, size: usize) -> Vec<String> {
        if size == 0 || self.content.is_empty() {
            return Vec::new();
        }
        self.content
            .as_bytes()
            .chunks(size)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }
}

/// Loads raw documents from a source identifier (path, URL, collection name).
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, source: &str) -> anyhow::Result<Vec<Document>>;
}

/// Produces fixed-dimension embedding vectors for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, chunks: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// One vector-store hit.
#[derive(Debug, Clone)]
pub struct RetrievedDoc {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

/// A query against the vector store: either a pre-computed vector or raw
/// text the retriever embeds itself.
pub enum RetrieveQuery {
    Vector(Vec<f32>),
    Text(String),
}

/// Stores and retrieves embedded chunks.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn store(&self, vectors: Vec<(String, Vec<f32>, Value)>) -> anyhow::Result<usize>;
    async fn retrieve(&self, query: RetrieveQuery, top_k: usize) -> anyhow::Result<Vec<RetrievedDoc>>;
}

/// Optional re-ordering pass over retrieved documents.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: Vec<RetrievedDoc>) -> anyhow::Result<Vec<RetrievedDoc>>;
}

/// Token usage accounting returned alongside generated text.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The result of a non-streaming generation call.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub usage: Usage,
}

/// One token of a streaming generation. The stream is finite and
/// non-restartable, terminating in an entry with `done: true`.
#[derive(Debug, Clone)]
pub struct StreamToken {
    pub token: String,
    pub done: bool,
    pub usage: Option<Usage>,
}

/// Generates text from a prompt, optionally as a token stream.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GenerateResult>;

    /// Default streaming implementation: run `generate` to completion, then
    /// replay its text as a one-token-per-word stream. Real adapters SHOULD
    /// override this with a genuine incremental stream.
    async fn generate_stream(&self, prompt: &str) -> anyhow::Result<BoxStream<'static, StreamToken>> {
        let result = self.generate(prompt).await?;
        let mut words: Vec<String> = result
            .text
            .split_whitespace()
            .map(|w| w.to_string())
            .collect();
        let usage = result.usage;
        if words.is_empty() {
            words.push(String::new());
        }
        let last_index = words.len() - 1;
        let tokens: Vec<StreamToken> = words
            .into_iter()
            .enumerate()
            .map(|(i, token)| StreamToken {
                token,
                done: i == last_index,
                usage: if i == last_index { Some(usage.clone()) } else { None },
            })
            .collect();
        Ok(stream::iter(tokens).boxed())
    }
}

/// An in-memory `Loader` seeded with a fixed id -> content map, for tests and
/// the CLI demo.
pub struct InMemoryLoader {
    documents: HashMap<String, String>,
}

impl InMemoryLoader {
    pub fn new(documents: HashMap<String, String>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl Loader for InMemoryLoader {
    async fn load(&self, source: &str) -> anyhow::Result<Vec<Document>> {
        match self.documents.get(source) {
            Some(content) => Ok(vec![Document {
                id: source.to_string(),
                content: content.clone(),
                metadata: Value::Null,
            }]),
            None => Err(anyhow::anyhow!("no document registered for source '{source}'")),
        }
    }
}

/// A deterministic, hash-based `Embedder`. Not semantically meaningful; only
/// useful for exercising the pipeline shape without a real model.
pub struct DeterministicEmbedder {
    pub dimensions: usize,
}

impl DeterministicEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            let slot = i % self.dimensions.max(1);
            vec[slot] += byte as f32;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for DeterministicEmbedder {
    async fn embed(&self, chunks: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(chunks.iter().map(|c| self.vector_for(c)).collect())
    }

    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }
}

/// An in-memory vector store using cosine similarity, for tests and demos.
#[derive(Default)]
pub struct InMemoryRetriever {
    store: std::sync::Mutex<Vec<(String, Vec<f32>, Value)>>,
}

impl InMemoryRetriever {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn store(&self, vectors: Vec<(String, Vec<f32>, Value)>) -> anyhow::Result<usize> {
        let mut guard = self.store.lock().unwrap();
        let count = vectors.len();
        guard.extend(vectors);
        Ok(count)
    }

    async fn retrieve(&self, query: RetrieveQuery, top_k: usize) -> anyhow::Result<Vec<RetrievedDoc>> {
        let query_vec = match query {
            RetrieveQuery::Vector(v) => v,
            RetrieveQuery::Text(_) => {
                return Err(anyhow::anyhow!(
                    "InMemoryRetriever requires a pre-embedded vector query"
                ))
            }
        };
        let guard = self.store.lock().unwrap();
        let mut scored: Vec<RetrievedDoc> = guard
            .iter()
            .map(|(id, vec, meta)| RetrievedDoc {
                id: id.clone(),
                score: cosine_similarity(&query_vec, vec),
                metadata: meta.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// A no-op `Reranker` that preserves the retriever's ordering. Stable by
/// construction (it performs no reordering at all), satisfying the
/// stable-tie-break requirement trivially.
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, documents: Vec<RetrievedDoc>) -> anyhow::Result<Vec<RetrievedDoc>> {
        Ok(documents)
    }
}

/// A deterministic mock `Llm` that echoes the prompt back with a fixed
/// prefix, for tests and the CLI demo.
pub struct MockLlm {
    pub prefix: String,
}

impl MockLlm {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GenerateResult> {
        let text = format!("{}{}", self.prefix, prompt);
        let usage = Usage {
            prompt_tokens: prompt.split_whitespace().count() as u32,
            completion_tokens: text.split_whitespace().count() as u32,
        };
        Ok(GenerateResult { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_into_fixed_size_pieces() {
        let doc = Document {
            id: "d1".into(),
            content: "abcdefghij".into(),
            metadata: Value::Null,
        };
        let chunks = doc.chunk(4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn chunking_empty_content_yields_no_chunks() {
        let doc = Document {
            id: "d1".into(),
            content: String::new(),
            metadata: Value::Null,
        };
        assert!(doc.chunk(4).is_empty());
    }

    #[tokio::test]
    async fn in_memory_retriever_ranks_by_cosine_similarity() {
        let retriever = InMemoryRetriever::new();
        retriever
            .store(vec![
                ("a".into(), vec![1.0, 0.0], Value::Null),
                ("b".into(), vec![0.0, 1.0], Value::Null),
            ])
            .await
            .unwrap();

        let hits = retriever
            .retrieve(RetrieveQuery::Vector(vec![1.0, 0.0]), 2)
            .await
            .unwrap();

        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn mock_llm_stream_terminates_with_done_true() {
        let llm = MockLlm::new("echo: ");
        let mut stream = llm.generate_stream("one two three").await.unwrap();
        let mut saw_done = false;
        while let Some(tok) = stream.next().await {
            if tok.done {
                saw_done = true;
                assert!(tok.usage.is_some());
            }
        }
        assert!(saw_done);
    }
}
