use super::RetrievalHit;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Similarity search over a persisted portfolio index.
#[async_trait]
pub trait VectorIndex: Send + Sync + std::fmt::Debug {
    /// Up to `k` hits, most similar first.
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>>;
}

/// Text → vector embedding.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

/// Local embeddings through fastembed (BGE-small-en-v1.5).
pub struct FastEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model", &"BGESmallENV15")
            .finish()
    }
}

impl FastEmbedder {
    /// Load the model, downloading it on first use.
    pub async fn initialize() -> Result<Self> {
        info!("Initializing fastembed model (BG-Small-En-V1.5)...");
        let model = tokio::task::spawn_blocking(|| {
            let mut options = InitOptions::new(EmbeddingModel::BGESmallENV15);
            options.show_download_progress = false;
            TextEmbedding::try_new(options)
        })
        .await??;

        Ok(Self {
            model: Arc::new(Mutex::new(Some(model))),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut model_guard = self.model.lock().await;
        // The model is moved into the blocking task and put back afterwards.
        let mut owned_model = model_guard
            .take()
            .context("Embedding model unavailable after a previous failure")?;

        let (embeddings_res, returned_model) = tokio::task::spawn_blocking(move || {
            let res = owned_model.embed(texts, None);
            (res, owned_model)
        })
        .await?;

        *model_guard = Some(returned_model);
        embeddings_res.map_err(|e| anyhow::anyhow!(e))
    }
}

/// One record of the portfolio snapshot file.
#[derive(Debug, Deserialize)]
struct DocumentRecord {
    content: String,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug)]
struct IndexedDocument {
    hit: RetrievalHit,
    embedding: Vec<f32>,
}

/// In-memory cosine-similarity index over a pre-chunked portfolio snapshot.
#[derive(Debug)]
pub struct MemoryIndex {
    documents: Vec<IndexedDocument>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryIndex {
    /// Load a JSON array of `{content, metadata, embedding?}` records,
    /// embedding any record that has no stored embedding.
    pub async fn load(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read portfolio snapshot {}", path.display()))?;
        let records: Vec<DocumentRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid portfolio snapshot {}", path.display()))?;
        Self::from_records(records, embedder).await
    }

    /// Build from hits that still need embedding.
    pub async fn from_hits(hits: Vec<RetrievalHit>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let records = hits
            .into_iter()
            .map(|h| DocumentRecord {
                content: h.content,
                metadata: h.metadata,
                embedding: None,
            })
            .collect();
        Self::from_records(records, embedder).await
    }

    async fn from_records(records: Vec<DocumentRecord>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let missing: Vec<String> = records
            .iter()
            .filter(|r| r.embedding.is_none())
            .map(|r| r.content.clone())
            .collect();

        let mut fresh = if missing.is_empty() {
            Vec::new()
        } else {
            info!(count = missing.len(), "Embedding portfolio documents");
            let embedded = embedder.embed_batch(missing.clone()).await?;
            anyhow::ensure!(
                embedded.len() == missing.len(),
                "embedder returned {} vectors for {} documents",
                embedded.len(),
                missing.len()
            );
            embedded
        }
        .into_iter();

        let mut documents = Vec::with_capacity(records.len());
        for record in records {
            let embedding = match record.embedding {
                Some(e) => e,
                None => fresh
                    .next()
                    .context("embedding count mismatch while building index")?,
            };
            documents.push(IndexedDocument {
                hit: RetrievalHit {
                    content: record.content,
                    metadata: record.metadata,
                },
                embedding,
            });
        }

        info!(documents = documents.len(), "Portfolio index ready");
        Ok(Self {
            documents,
            embedder,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        let query_embedding = self
            .embedder
            .embed_batch(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .context("embedder returned no vector for the query")?;

        let mut scored: Vec<(f32, &IndexedDocument)> = self
            .documents
            .iter()
            .map(|d| (cosine_similarity(&query_embedding, &d.embedding), d))
            .collect();
        // Stable sort: ties keep snapshot order.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, d)| d.hit.clone())
            .collect())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
