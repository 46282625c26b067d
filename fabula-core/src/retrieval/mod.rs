//! Context retrieval: hybrid vector + keyword search with Reciprocal Rank
//! Fusion.
//!
//! Given the player's latest action, the retriever selects a bounded set of
//! older turns, summaries, and background-knowledge fragments to inject into
//! the next prompt. Retrieval is strictly best-effort: every failure degrades
//! to "no additional context" so the narrative pipeline never stalls on it.

mod index;
mod store;

pub use index::{EmbeddingIndexer, IndexJob};
pub use store::{SharedVectorStore, VectorRecord, VectorStore};

use crate::dispatch::IndexSourceKind;
use gemini::Gemini;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// RRF smoothing constant (the standard value from the literature).
const RRF_K: f64 = 60.0;

/// The most recent turns are already in the prompt verbatim; the retriever
/// only supplies older context.
const RECENT_TURN_EXCLUSION: usize = 4;

/// Output budget for the knowledge-selection call.
const SELECTION_MAX_TOKENS: usize = 256;

/// Context selected for the next prompt. Every field falls back to an empty
/// string on internal failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievedContext {
    pub past_turns: String,
    pub past_summaries: String,
    pub knowledge: String,
}

/// Tier of a background-knowledge document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeTier {
    /// Short; always included.
    Overview,
    /// Long; included only when the model deems it relevant to the query.
    Detail,
}

/// A background-knowledge document available to the retriever.
#[derive(Debug, Clone)]
pub struct KnowledgeDoc {
    pub name: String,
    pub tier: KnowledgeTier,
    pub content: String,
}

/// Retrieves prompt context for a world.
pub struct ContextRetriever {
    client: Gemini,
    store: SharedVectorStore,
    knowledge: Vec<KnowledgeDoc>,
    recent_exclusion: usize,
    /// Last query embedding, so a retried action is not re-embedded.
    embed_cache: tokio::sync::Mutex<Option<(String, Vec<f32>)>>,
}

impl ContextRetriever {
    pub fn new(client: Gemini, store: SharedVectorStore) -> Self {
        Self {
            client,
            store,
            knowledge: Vec::new(),
            recent_exclusion: RECENT_TURN_EXCLUSION,
            embed_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Install the world's background-knowledge documents.
    pub fn with_knowledge(mut self, knowledge: Vec<KnowledgeDoc>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Override the recent-turn exclusion window.
    pub fn with_recent_exclusion(mut self, turns: usize) -> Self {
        self.recent_exclusion = turns;
        self
    }

    /// Select context for the query, bounded by `top_k` per category.
    ///
    /// Never errors: any failure (embedding, selection, empty store) yields
    /// empty fields instead.
    pub async fn retrieve_context(
        &self,
        query: &str,
        world_id: Uuid,
        top_k: usize,
    ) -> RetrievedContext {
        if query.trim().is_empty() || top_k == 0 {
            return RetrievedContext::default();
        }

        let query_embedding = match self.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("query embedding failed; skipping retrieval: {e}");
                return RetrievedContext::default();
            }
        };

        let (past_turns, past_summaries) = {
            let store = self.store.read().await;
            let mut turns = store.records_for(world_id, IndexSourceKind::Turn);
            // Exclude the prompt's verbatim recent-history window.
            if let Some(max_index) = turns.iter().map(|r| r.source_index).max() {
                let cutoff = max_index.saturating_sub(self.recent_exclusion.saturating_sub(1));
                turns.retain(|r| r.source_index < cutoff);
            }
            let summaries = store.records_for(world_id, IndexSourceKind::Summary);
            (
                render_pool(&hybrid_top_k(query, &query_embedding, &turns, top_k)),
                render_pool(&hybrid_top_k(query, &query_embedding, &summaries, top_k)),
            )
        };

        let knowledge = self.select_knowledge(query, top_k).await;

        RetrievedContext {
            past_turns,
            past_summaries,
            knowledge,
        }
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, gemini::Error> {
        let mut cache = self.embed_cache.lock().await;
        if let Some((cached_query, embedding)) = cache.as_ref() {
            if cached_query == query {
                return Ok(embedding.clone());
            }
        }
        let embedding = self.client.embed(query).await?;
        *cache = Some((query.to_string(), embedding.clone()));
        Ok(embedding)
    }

    /// Two-tier knowledge filter: overviews always, details only when the
    /// model selects them. Selection failure degrades to overviews only.
    async fn select_knowledge(&self, query: &str, top_k: usize) -> String {
        let mut chosen: Vec<&KnowledgeDoc> = self
            .knowledge
            .iter()
            .filter(|d| d.tier == KnowledgeTier::Overview)
            .collect();

        let details: Vec<&KnowledgeDoc> = self
            .knowledge
            .iter()
            .filter(|d| d.tier == KnowledgeTier::Detail)
            .collect();

        if !details.is_empty() {
            match self.pick_relevant_details(query, &details, top_k).await {
                Ok(names) => {
                    chosen.extend(
                        details
                            .iter()
                            .filter(|d| names.iter().any(|n| n.eq_ignore_ascii_case(&d.name)))
                            .take(top_k),
                    );
                }
                Err(e) => warn!("knowledge selection failed; using overviews only: {e}"),
            }
        }

        chosen
            .iter()
            .map(|d| format!("## {}\n{}", d.name, d.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    async fn pick_relevant_details(
        &self,
        query: &str,
        details: &[&KnowledgeDoc],
        top_k: usize,
    ) -> Result<Vec<String>, gemini::Error> {
        let catalog = details
            .iter()
            .map(|d| format!("- {}", d.name))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Given the player's latest action in an interactive story, select which \
             background documents (at most {top_k}) are relevant to narrating the outcome.\n\n\
             ## Player Action\n{query}\n\n## Documents\n{catalog}\n\n\
             Respond with JSON only."
        );

        let schema = json!({
            "type": "object",
            "properties": {
                "relevant": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["relevant"]
        });

        let request = gemini::Request::user(prompt)
            .with_max_output_tokens(SELECTION_MAX_TOKENS)
            .with_temperature(0.0)
            .with_thinking_budget(0);

        let value = self.client.generate_json(request, schema).await?;
        let names = value["relevant"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

// ============================================================================
// Ranking and fusion
// ============================================================================

/// Rank candidates by both signals and fuse with RRF, keeping the top K.
fn hybrid_top_k<'a>(
    query: &str,
    query_embedding: &[f32],
    candidates: &[&'a VectorRecord],
    top_k: usize,
) -> Vec<&'a VectorRecord> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let vector_ranking = rank_by_cosine(query_embedding, candidates);
    let keyword_ranking = rank_by_keywords(query, candidates);
    let fused = fuse_rrf(&[vector_ranking, keyword_ranking]);

    fused
        .into_iter()
        .take(top_k)
        .map(|idx| candidates[idx])
        .collect()
}

/// Candidate indices ordered by cosine similarity, descending. Candidates
/// with unusable embeddings are absent from the ranking.
fn rank_by_cosine(query_embedding: &[f32], candidates: &[&VectorRecord]) -> Vec<usize> {
    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| {
            cosine_similarity(query_embedding, &record.embedding).map(|score| (idx, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(idx, _)| idx).collect()
}

/// Candidate indices ordered by lexical overlap, descending. Candidates with
/// no shared terms are absent from the ranking.
fn rank_by_keywords(query: &str, candidates: &[&VectorRecord]) -> Vec<usize> {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| {
            let score = keyword_overlap(&query_terms, &record.text);
            (score > 0.0).then_some((idx, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(idx, _)| idx).collect()
}

/// Reciprocal Rank Fusion over candidate-index rankings.
///
/// fused(c) = sum over rankings of 1/(k + rank); a candidate absent from a
/// ranking contributes nothing for it. Returns indices by fused score,
/// descending.
fn fuse_rrf(rankings: &[Vec<usize>]) -> Vec<usize> {
    use std::collections::BTreeMap;

    let mut scores: BTreeMap<usize, f64> = BTreeMap::new();
    for ranking in rankings {
        for (rank, &candidate) in ranking.iter().enumerate() {
            *scores.entry(candidate).or_insert(0.0) += 1.0 / (RRF_K + rank as f64 + 1.0);
        }
    }

    let mut fused: Vec<(usize, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.into_iter().map(|(idx, _)| idx).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x64 = f64::from(x);
        let y64 = f64::from(y);
        dot += x64 * y64;
        norm_a += x64 * x64;
        norm_b += y64 * y64;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}

/// Lowercased alphanumeric terms of a text.
fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// Shared-term count normalized by query length.
fn keyword_overlap(query_terms: &[String], candidate: &str) -> f64 {
    let candidate_terms = terms(candidate);
    if candidate_terms.is_empty() {
        return 0.0;
    }
    let shared = query_terms
        .iter()
        .filter(|t| candidate_terms.contains(t))
        .count();
    shared as f64 / query_terms.len() as f64
}

fn render_pool(records: &[&VectorRecord]) -> String {
    records
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n")
}
