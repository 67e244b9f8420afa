//! Retrieval modes and score fusion.
//!
//! | Mode | Candidates | Score |
//! |------|------------|-------|
//! | `vector` | cosine similarity | raw cosine |
//! | `keyword` | BM25 over chunk text | min-max normalised BM25 |
//! | `hybrid` | both lists, merged by chunk id | `α × vector + (1 − α) × keyword` |
//!
//! Both candidate lists are min-max normalised to `[0, 1]` before they are
//! blended; a chunk found by only one retriever scores 0 on the other.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::models::ScoredChunk;
use crate::store::rank_results;

/// BM25 term-frequency saturation.
const BM25_K1: f32 = 1.2;
/// BM25 length normalisation.
const BM25_B: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Vector,
    Keyword,
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalMode::Vector => "vector",
            RetrievalMode::Keyword => "keyword",
            RetrievalMode::Hybrid => "hybrid",
        }
    }

    pub fn uses_vectors(self) -> bool {
        self != RetrievalMode::Keyword
    }

    pub fn uses_keywords(self) -> bool {
        self != RetrievalMode::Vector
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" | "semantic" => Ok(RetrievalMode::Vector),
            "keyword" | "bm25" => Ok(RetrievalMode::Keyword),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            other => Err(RagError::validation(format!(
                "unknown retrieval mode '{other}' (expected vector, keyword or hybrid)"
            ))),
        }
    }
}

/// Lowercased alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// BM25 score of every document in `docs` against `query`. Documents that
/// share no term with the query score 0.
pub fn bm25_scores(query: &str, docs: &[&str]) -> Vec<f32> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() || docs.is_empty() {
        return vec![0.0; docs.len()];
    }

    let tokenized: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d)).collect();
    let n = docs.len() as f32;
    let avg_len = tokenized.iter().map(Vec::len).sum::<usize>() as f32 / n;

    let idf: Vec<f32> = terms
        .iter()
        .map(|t| {
            let df = tokenized.iter().filter(|d| d.contains(t)).count() as f32;
            ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
        })
        .collect();

    tokenized
        .iter()
        .map(|doc| {
            let norm = 1.0 - BM25_B + BM25_B * doc.len() as f32 / avg_len.max(1.0);
            terms
                .iter()
                .zip(&idf)
                .map(|(t, idf)| {
                    let tf = doc.iter().filter(|w| *w == t).count() as f32;
                    idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm)
                })
                .sum()
        })
        .collect()
}

/// Rescale scores to `[0, 1]`. A list whose scores are all equal maps to 1.
pub fn normalize_scores(chunks: &mut [ScoredChunk]) {
    let min = chunks.iter().map(|c| c.score).fold(f32::INFINITY, f32::min);
    let max = chunks.iter().map(|c| c.score).fold(f32::NEG_INFINITY, f32::max);
    for c in chunks.iter_mut() {
        c.score = if (max - min).abs() < f32::EPSILON {
            1.0
        } else {
            (c.score - min) / (max - min)
        };
    }
}

/// Blend keyword and vector candidates into at most `k` results.
///
/// `alpha` weighs the vector side. Results are ordered by blended score,
/// then lower `chunk_index`, then the order in which the chunk was first
/// seen (vector candidates first).
pub fn merge_hybrid(
    mut keyword: Vec<ScoredChunk>,
    mut vector: Vec<ScoredChunk>,
    alpha: f32,
    k: usize,
) -> Vec<ScoredChunk> {
    let alpha = alpha.clamp(0.0, 1.0);
    normalize_scores(&mut keyword);
    normalize_scores(&mut vector);

    let mut merged: Vec<(ScoredChunk, u64)> = Vec::with_capacity(keyword.len() + vector.len());
    let mut position: HashMap<String, usize> = HashMap::new();

    for mut chunk in vector {
        chunk.score *= alpha;
        position.insert(chunk.chunk_id.clone(), merged.len());
        let seq = merged.len() as u64;
        merged.push((chunk, seq));
    }
    for mut chunk in keyword {
        let weighted = chunk.score * (1.0 - alpha);
        match position.get(&chunk.chunk_id) {
            Some(&i) => merged[i].0.score += weighted,
            None => {
                chunk.score = weighted;
                let seq = merged.len() as u64;
                merged.push((chunk, seq));
            }
        }
    }
    rank_results(merged, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, idx: i64, score: f32) -> ScoredChunk {
        ScoredChunk {
            document_id: "d".into(),
            chunk_id: id.into(),
            chunk_index: idx,
            content: String::new(),
            score,
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Hybrid".parse::<RetrievalMode>().unwrap(), RetrievalMode::Hybrid);
        assert_eq!("bm25".parse::<RetrievalMode>().unwrap(), RetrievalMode::Keyword);
        assert_eq!("fuzzy".parse::<RetrievalMode>().unwrap_err().kind(), "validation");
        assert_eq!(RetrievalMode::default(), RetrievalMode::Vector);
    }

    #[test]
    fn test_bm25_prefers_matching_docs() {
        let docs = [
            "visa applications take ten days",
            "pasta cooks in ten minutes",
            "visa visa visa fees",
        ];
        let scores = bm25_scores("Visa fees?", &docs);
        assert_eq!(scores[1], 0.0);
        assert!(scores[2] > scores[0]);
        assert!(scores[0] > 0.0);
    }

    #[test]
    fn test_bm25_empty_query() {
        assert_eq!(bm25_scores("  ?! ", &["a b"]), vec![0.0]);
    }

    #[test]
    fn test_normalize_scores() {
        let mut hits = vec![hit("a", 0, 2.0), hit("b", 1, 4.0), hit("c", 2, 3.0)];
        normalize_scores(&mut hits);
        let scores: Vec<f32> = hits.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![0.0, 1.0, 0.5]);

        let mut same = vec![hit("a", 0, 0.3), hit("b", 1, 0.3)];
        normalize_scores(&mut same);
        assert!(same.iter().all(|h| h.score == 1.0));
    }

    #[test]
    fn test_merge_hybrid_dedups_and_blends() {
        let vector = vec![hit("a", 0, 0.9), hit("b", 1, 0.5), hit("c", 2, 0.1)];
        let keyword = vec![hit("c", 2, 8.0), hit("d", 3, 2.0)];
        let merged = merge_hybrid(keyword, vector, 0.5, 10);

        // a: 0.5 * 1 + 0.5 * 0, c: 0.5 * 0 + 0.5 * 1, b: 0.5 * 0.5, d: 0.
        let ids: Vec<&str> = merged.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b", "d"]);
        assert!((merged[1].score - 0.5).abs() < 1e-6);
        assert!((merged[2].score - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_merge_hybrid_keyword_only_keeps_all() {
        let keyword = vec![hit("x", 0, 3.0), hit("y", 1, 1.0)];
        let merged = merge_hybrid(keyword, Vec::new(), 0.0, 5);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].chunk_id, "x");
        assert_eq!(merged[0].score, 1.0);
    }

    #[test]
    fn test_merge_hybrid_respects_k() {
        let vector = (0..6).map(|i| hit(&format!("v{i}"), i, 1.0 - i as f32 / 10.0)).collect();
        assert_eq!(merge_hybrid(Vec::new(), vector, 0.7, 2).len(), 2);
    }
}
