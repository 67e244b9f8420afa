//! Embedding-similarity boundary placement.
//!
//! Sentences are embedded by the caller. The cosine distance between each
//! pair of neighbouring sentences is computed, and a new chunk is forced
//! wherever the distance exceeds the configured percentile of all
//! distances. Within a topic group the usual size/overlap packing applies.

use super::units::{refine_oversized, sentence_units, Unit};
use super::{pack, ChunkParams, ChunkStrategy, Chunker, Span};
use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};

pub struct SemanticChunker {
    size: usize,
    overlap: usize,
    percentile: f32,
}

impl SemanticChunker {
    pub fn new(params: &ChunkParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            size: params.chunk_size,
            overlap: params.chunk_overlap,
            percentile: params.breakpoint_percentile,
        })
    }

    /// The sentences whose embeddings [`Self::split_with_vectors`] expects,
    /// in order.
    pub fn sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        sentence_units(text, 0, text.len())
            .into_iter()
            .map(|u| &text[u.start..u.end])
            .collect()
    }

    /// Split using one vector per entry of [`Self::sentences`].
    pub fn split_with_vectors(&self, text: &str, vectors: &[Vec<f32>]) -> Result<Vec<Span>> {
        let sentences = sentence_units(text, 0, text.len());
        if sentences.len() != vectors.len() {
            return Err(RagError::validation(format!(
                "semantic chunker got {} vectors for {} sentences",
                vectors.len(),
                sentences.len()
            )));
        }

        let distances: Vec<f32> = vectors
            .windows(2)
            .map(|w| 1.0 - cosine_similarity(&w[0], &w[1]))
            .collect();
        let threshold = percentile(&distances, self.percentile);

        let mut starts_topic = vec![false; sentences.len()];
        for (i, d) in distances.iter().enumerate() {
            if *d > threshold {
                starts_topic[i + 1] = true;
            }
        }

        let mut units: Vec<Unit> = Vec::with_capacity(sentences.len());
        let mut breaks: Vec<bool> = Vec::with_capacity(sentences.len());
        for (sentence, is_break) in sentences.into_iter().zip(starts_topic) {
            let pieces = refine_oversized(text, vec![sentence], self.size);
            for (j, piece) in pieces.into_iter().enumerate() {
                units.push(piece);
                breaks.push(is_break && j == 0);
            }
        }

        Ok(pack(&units, self.size, self.overlap, &breaks))
    }
}

impl Chunker for SemanticChunker {
    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Semantic
    }

    /// Without vectors there are no topic breakpoints; sentences are packed
    /// by size alone.
    fn split(&self, text: &str) -> Vec<Span> {
        tracing::debug!("semantic chunker used without embeddings, grouping by sentence");
        let units = refine_oversized(text, sentence_units(text, 0, text.len()), self.size);
        pack(&units, self.size, self.overlap, &[])
    }
}

/// Linearly interpolated percentile of `values` (`p` in `[0, 100]`).
fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return f32::INFINITY;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunks_from_spans, tests::assert_covers};

    fn chunker(size: usize, overlap: usize) -> SemanticChunker {
        SemanticChunker::new(&ChunkParams::new(ChunkStrategy::Semantic, size, overlap)).unwrap()
    }

    #[test]
    fn test_breaks_between_topics() {
        let text = "Cats purr. Cats nap. Stocks fell. Bonds rose.";
        let c = chunker(1000, 0);
        let sentences = c.sentences(text);
        assert_eq!(sentences.len(), 4);
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ];
        let spans = c.split_with_vectors(text, &vectors).unwrap();
        let chunks = chunks_from_spans("doc1", text, &spans);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Cats purr. Cats nap. ");
        assert_eq!(chunks[1].text, "Stocks fell. Bonds rose.");
        assert_covers(text, &chunks);
    }

    #[test]
    fn test_uniform_vectors_pack_by_size() {
        let text = "Aa aa aa. Bb bb bb. Cc cc cc. Dd dd dd.";
        let c = chunker(20, 0);
        let vectors = vec![vec![1.0, 1.0]; 4];
        let spans = c.split_with_vectors(text, &vectors).unwrap();
        let chunks = chunks_from_spans("doc1", text, &spans);
        assert_eq!(chunks.len(), 2);
        assert_covers(text, &chunks);
    }

    #[test]
    fn test_vector_count_mismatch() {
        let c = chunker(100, 0);
        let err = c.split_with_vectors("One. Two.", &[vec![1.0]]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_percentile_interpolates() {
        assert!((percentile(&[0.0, 0.0, 1.0], 90.0) - 0.8).abs() < 1e-6);
        assert_eq!(percentile(&[0.5], 90.0), 0.5);
        assert_eq!(percentile(&[], 90.0), f32::INFINITY);
    }
}
