//! Text chunking strategies.
//!
//! Splits document text into an ordered sequence of [`Chunk`]s under a
//! size/overlap policy. Sizes are measured in characters.
//!
//! | Strategy | Units | Oversized units |
//! |----------|-------|-----------------|
//! | `fixed` | characters, fixed stride | never |
//! | `recursive` | `\n\n`, `\n`, `. `, `, `, ` `, then characters | never |
//! | `sentence` | sentences, then words | single words emitted whole |
//! | `paragraph` | paragraphs, then words | single words emitted whole |
//! | `semantic` | sentences grouped at embedding-distance breakpoints | single words emitted whole |
//!
//! # Algorithm
//!
//! 1. The strategy tiles the text into contiguous units (separators stay
//!    attached to the unit they end).
//! 2. Units are packed greedily into chunks of at most `chunk_size` chars.
//! 3. The next chunk restarts at the longest unit suffix of the previous one
//!    that fits inside `chunk_overlap`, so consecutive chunks touch or overlap.
//!
//! Because units tile the input and chunks are runs of units that touch or
//! overlap, the union of chunk spans is the whole text.
//!
//! # Example
//!
//! ```rust
//! use ragline_core::chunk::{build_chunker, chunk_text, ChunkParams, ChunkStrategy};
//!
//! let params = ChunkParams::new(ChunkStrategy::Fixed, 1000, 100);
//! let chunker = build_chunker(&params).unwrap();
//! let text = "x".repeat(3000);
//! let chunks = chunk_text("doc-1", &text, chunker.as_ref());
//! assert_eq!(chunks.len(), 4);
//! assert_eq!(chunks[3].chunk_index, 3);
//! ```

mod semantic;
mod units;

pub use semantic::SemanticChunker;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::Chunk;
use units::{
    paragraph_units, recursive_units, refine_oversized, sentence_units, Unit,
    RECURSIVE_SEPARATORS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Fixed,
    Recursive,
    Sentence,
    Paragraph,
    Semantic,
}

impl ChunkStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Recursive => "recursive",
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Semantic => "semantic",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "recursive" => Ok(ChunkStrategy::Recursive),
            "sentence" => Ok(ChunkStrategy::Sentence),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "semantic" => Ok(ChunkStrategy::Semantic),
            other => Err(RagError::validation(format!(
                "unknown chunking strategy '{other}' (expected fixed, recursive, sentence, paragraph or semantic)"
            ))),
        }
    }
}

/// Size/overlap policy for one chunking run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Percentile of adjacent-sentence distances above which the semantic
    /// strategy starts a new chunk.
    #[serde(default = "default_breakpoint_percentile")]
    pub breakpoint_percentile: f32,
}

fn default_breakpoint_percentile() -> f32 {
    90.0
}

impl ChunkParams {
    pub fn new(strategy: ChunkStrategy, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            strategy,
            chunk_size,
            chunk_overlap,
            breakpoint_percentile: default_breakpoint_percentile(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::validation("chunk_size must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=100.0).contains(&self.breakpoint_percentile) {
            return Err(RagError::validation(
                "breakpoint_percentile must be within [0, 100]",
            ));
        }
        Ok(())
    }
}

/// A byte span of the source text selected as one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub oversized: bool,
}

/// A deterministic text splitter.
pub trait Chunker: Send + Sync {
    fn strategy(&self) -> ChunkStrategy;

    /// Split `text` into ordered spans. Empty text yields no spans.
    fn split(&self, text: &str) -> Vec<Span>;
}

/// Resolve a strategy to its chunker, validating the parameters first.
///
/// The semantic strategy resolves to a [`SemanticChunker`] which, used through
/// this trait, has no sentence vectors and groups by sentences only. Callers
/// that can embed should call [`SemanticChunker::split_with_vectors`].
pub fn build_chunker(params: &ChunkParams) -> Result<Box<dyn Chunker>> {
    params.validate()?;
    let size = params.chunk_size;
    let overlap = params.chunk_overlap;
    Ok(match params.strategy {
        ChunkStrategy::Fixed => Box::new(FixedSizeChunker { size, overlap }),
        ChunkStrategy::Recursive => Box::new(RecursiveChunker { size, overlap }),
        ChunkStrategy::Sentence => Box::new(SentenceChunker { size, overlap }),
        ChunkStrategy::Paragraph => Box::new(ParagraphChunker { size, overlap }),
        ChunkStrategy::Semantic => Box::new(SemanticChunker::new(params)?),
    })
}

/// Split with `chunker` and materialise the spans as [`Chunk`]s.
pub fn chunk_text(document_id: &str, text: &str, chunker: &dyn Chunker) -> Vec<Chunk> {
    chunks_from_spans(document_id, text, &chunker.split(text))
}

/// Cut every span longer than `limit` chars into consecutive `limit`-char
/// pieces. Pieces keep the span's `oversized` flag, so a single unit too
/// long for storage still lands in the index in order.
pub fn cap_spans(text: &str, spans: Vec<Span>, limit: usize) -> Vec<Span> {
    if limit == 0 {
        return spans;
    }
    let mut out = Vec::with_capacity(spans.len());
    for span in spans {
        let body = &text[span.start..span.end];
        if body.chars().count() <= limit {
            out.push(span);
            continue;
        }
        let mut cuts: Vec<usize> = body
            .char_indices()
            .map(|(i, _)| span.start + i)
            .step_by(limit)
            .collect();
        cuts.push(span.end);
        for w in cuts.windows(2) {
            out.push(Span {
                start: w[0],
                end: w[1],
                oversized: span.oversized,
            });
        }
    }
    out
}

/// Build chunks with contiguous indices from already computed spans.
pub fn chunks_from_spans(document_id: &str, text: &str, spans: &[Span]) -> Vec<Chunk> {
    spans
        .iter()
        .enumerate()
        .map(|(i, span)| {
            if span.oversized {
                tracing::warn!(
                    document_id,
                    chunk_index = i,
                    bytes = span.end - span.start,
                    "indivisible unit exceeds chunk_size, emitted whole"
                );
            }
            make_chunk(document_id, i as i64, text, *span)
        })
        .collect()
}

fn make_chunk(document_id: &str, index: i64, text: &str, span: Span) -> Chunk {
    let body = &text[span.start..span.end];
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: body.to_string(),
        hash,
        start: span.start,
        end: span.end,
        oversized: span.oversized,
    }
}

/// Greedily pack units into spans of at most `size` chars, carrying up to
/// `overlap` chars of trailing units into the next span. `breaks[i]` forces
/// a new span to begin at unit `i` with no carried overlap.
pub(crate) fn pack(units: &[Unit], size: usize, overlap: usize, breaks: &[bool]) -> Vec<Span> {
    let hard = |i: usize| breaks.get(i).copied().unwrap_or(false);
    let n = units.len();
    let mut spans = Vec::new();
    let mut start = 0;

    while start < n {
        let mut end = start;
        let mut len = 0;
        while end < n {
            if end > start && (len + units[end].chars > size || hard(end)) {
                break;
            }
            len += units[end].chars;
            end += 1;
        }
        spans.push(Span {
            start: units[start].start,
            end: units[end - 1].end,
            oversized: end - start == 1 && len > size,
        });
        if end == n {
            break;
        }
        if hard(end) {
            start = end;
            continue;
        }

        let mut next = end;
        let mut carried = 0;
        while next > start + 1 {
            let c = units[next - 1].chars;
            if carried + c > overlap || carried + c + units[end].chars > size {
                break;
            }
            carried += c;
            next -= 1;
        }
        start = next;
    }
    spans
}

// ============ Strategies ============

/// Fixed windows of `size` chars advancing by `size - overlap`.
pub struct FixedSizeChunker {
    size: usize,
    overlap: usize,
}

impl Chunker for FixedSizeChunker {
    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Fixed
    }

    fn split(&self, text: &str) -> Vec<Span> {
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let n = bounds.len() - 1;

        let mut spans = Vec::new();
        let mut start = 0;
        while start < n {
            let end = (start + self.size).min(n);
            spans.push(Span {
                start: bounds[start],
                end: bounds[end],
                oversized: false,
            });
            if end == n {
                break;
            }
            start = end - self.overlap;
        }
        spans
    }
}

pub struct RecursiveChunker {
    size: usize,
    overlap: usize,
}

impl Chunker for RecursiveChunker {
    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Recursive
    }

    fn split(&self, text: &str) -> Vec<Span> {
        let units = recursive_units(text, 0, text.len(), RECURSIVE_SEPARATORS, self.size);
        pack(&units, self.size, self.overlap, &[])
    }
}

pub struct SentenceChunker {
    size: usize,
    overlap: usize,
}

impl Chunker for SentenceChunker {
    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Sentence
    }

    fn split(&self, text: &str) -> Vec<Span> {
        let units = refine_oversized(text, sentence_units(text, 0, text.len()), self.size);
        pack(&units, self.size, self.overlap, &[])
    }
}

pub struct ParagraphChunker {
    size: usize,
    overlap: usize,
}

impl Chunker for ParagraphChunker {
    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Paragraph
    }

    fn split(&self, text: &str) -> Vec<Span> {
        let units = refine_oversized(text, paragraph_units(text, 0, text.len()), self.size);
        pack(&units, self.size, self.overlap, &[])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Spans start at 0, end at `text.len()`, and each touches or overlaps
    /// the previous one.
    pub(crate) fn assert_covers(text: &str, chunks: &[Chunk]) {
        if text.is_empty() {
            assert!(chunks.is_empty());
            return;
        }
        assert_eq!(chunks[0].start, 0);
        for pair in chunks.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between chunks");
            assert!(pair[1].start > pair[0].start, "chunk did not advance");
        }
        assert_eq!(chunks[chunks.len() - 1].end, text.len());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.text, &text[c.start..c.end]);
        }
    }

    fn chunk_with(strategy: ChunkStrategy, text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
        let chunker = build_chunker(&ChunkParams::new(strategy, size, overlap)).unwrap();
        chunk_text("doc1", text, chunker.as_ref())
    }

    fn sample_text() -> String {
        (0..40)
            .map(|i| {
                format!(
                    "Paragraph {i} talks about topic number {i}. It has two sentences, with a comma.\n\n"
                )
            })
            .collect()
    }

    #[test]
    fn test_fixed_3000_chars_gives_four_chunks() {
        let text: String = (0..3000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let chunks = chunk_with(ChunkStrategy::Fixed, &text, 1000, 100);
        assert_eq!(chunks.len(), 4);
        let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(chunks[1].start, 900);
        assert_eq!(chunks[3].end, 3000);
        assert_covers(&text, &chunks);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let err = build_chunker(&ChunkParams::new(ChunkStrategy::Recursive, 100, 100)).err();
        assert!(matches!(err, Some(RagError::Validation(_))));
        let err = build_chunker(&ChunkParams::new(ChunkStrategy::Fixed, 100, 250)).err();
        assert!(matches!(err, Some(RagError::Validation(_))));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = "tokens".parse::<ChunkStrategy>().unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!("paragraph".parse::<ChunkStrategy>().unwrap(), ChunkStrategy::Paragraph);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        for strategy in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Recursive,
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
        ] {
            assert!(chunk_with(strategy, "", 50, 5).is_empty(), "{strategy}");
        }
    }

    #[test]
    fn test_cap_spans_splits_long_word() {
        let word = "é".repeat(25);
        let text = format!("Short one. {word} tail.");
        let chunker = build_chunker(&ChunkParams::new(ChunkStrategy::Sentence, 12, 0)).unwrap();
        let spans = chunker.split(&text);
        assert!(spans.iter().any(|s| s.oversized));

        let capped = cap_spans(&text, spans, 10);
        let chunks = chunks_from_spans("doc1", &text, &capped);
        assert_covers(&text, &chunks);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 10));
        assert!(chunks.iter().filter(|c| c.oversized).count() >= 3);
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_with(ChunkStrategy::Recursive, "Hello, world!", 512, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_all_strategies_cover_and_bound() {
        let text = sample_text();
        for strategy in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Recursive,
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
        ] {
            for (size, overlap) in [(200, 0), (200, 40), (97, 13), (1000, 999)] {
                let chunks = chunk_with(strategy, &text, size, overlap);
                assert!(chunks.len() > 1, "{strategy} {size}/{overlap}");
                assert_covers(&text, &chunks);
                for c in &chunks {
                    assert!(
                        c.oversized || c.text.chars().count() <= size,
                        "{strategy}: chunk {} too long",
                        c.chunk_index
                    );
                }
            }
        }
    }

    #[test]
    fn test_recursive_prefers_paragraph_boundaries() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird paragraph here.";
        let chunks = chunk_with(ChunkStrategy::Recursive, text, 30, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "First paragraph here.\n\n");
        assert_eq!(chunks[2].text, "Third paragraph here.");
    }

    #[test]
    fn test_overlap_repeats_trailing_text() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = chunk_with(ChunkStrategy::Recursive, text, 20, 10);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            assert!(pair[1].start < pair[0].end, "expected overlap");
        }
        assert_covers(text, &chunks);
    }

    #[test]
    fn test_sentence_oversized_word_flagged() {
        let long_word = "x".repeat(40);
        let text = format!("Short one. {long_word} tail words here.");
        let chunks = chunk_with(ChunkStrategy::Sentence, &text, 20, 0);
        assert_covers(&text, &chunks);
        let flagged: Vec<&Chunk> = chunks.iter().filter(|c| c.oversized).collect();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].text.starts_with(&long_word));
    }

    #[test]
    fn test_fixed_and_recursive_never_oversized() {
        let text = "y".repeat(500);
        for strategy in [ChunkStrategy::Fixed, ChunkStrategy::Recursive] {
            let chunks = chunk_with(strategy, &text, 64, 8);
            assert!(chunks.iter().all(|c| !c.oversized));
            assert_covers(&text, &chunks);
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Héllo wörld      │\n└──────────────────┘";
        for strategy in [ChunkStrategy::Fixed, ChunkStrategy::Recursive, ChunkStrategy::Sentence] {
            let chunks = chunk_with(strategy, text, 7, 2);
            assert_covers(text, &chunks);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = sample_text();
        let a = chunk_with(ChunkStrategy::Paragraph, &text, 150, 20);
        let b = chunk_with(ChunkStrategy::Paragraph, &text, 150, 20);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
            assert_eq!((x.start, x.end), (y.start, y.end));
        }
    }
}
