//! Separator-aware, token-bounded text chunker.
//!
//! Splits one large corpus string into [`DocumentChunk`]s. The text is first
//! cut on a separator (literal or regex), then the resulting segments are
//! greedily packed into chunks of at most `chunk_size` tokens. When a chunk
//! is full, the next one starts by repeating the trailing segments of the
//! previous chunk, up to `chunk_overlap` tokens.
//!
//! Every chunk is a contiguous, whitespace-trimmed slice of the source, so
//! `start..end` offsets and the `overlap` prefix length are enough to put
//! the source back together (see [`reconstruct`]). Segments that are larger
//! than the budget on their own are hard-split at whitespace, then at
//! character boundaries.
//!
//! Tokenizing is linear in the input: segments and gaps are counted once,
//! and each finished chunk once more to confirm it fits.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::Arc;

use crate::config::ChunkingConfig;
use crate::models::DocumentChunk;
use crate::tokens::TokenCounter;

/// How segments are delimited in the source text.
#[derive(Debug, Clone)]
pub enum Separator {
    Literal(String),
    Pattern(Regex),
}

impl Separator {
    pub fn new(separator: &str, is_regex: bool) -> Result<Self> {
        if separator.is_empty() {
            bail!("separator must not be empty");
        }
        if is_regex {
            Ok(Separator::Pattern(Regex::new(separator)?))
        } else {
            Ok(Separator::Literal(separator.to_string()))
        }
    }

    /// Byte ranges of separator occurrences, in order. Empty regex matches are ignored.
    fn matches(&self, text: &str) -> Vec<(usize, usize)> {
        match self {
            Separator::Literal(sep) => text
                .match_indices(sep.as_str())
                .map(|(i, m)| (i, i + m.len()))
                .collect(),
            Separator::Pattern(re) => re
                .find_iter(text)
                .filter(|m| !m.is_empty())
                .map(|m| (m.start(), m.end()))
                .collect(),
        }
    }
}

/// Token-bounded chunker over a shared [`TokenCounter`].
pub struct DocumentChunker {
    counter: Arc<dyn TokenCounter>,
    separator: Separator,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentChunker {
    pub fn new(
        counter: Arc<dyn TokenCounter>,
        separator: Separator,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(Self {
            counter,
            separator,
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn from_config(config: &ChunkingConfig, counter: Arc<dyn TokenCounter>) -> Result<Self> {
        let separator = Separator::new(&config.separator, config.separator_is_regex)?;
        Self::new(counter, separator, config.chunk_size, config.chunk_overlap)
    }

    /// Split `text` into chunks with contiguous indices starting at 0.
    ///
    /// Returns no chunks for empty or whitespace-only input.
    ///
    /// Each segment and each gap between segments is counted once; chunks are
    /// packed on those sums and then counted exactly, shrinking only when the
    /// exact count is over budget.
    pub fn split(&self, text: &str) -> Vec<DocumentChunk> {
        let units = self.units(text);
        let costs = SpanCosts::new(self.counter.as_ref(), text, &units);
        let mut chunks: Vec<DocumentChunk> = Vec::new();

        let mut start = 0usize;
        // First unit no earlier chunk covers; every chunk must reach past it.
        let mut floor = 0usize;
        let mut prev_end_byte: Option<usize> = None;

        while start < units.len() {
            let mut end = (floor + 1).max(start + 1);
            while end < units.len() && costs.estimate(start, end + 1) <= self.chunk_size {
                end += 1;
            }
            let (first, end, _) = self.settle(text, &units, start, end, floor);

            let (a, b) = (units[first].start, units[end - 1].end);
            let overlap = prev_end_byte.map(|p| p.saturating_sub(a)).unwrap_or(0);
            chunks.push(DocumentChunk {
                index: chunks.len(),
                text: text[a..b].to_string(),
                start: a,
                end: b,
                overlap,
            });

            if end == units.len() {
                break;
            }
            prev_end_byte = Some(b);

            // Walk back from the first unit that did not fit, carrying as many
            // trailing units as the overlap budget allows.
            let mut next = end;
            while next > first + 1
                && costs.estimate(next - 1, end) <= self.chunk_overlap
                && costs.estimate(next - 1, end + 1) <= self.chunk_size
            {
                next -= 1;
            }
            start = next;
            floor = end;
        }

        chunks
    }

    /// Count `units[start..end]` exactly and shrink it until it fits, returning
    /// the kept range and its token count. Leading overlap units (below `floor`)
    /// go first so the chunk still covers new text.
    fn settle(
        &self,
        text: &str,
        units: &[Unit],
        mut start: usize,
        mut end: usize,
        floor: usize,
    ) -> (usize, usize, usize) {
        loop {
            if end - start == 1 {
                return (start, end, units[start].tokens);
            }
            let tokens = self
                .counter
                .count(&text[units[start].start..units[end - 1].end]);
            if tokens <= self.chunk_size {
                return (start, end, tokens);
            }
            if start < floor {
                start += 1;
            } else {
                end -= 1;
            }
        }
    }

    /// Trimmed segment spans, with oversized segments broken into pieces that fit.
    fn units(&self, text: &str) -> Vec<Unit> {
        let mut bounds = Vec::new();
        let mut cursor = 0usize;
        for (m_start, m_end) in self.separator.matches(text) {
            bounds.push((cursor, m_start));
            cursor = m_end;
        }
        bounds.push((cursor, text.len()));

        let mut units = Vec::new();
        for (a, b) in bounds {
            let Some((a, b)) = trim_span(text, a, b) else {
                continue;
            };
            let tokens = self.counter.count(&text[a..b]);
            if tokens <= self.chunk_size {
                units.push(Unit { start: a, end: b, tokens });
            } else {
                self.split_oversized(text, a, b, &mut units);
            }
        }
        units
    }

    /// Break a segment at whitespace; words still over budget break at
    /// characters. A single character larger than the budget stays whole.
    fn split_oversized(&self, text: &str, start: usize, end: usize, out: &mut Vec<Unit>) {
        let mut atoms = Vec::new();
        for (a, b) in word_spans(text, start, end) {
            let tokens = self.counter.count(&text[a..b]);
            if tokens <= self.chunk_size {
                atoms.push(Unit { start: a, end: b, tokens });
                continue;
            }
            for (offset, ch) in text[a..b].char_indices() {
                let c_start = a + offset;
                let c_end = c_start + ch.len_utf8();
                atoms.push(Unit {
                    start: c_start,
                    end: c_end,
                    tokens: self.counter.count(&text[c_start..c_end]),
                });
            }
        }

        let costs = SpanCosts::new(self.counter.as_ref(), text, &atoms);
        let mut i = 0;
        while i < atoms.len() {
            let mut j = i + 1;
            while j < atoms.len() && costs.estimate(i, j + 1) <= self.chunk_size {
                j += 1;
            }
            let (_, j, tokens) = self.settle(text, &atoms, i, j, i);
            out.push(Unit {
                start: atoms[i].start,
                end: atoms[j - 1].end,
                tokens,
            });
            i = j;
        }
    }
}

/// A trimmed span of the source and its token count.
#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    tokens: usize,
}

/// Prefix sums over unit and gap token counts, for span estimates without
/// re-tokenizing.
struct SpanCosts {
    units: Vec<usize>,
    gaps: Vec<usize>,
}

impl SpanCosts {
    fn new(counter: &dyn TokenCounter, text: &str, units: &[Unit]) -> Self {
        let mut unit_sums = Vec::with_capacity(units.len() + 1);
        let mut gap_sums = Vec::with_capacity(units.len());
        unit_sums.push(0);
        gap_sums.push(0);
        for (i, unit) in units.iter().enumerate() {
            unit_sums.push(unit_sums[i] + unit.tokens);
            if let Some(next) = units.get(i + 1) {
                let gap = &text[unit.end..next.start];
                let tokens = if gap.is_empty() { 0 } else { counter.count(gap) };
                gap_sums.push(gap_sums[i] + tokens);
            }
        }
        Self {
            units: unit_sums,
            gaps: gap_sums,
        }
    }

    /// Estimated tokens of units `from..to` with the gaps between them.
    fn estimate(&self, from: usize, to: usize) -> usize {
        (self.units[to] - self.units[from]) + (self.gaps[to - 1] - self.gaps[from])
    }
}

fn trim_span(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let s = &text[start..end];
    let lead = s.len() - s.trim_start().len();
    let trail = s.len() - s.trim_end().len();
    if lead + trail >= s.len() {
        return None;
    }
    Some((start + lead, end - trail))
}

fn word_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut word_start: Option<usize> = None;
    for (offset, ch) in text[start..end].char_indices() {
        let pos = start + offset;
        match (ch.is_whitespace(), word_start) {
            (true, Some(ws)) => {
                spans.push((ws, pos));
                word_start = None;
            }
            (false, None) => word_start = Some(pos),
            _ => {}
        }
    }
    if let Some(ws) = word_start {
        spans.push((ws, end));
    }
    spans
}

/// Concatenate chunks, dropping each chunk's overlapping prefix.
pub fn reconstruct(chunks: &[DocumentChunk]) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 && chunk.overlap == 0 {
            out.push('\n');
        }
        out.push_str(&chunk.text[chunk.overlap..]);
    }
    out
}
