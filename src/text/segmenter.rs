//! Semantic-boundary-aware text chunking
//!
//! Splits long input into chunks that fit the model's context budget:
//! sentence boundaries first, clause punctuation as fallback,
//! whitespace as a last resort, with a short-chunk merge pass and a
//! hard character cap no chunk may ever exceed.
//!
//! A secondary mode sizes chunks to match a voice-cloning reference
//! utterance's word count, preferring prosodic break points, so each
//! chunk's duration stays close to what the model was conditioned on.

use serde::Serialize;

use crate::core::config::SegmenterConfig;

use super::analyzer::{
    clean_text, ends_clause, ends_sentence, is_transition_word, split_sentences, TextAnalyzer,
};

/// Crossfade hint for a chunk ending mid-sentence, seconds
const CROSSFADE_MID_SENTENCE: f32 = 0.12;
/// Crossfade hint for a chunk ending at a sentence boundary, seconds
const CROSSFADE_SENTENCE_BOUNDARY: f32 = 0.04;

/// Chunk classification used to tune continuity damping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkType {
    /// Plain narration
    Narrative,
    /// Quoted speech
    Dialogue,
    /// Lists and itemized text
    Enumeration,
    /// Opens with a discourse transition
    Transition,
}

/// Prosodic coloring of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProsodyType {
    Neutral,
    Interrogative,
    Exclamatory,
}

/// A contiguous span of the cleaned input scheduled for one synthesis
/// call
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    /// Position in the original text
    pub index: usize,
    /// Chunk text
    pub text: String,
    /// Chunk classification
    pub chunk_type: ChunkType,
    /// Prosodic coloring
    pub prosody: ProsodyType,
    /// Estimated speaking duration in seconds
    pub estimated_secs: f32,
    /// Suggested crossfade overlap with the next chunk, seconds;
    /// zero for the final chunk
    pub crossfade_secs: f32,
}

impl Chunk {
    /// Number of words in the chunk
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// Whether the chunk ends at a sentence boundary
    pub fn ends_at_sentence(&self) -> bool {
        self.text
            .split_whitespace()
            .last()
            .is_some_and(ends_sentence)
    }
}

/// Result of segmenting one text
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Chunks in original order
    pub chunks: Vec<Chunk>,
    /// Whether reference-length matching produced the chunks
    pub reference_matched: bool,
}

impl Segmentation {
    /// Rebuild the cleaned input from chunk texts
    pub fn reassemble(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Splits text into bounded, semantically coherent chunks
#[derive(Debug, Clone)]
pub struct TextSegmenter {
    config: SegmenterConfig,
    analyzer: TextAnalyzer,
}

impl TextSegmenter {
    /// Create a segmenter
    pub fn new(config: SegmenterConfig) -> Self {
        let analyzer = TextAnalyzer::new(config.clone());
        Self { config, analyzer }
    }

    /// Analyzer sharing this segmenter's configuration
    pub fn analyzer(&self) -> &TextAnalyzer {
        &self.analyzer
    }

    /// Segment text on semantic boundaries
    pub fn segment(&self, text: &str) -> Segmentation {
        let cleaned = clean_text(text);
        if cleaned.is_empty() {
            return Segmentation {
                chunks: vec![],
                reference_matched: false,
            };
        }

        let analysis = self.analyzer.analyze(&cleaned);
        if !analysis.requires_chunking {
            return Segmentation {
                chunks: self.build_chunks(vec![cleaned]),
                reference_matched: false,
            };
        }

        let target = analysis.optimal_chunk_size;
        let mut pieces = self.group_sentences(&cleaned, target);
        self.merge_short(&mut pieces);
        let pieces = self.enforce_cap(pieces);

        Segmentation {
            chunks: self.build_chunks(pieces),
            reference_matched: false,
        }
    }

    /// Segment with reference-length matching when the target text is
    /// long enough relative to the reference utterance; otherwise
    /// falls back to [`segment`](Self::segment).
    pub fn segment_with_reference(&self, text: &str, reference_text: &str) -> Segmentation {
        let cleaned = clean_text(text);
        let reference_words = clean_text(reference_text).split_whitespace().count();
        let target_words = cleaned.split_whitespace().count();

        let threshold = (reference_words as f32 * self.config.reference_ratio_threshold) as usize;
        if reference_words == 0 || target_words < threshold.max(1) {
            return self.segment(text);
        }

        let pieces = self.match_reference_length(&cleaned, reference_words);
        let pieces = self.enforce_cap(pieces);

        Segmentation {
            chunks: self.build_chunks(pieces),
            reference_matched: true,
        }
    }

    /// Group sentences into pieces no larger than `target` characters
    fn group_sentences(&self, cleaned: &str, target: usize) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut current = String::new();

        for sentence in split_sentences(cleaned) {
            if sentence.chars().count() > target {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                pieces.extend(self.split_long_sentence(&sentence, target));
                continue;
            }

            if current.is_empty() {
                current = sentence;
            } else if current.chars().count() + 1 + sentence.chars().count() <= target {
                current.push(' ');
                current.push_str(&sentence);
            } else {
                pieces.push(std::mem::take(&mut current));
                current = sentence;
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    /// Split one oversized sentence: clause punctuation first, then
    /// whitespace, then a raw character cut as the last resort
    fn split_long_sentence(&self, sentence: &str, target: usize) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut current = String::new();

        for word in sentence.split_whitespace() {
            let word_len = word.chars().count();
            if word_len > self.config.max_chunk_chars {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                pieces.extend(hard_split(word, self.config.max_chunk_chars));
                continue;
            }

            let fits = current.is_empty()
                || current.chars().count() + 1 + word_len <= target;
            if fits {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
                // Prefer closing a piece right after clause punctuation
                // once it is reasonably full.
                if ends_clause(word) && current.chars().count() >= target / 2 {
                    pieces.push(std::mem::take(&mut current));
                }
            } else {
                pieces.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    /// Merge pieces below the minimum word count into a neighbor when
    /// the merge stays within the hard bound
    fn merge_short(&self, pieces: &mut Vec<String>) {
        let mut i = 0;
        while i < pieces.len() {
            let words = pieces[i].split_whitespace().count();
            if words >= self.config.min_chunk_words || pieces.len() == 1 {
                i += 1;
                continue;
            }

            let merged_with_prev = i > 0
                && pieces[i - 1].chars().count() + 1 + pieces[i].chars().count()
                    <= self.config.max_chunk_chars;
            if merged_with_prev {
                let short = pieces.remove(i);
                let prev = &mut pieces[i - 1];
                prev.push(' ');
                prev.push_str(&short);
                continue;
            }

            let merged_with_next = i + 1 < pieces.len()
                && pieces[i].chars().count() + 1 + pieces[i + 1].chars().count()
                    <= self.config.max_chunk_chars;
            if merged_with_next {
                let next = pieces.remove(i + 1);
                let cur = &mut pieces[i];
                cur.push(' ');
                cur.push_str(&next);
                continue;
            }

            i += 1;
        }
    }

    /// Safety net: no piece may exceed the configured maximum,
    /// whatever the earlier steps produced
    fn enforce_cap(&self, pieces: Vec<String>) -> Vec<String> {
        let max = self.config.max_chunk_chars;
        let mut capped = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if piece.chars().count() <= max {
                capped.push(piece);
            } else {
                capped.extend(self.split_long_sentence(&piece, max));
            }
        }
        capped
    }

    /// Build word groups close to the reference word count, breaking
    /// at the strongest prosodic boundary inside the tolerance band
    fn match_reference_length(&self, cleaned: &str, reference_words: usize) -> Vec<String> {
        let tolerance = self.config.reference_tolerance;
        let lower = ((reference_words as f32 * (1.0 - tolerance)).ceil() as usize).max(1);
        let upper = ((reference_words as f32 * (1.0 + tolerance)).floor() as usize).max(lower);

        let words: Vec<&str> = cleaned.split_whitespace().collect();
        let mut pieces: Vec<String> = Vec::new();
        let mut start = 0;
        let mut best_break: Option<(usize, u8)> = None;

        for i in start..words.len() {
            let count = i - start + 1;
            let strength = if ends_sentence(words[i]) {
                3
            } else if ends_clause(words[i]) {
                2
            } else if words.get(i + 1).is_some_and(|w| is_transition_word(w)) {
                1
            } else {
                0
            };

            if count >= lower && strength > 0 {
                let better = best_break.map_or(true, |(_, s)| strength >= s);
                if better {
                    best_break = Some((i, strength));
                }
                // A sentence end inside the band is as good as it gets.
                if strength == 3 {
                    pieces.push(words[start..=i].join(" "));
                    start = i + 1;
                    best_break = None;
                    continue;
                }
            }

            if count >= upper {
                let cut = best_break.map(|(at, _)| at).unwrap_or(i);
                pieces.push(words[start..=cut].join(" "));
                start = cut + 1;
                best_break = None;
            }
        }

        if start < words.len() {
            let remainder = words[start..].join(" ");
            let remainder_words = words.len() - start;
            // Fold a trailing fragment into the last piece when the
            // merge stays inside the band.
            let fold = remainder_words < lower
                && pieces.last().is_some_and(|last| {
                    last.split_whitespace().count() + remainder_words <= upper
                });
            match pieces.last_mut() {
                Some(last) if fold => {
                    last.push(' ');
                    last.push_str(&remainder);
                }
                _ => pieces.push(remainder),
            }
        }

        pieces
    }

    /// Attach classification, duration and crossfade hints
    fn build_chunks(&self, pieces: Vec<String>) -> Vec<Chunk> {
        let count = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let chunk_type = classify_chunk(&text);
                let prosody = classify_prosody(&text);
                let estimated_secs = self.analyzer.estimate_speaking_secs(&text);
                let is_last = index + 1 == count;
                let crossfade_secs = if is_last {
                    0.0
                } else if text.split_whitespace().last().is_some_and(ends_sentence) {
                    CROSSFADE_SENTENCE_BOUNDARY
                } else {
                    CROSSFADE_MID_SENTENCE
                };
                Chunk {
                    index,
                    text,
                    chunk_type,
                    prosody,
                    estimated_secs,
                    crossfade_secs,
                }
            })
            .collect()
    }
}

/// Raw character cut for tokens with no usable boundary
fn hard_split(word: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars
        .chunks(max.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Classify chunk content
fn classify_chunk(text: &str) -> ChunkType {
    let has_quotes = text.contains('"') || text.contains('\u{201c}') || text.contains('\u{201d}');
    if has_quotes {
        return ChunkType::Dialogue;
    }

    let list_markers = text
        .split_whitespace()
        .filter(|w| {
            let mut chars = w.chars();
            matches!(
                (chars.next(), chars.next()),
                (Some(d), Some('.' | ')')) if d.is_ascii_digit()
            )
        })
        .count();
    let semicolons = text.chars().filter(|&c| c == ';').count();
    if list_markers >= 2 || semicolons >= 2 {
        return ChunkType::Enumeration;
    }

    if text
        .split_whitespace()
        .next()
        .is_some_and(is_transition_word)
    {
        return ChunkType::Transition;
    }

    ChunkType::Narrative
}

/// Classify prosodic coloring
fn classify_prosody(text: &str) -> ProsodyType {
    let questions = text.chars().filter(|&c| c == '?' || c == '？').count();
    let exclamations = text.chars().filter(|&c| c == '!' || c == '！').count();
    if questions == 0 && exclamations == 0 {
        ProsodyType::Neutral
    } else if exclamations > questions {
        ProsodyType::Exclamatory
    } else {
        ProsodyType::Interrogative
    }
}
