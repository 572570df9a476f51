//! Text analysis ahead of segmentation
//!
//! Estimates speaking time from character count plus weighted pauses,
//! scores complexity, and derives the target chunk size the segmenter
//! should aim for. Complex text gets smaller chunks.

use serde::Serialize;

use crate::core::config::SegmenterConfig;

/// Sentence-ending punctuation, Latin and CJK
pub const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Clause-separating punctuation, Latin and CJK
pub const CLAUSE_SEPARATORS: &[char] = &[',', ';', ':', '，', '；', '：'];

/// Words that open a spoken transition
pub const TRANSITION_WORDS: &[&str] = &[
    "however", "meanwhile", "therefore", "furthermore", "moreover", "finally", "afterwards",
    "nevertheless", "consequently", "then", "next", "instead", "besides",
];

/// Result of analyzing one input text
#[derive(Debug, Clone, Serialize)]
pub struct TextAnalysis {
    /// Cleaned length in characters
    pub length: usize,
    /// Estimated speaking time in seconds
    pub estimated_speaking_secs: f32,
    /// Complexity score in [0, 1]
    pub complexity_score: f32,
    /// Whether the text exceeds the single-chunk threshold
    pub requires_chunking: bool,
    /// Target chunk size in characters after complexity scaling
    pub optimal_chunk_size: usize,
}

/// Analyzer over a segmenter configuration
#[derive(Debug, Clone)]
pub struct TextAnalyzer {
    config: SegmenterConfig,
}

impl TextAnalyzer {
    /// Create an analyzer
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Analyze cleaned or raw text
    pub fn analyze(&self, text: &str) -> TextAnalysis {
        let cleaned = clean_text(text);
        let length = cleaned.chars().count();

        let estimated_speaking_secs = self.estimate_speaking_secs(&cleaned);
        let complexity_score = self.complexity(&cleaned);

        // Shrink the target as complexity rises: full size at 0,
        // half size at 0.7 and above.
        let scale = 1.0 - 0.5 * (complexity_score / 0.7).min(1.0);
        let optimal_chunk_size =
            ((self.config.max_chunk_chars as f32 * scale).round() as usize).max(1);

        TextAnalysis {
            length,
            estimated_speaking_secs,
            complexity_score,
            requires_chunking: length > self.config.chunking_threshold_chars,
            optimal_chunk_size,
        }
    }

    /// Estimate speaking time for a text span in seconds
    pub fn estimate_speaking_secs(&self, text: &str) -> f32 {
        let chars = text.chars().filter(|c| !c.is_whitespace()).count();
        let sentence_pauses = text
            .chars()
            .filter(|c| SENTENCE_ENDINGS.contains(c))
            .count();
        let clause_pauses = text
            .chars()
            .filter(|c| CLAUSE_SEPARATORS.contains(c))
            .count();

        chars as f32 / self.config.chars_per_second
            + sentence_pauses as f32 * self.config.sentence_pause_secs
            + clause_pauses as f32 * self.config.clause_pause_secs
    }

    /// Score text complexity in [0, 1] from sentence-length variance,
    /// special-character density and numeric-token density
    fn complexity(&self, cleaned: &str) -> f32 {
        if cleaned.is_empty() {
            return 0.0;
        }

        let sentences = split_sentences(cleaned);
        let variance_term = if sentences.len() > 1 {
            let lengths: Vec<f32> = sentences
                .iter()
                .map(|s| s.chars().count() as f32)
                .collect();
            let mean = lengths.iter().sum::<f32>() / lengths.len() as f32;
            let variance =
                lengths.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / lengths.len() as f32;
            // Coefficient of variation, capped at 1.
            if mean > 0.0 {
                (variance.sqrt() / mean).min(1.0)
            } else {
                0.0
            }
        } else {
            0.0
        };

        let total_chars = cleaned.chars().count() as f32;
        let special_chars = cleaned
            .chars()
            .filter(|c| {
                !c.is_ascii_alphanumeric()
                    && !c.is_whitespace()
                    && !SENTENCE_ENDINGS.contains(c)
                    && !CLAUSE_SEPARATORS.contains(c)
            })
            .count() as f32;
        // Saturates at 20% density.
        let special_term = (special_chars / total_chars / 0.2).min(1.0);

        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        let numeric_term = if tokens.is_empty() {
            0.0
        } else {
            let numeric = tokens
                .iter()
                .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
                .count() as f32;
            (numeric / tokens.len() as f32 / 0.3).min(1.0)
        };

        (0.4 * variance_term + 0.3 * special_term + 0.3 * numeric_term).clamp(0.0, 1.0)
    }
}

/// Normalize whitespace: trim and collapse runs to single spaces
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split text into sentences, punctuation kept attached.
///
/// A sentence ends at sentence-ending punctuation followed by
/// whitespace or end of input; trailing quote characters stay with
/// their sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if SENTENCE_ENDINGS.contains(&c) {
            // Keep closing quotes with the sentence they end.
            while let Some(&next) = chars.peek() {
                if next == '"' || next == '\u{201d}' || next == '\'' || next == ')' {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if at_boundary {
                // Consume the separating space.
                if chars.peek().is_some() {
                    chars.next();
                }
                let sentence = current.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current.clear();
            }
        }
    }

    let tail = current.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Whether a word ends with sentence punctuation
pub fn ends_sentence(word: &str) -> bool {
    word.trim_end_matches(['"', '\u{201d}', '\'', ')'])
        .chars()
        .last()
        .is_some_and(|c| SENTENCE_ENDINGS.contains(&c))
}

/// Whether a word ends with clause punctuation
pub fn ends_clause(word: &str) -> bool {
    word.chars().last().is_some_and(|c| CLAUSE_SEPARATORS.contains(&c))
}

/// Whether a word opens a transition
pub fn is_transition_word(word: &str) -> bool {
    let lowered = word
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    TRANSITION_WORDS.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  hello\n\t world  "), "hello world");
    }

    #[test]
    fn test_split_sentences_rejoins() {
        let text = "First sentence. Second one! Is this third? Yes.";
        let sentences = split_sentences(text);
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences.join(" "), text);
    }

    #[test]
    fn test_split_keeps_closing_quote() {
        let text = "She said \"go now!\" Then she left.";
        let sentences = split_sentences(text);
        assert_eq!(sentences[0], "She said \"go now!\"");
    }

    #[test]
    fn test_short_text_skips_chunking() {
        let analyzer = TextAnalyzer::new(SegmenterConfig::default());
        let analysis = analyzer.analyze("A quick note to say hello.");
        assert!(!analysis.requires_chunking);
        assert!(analysis.estimated_speaking_secs > 0.0);
    }

    #[test]
    fn test_long_text_requires_chunking() {
        let analyzer = TextAnalyzer::new(SegmenterConfig::default());
        let text = "A sentence that keeps going. ".repeat(30);
        assert!(analyzer.analyze(&text).requires_chunking);
    }

    #[test]
    fn test_complexity_shrinks_chunk_size() {
        let config = SegmenterConfig::default();
        let analyzer = TextAnalyzer::new(config.clone());

        let plain = "The sky was clear and the road was long. ".repeat(10);
        let noisy =
            "Call +1 (555) 201-3344 re: invoice #8841; ref §4.2, then €99.50 due 2024-06-01! Ok. "
                .repeat(10);

        let plain_size = analyzer.analyze(&plain).optimal_chunk_size;
        let noisy_size = analyzer.analyze(&noisy).optimal_chunk_size;

        assert!(noisy_size < plain_size);
        assert!(noisy_size >= config.max_chunk_chars / 2);
    }

    #[test]
    fn test_pauses_extend_speaking_time() {
        let analyzer = TextAnalyzer::new(SegmenterConfig::default());
        let flat = analyzer.estimate_speaking_secs("aaaa bbbb cccc dddd");
        let punctuated = analyzer.estimate_speaking_secs("aaaa, bbbb. cccc, dddd.");
        assert!(punctuated > flat);
    }

    #[test]
    fn test_transition_word_detection() {
        assert!(is_transition_word("However,"));
        assert!(is_transition_word("meanwhile"));
        assert!(!is_transition_word("house"));
    }
}
