//! Text analysis and semantic chunking

pub mod analyzer;
pub mod segmenter;

pub use analyzer::{
    clean_text, ends_clause, ends_sentence, is_transition_word, split_sentences, TextAnalysis,
    TextAnalyzer, CLAUSE_SEPARATORS, SENTENCE_ENDINGS, TRANSITION_WORDS,
};
pub use segmenter::{Chunk, ChunkType, ProsodyType, Segmentation, TextSegmenter};
