//! Chunked synthesis pipeline

pub mod pipeline;

pub use pipeline::{
    ProgressFn, ReferenceMaterial, SynthesisOutcome, SynthesisPipeline, SynthesisRequest,
    SynthesisStats,
};
