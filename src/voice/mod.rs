//! Voice context derivation and chunk-to-chunk continuity

pub mod continuity;

pub use continuity::{
    ChunkVoiceState, ContinuityParams, ContinuitySession, CrossfadeSpec, EnergyLevel,
    PitchRegister, ProsodyBaseline, TransitionParams, VoiceContext, VoiceContinuityManager,
    VoiceParams, VoiceTraits,
};
