//! Voice continuity across independently synthesized chunks
//!
//! Derives a per-job voice context from the reference material, then
//! hands each chunk a small transition state that pulls adjacent
//! pitch/energy/tempo toward each other and sizes the crossfade with
//! the next chunk. Pure derivation: this module owns no synthesis.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::audio::FadeCurve;
use crate::core::error::{Result, TtsError};
use crate::engine::AudioBuffer;
use crate::text::{ends_sentence, ChunkType, ProsodyType};

/// Shortest usable reference clip, seconds
const MIN_REFERENCE_SECS: f32 = 3.0;
/// Longest usable reference clip, seconds
const MAX_REFERENCE_SECS: f32 = 30.0;

/// Transition factors stay inside this band around 1.0
const DAMPING_FLOOR: f32 = 0.95;
const DAMPING_CEIL: f32 = 1.05;

/// Crossfade when a boundary falls mid-sentence, seconds
const FADE_MID_SENTENCE: f32 = 0.12;
/// Crossfade at a clean sentence boundary, seconds
const FADE_SENTENCE_BOUNDARY: f32 = 0.04;

/// Requested voice adjustments for a job
#[derive(Debug, Clone)]
pub struct VoiceParams {
    /// Speed multiplier
    pub speed: f32,
    /// Pitch shift in semitones
    pub pitch_shift: f32,
    /// Energy multiplier
    pub energy: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch_shift: 0.0,
            energy: 1.0,
        }
    }
}

/// Coarse pitch register of a speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PitchRegister {
    Low,
    Mid,
    High,
}

/// Coarse energy level of a speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnergyLevel {
    Soft,
    Moderate,
    Strong,
}

/// Categorical voice traits derived from the reference clip
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VoiceTraits {
    pub register: PitchRegister,
    pub energy: EnergyLevel,
}

/// Baseline prosody statistics of the reference speaker
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProsodyBaseline {
    /// Rough fundamental estimate in Hz
    pub pitch_hz: f32,
    /// RMS energy of the reference clip
    pub energy_rms: f32,
    /// Speaking rate in words per second
    pub rate_wps: f32,
}

/// Per-job voice identity, read-only after creation
#[derive(Debug, Clone)]
pub struct VoiceContext {
    /// Hash of (reference audio, reference text)
    pub speaker_key: u64,
    /// Baseline prosody statistics
    pub baseline: ProsodyBaseline,
    /// Categorical traits
    pub traits: VoiceTraits,
    /// Reference clip conditioning every chunk
    pub reference_audio: Arc<AudioBuffer>,
    /// Transcription of the reference clip
    pub reference_text: String,
    /// Requested adjustments
    pub params: VoiceParams,
}

/// Transition factors for one chunk
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransitionParams {
    pub pitch_factor: f32,
    pub energy_factor: f32,
    pub tempo_factor: f32,
    /// Weight of the previous chunk's timbre in the blend
    pub timbre_weight: f32,
}

impl Default for TransitionParams {
    fn default() -> Self {
        Self {
            pitch_factor: 1.0,
            energy_factor: 1.0,
            tempo_factor: 1.0,
            timbre_weight: 0.5,
        }
    }
}

/// Crossfade configuration toward the next chunk
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CrossfadeSpec {
    /// Overlap duration in seconds
    pub fade_secs: f32,
    /// Fade curve shape
    pub curve: FadeCurve,
}

/// Per-chunk voice state, discarded once the chunk's audio exists
#[derive(Debug, Clone)]
pub struct ChunkVoiceState {
    /// Chunk index
    pub index: usize,
    /// Transition factors applied to the synthesis call
    pub transition: TransitionParams,
    /// Crossfade into the next chunk
    pub crossfade: CrossfadeSpec,
    /// Whether the chunk ends at a sentence boundary
    pub ends_at_sentence: bool,
}

impl ChunkVoiceState {
    /// Neutral state for jobs without reference material: default
    /// transition factors and a cosine crossfade of the given length.
    pub fn neutral(index: usize, fade_secs: f32, ends_at_sentence: bool) -> Self {
        Self {
            index,
            transition: TransitionParams::default(),
            crossfade: CrossfadeSpec {
                fade_secs,
                curve: FadeCurve::Cosine,
            },
            ends_at_sentence,
        }
    }
}

/// Where the audio "conversation" left off before a chunk
#[derive(Debug, Clone, Copy)]
pub struct ContinuityParams {
    /// Job-wide baseline
    pub baseline: ProsodyBaseline,
    /// The previous chunk's applied transition, if any
    pub previous: Option<TransitionParams>,
}

/// Derives and caches voice contexts
pub struct VoiceContinuityManager {
    contexts: DashMap<u64, Arc<VoiceContext>>,
}

impl VoiceContinuityManager {
    /// Create a manager
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
        }
    }

    /// Derive a voice context from reference material, reusing the
    /// cached derivation when the same (audio, text) pair reappears.
    pub fn create_context(
        &self,
        reference_audio: Arc<AudioBuffer>,
        reference_text: &str,
        params: VoiceParams,
    ) -> Result<Arc<VoiceContext>> {
        let duration = reference_audio.duration_secs();
        if duration < MIN_REFERENCE_SECS {
            return Err(TtsError::Validation {
                message: format!(
                    "Reference audio too short ({:.1}s). Minimum {:.0} seconds required.",
                    duration, MIN_REFERENCE_SECS
                ),
                field: Some("reference_audio".to_string()),
            });
        }
        if duration > MAX_REFERENCE_SECS {
            return Err(TtsError::Validation {
                message: format!(
                    "Reference audio too long ({:.1}s). Maximum {:.0} seconds supported.",
                    duration, MAX_REFERENCE_SECS
                ),
                field: Some("reference_audio".to_string()),
            });
        }

        let speaker_key = content_key(&reference_audio, reference_text);
        if let Some(existing) = self.contexts.get(&speaker_key) {
            debug!(speaker_key, "reusing cached voice context");
            return Ok(Arc::clone(existing.value()));
        }

        let baseline = derive_baseline(&reference_audio, reference_text);
        let traits = derive_traits(&baseline);
        let context = Arc::new(VoiceContext {
            speaker_key,
            baseline,
            traits,
            reference_audio,
            reference_text: reference_text.to_string(),
            params,
        });
        self.contexts.insert(speaker_key, Arc::clone(&context));
        Ok(context)
    }

    /// Number of cached contexts
    pub fn cached_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Open a per-job continuity session over a context
    pub fn session(&self, context: Arc<VoiceContext>) -> ContinuitySession {
        ContinuitySession {
            context,
            last: Mutex::new(None),
        }
    }
}

impl Default for VoiceContinuityManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks transition outcomes across one job's chunks
pub struct ContinuitySession {
    context: Arc<VoiceContext>,
    last: Mutex<Option<TransitionParams>>,
}

impl ContinuitySession {
    /// The job's voice context
    pub fn context(&self) -> &Arc<VoiceContext> {
        &self.context
    }

    /// Derive the transition state for one chunk and record it as the
    /// new "where we left off" point.
    pub fn prepare_chunk_state(
        &self,
        index: usize,
        chunk_text: &str,
        chunk_type: ChunkType,
        prosody: ProsodyType,
    ) -> ChunkVoiceState {
        let previous = *self.last.lock().unwrap();

        // Prosody nudges the raw target away from neutral.
        let (pitch_target, energy_target) = match prosody {
            ProsodyType::Neutral => (1.0, 1.0),
            ProsodyType::Interrogative => (1.03, 1.01),
            ProsodyType::Exclamatory => (1.02, 1.04),
        };
        let tempo_target = match chunk_type {
            ChunkType::Enumeration => 0.97,
            ChunkType::Dialogue => 1.02,
            _ => 1.0,
        };

        // Dialogue and transition chunks damp harder so the voice
        // does not lurch at the seam.
        let damping = match chunk_type {
            ChunkType::Dialogue | ChunkType::Transition => 0.4,
            _ => 0.7,
        };

        let prev = previous.unwrap_or_default();
        let transition = TransitionParams {
            pitch_factor: damp(prev.pitch_factor, pitch_target, damping),
            energy_factor: damp(prev.energy_factor, energy_target, damping),
            tempo_factor: damp(prev.tempo_factor, tempo_target, damping),
            timbre_weight: if index == 0 { 0.0 } else { 0.5 },
        };

        let ends_at_sentence = chunk_text
            .split_whitespace()
            .last()
            .is_some_and(ends_sentence);
        let fade_secs = if ends_at_sentence {
            FADE_SENTENCE_BOUNDARY
        } else {
            FADE_MID_SENTENCE
        };
        let curve = match prosody {
            ProsodyType::Exclamatory => FadeCurve::SmoothStep,
            _ => FadeCurve::Cosine,
        };

        let state = ChunkVoiceState {
            index,
            transition,
            crossfade: CrossfadeSpec { fade_secs, curve },
            ends_at_sentence,
        };

        *self.last.lock().unwrap() = Some(transition);
        state
    }

    /// View of the baseline merged with the previous chunk's outcome
    pub fn continuity(&self, _chunk_index: usize) -> ContinuityParams {
        ContinuityParams {
            baseline: self.context.baseline,
            previous: *self.last.lock().unwrap(),
        }
    }
}

/// Move from the previous factor toward the target, clamped to the
/// damping band
fn damp(previous: f32, target: f32, alpha: f32) -> f32 {
    (previous + (target - previous) * alpha).clamp(DAMPING_FLOOR, DAMPING_CEIL)
}

/// Content hash over reference audio samples and transcription
fn content_key(audio: &AudioBuffer, text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    audio.sample_rate.hash(&mut hasher);
    audio.samples.len().hash(&mut hasher);
    for sample in &audio.samples {
        sample.to_bits().hash(&mut hasher);
    }
    text.hash(&mut hasher);
    hasher.finish()
}

/// Estimate baseline prosody from the reference clip
fn derive_baseline(audio: &AudioBuffer, text: &str) -> ProsodyBaseline {
    let duration = audio.duration_secs().max(f32::EPSILON);

    // Zero-crossing rate as a crude fundamental estimate.
    let crossings = audio
        .samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    let pitch_hz = crossings as f32 / (2.0 * duration);

    let words = text.split_whitespace().count();
    ProsodyBaseline {
        pitch_hz,
        energy_rms: audio.rms(),
        rate_wps: words as f32 / duration,
    }
}

/// Bucket the baseline into categorical traits
fn derive_traits(baseline: &ProsodyBaseline) -> VoiceTraits {
    let register = if baseline.pitch_hz < 140.0 {
        PitchRegister::Low
    } else if baseline.pitch_hz < 220.0 {
        PitchRegister::Mid
    } else {
        PitchRegister::High
    };
    let energy = if baseline.energy_rms < 0.05 {
        EnergyLevel::Soft
    } else if baseline.energy_rms < 0.15 {
        EnergyLevel::Moderate
    } else {
        EnergyLevel::Strong
    };
    VoiceTraits { register, energy }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OUTPUT_SAMPLE_RATE;

    fn reference_clip(secs: f32) -> Arc<AudioBuffer> {
        // A 180 Hz square-ish wave with moderate energy.
        let sr = OUTPUT_SAMPLE_RATE;
        let n = (secs * sr as f32) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let phase = (i as f32 * 180.0 / sr as f32) % 1.0;
                if phase < 0.5 {
                    0.1
                } else {
                    -0.1
                }
            })
            .collect();
        Arc::new(AudioBuffer::new(samples, sr))
    }

    #[test]
    fn test_reference_duration_validated() {
        let manager = VoiceContinuityManager::new();
        let short = reference_clip(1.0);
        assert!(manager
            .create_context(short, "too short", VoiceParams::default())
            .is_err());

        let long = reference_clip(45.0);
        assert!(manager
            .create_context(long, "too long", VoiceParams::default())
            .is_err());
    }

    #[test]
    fn test_identical_reference_reuses_context() {
        let manager = VoiceContinuityManager::new();
        let clip = reference_clip(5.0);
        let a = manager
            .create_context(Arc::clone(&clip), "same words", VoiceParams::default())
            .unwrap();
        let b = manager
            .create_context(clip, "same words", VoiceParams::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.cached_contexts(), 1);
    }

    #[test]
    fn test_different_text_is_new_context() {
        let manager = VoiceContinuityManager::new();
        let clip = reference_clip(5.0);
        manager
            .create_context(Arc::clone(&clip), "first", VoiceParams::default())
            .unwrap();
        manager
            .create_context(clip, "second", VoiceParams::default())
            .unwrap();
        assert_eq!(manager.cached_contexts(), 2);
    }

    #[test]
    fn test_transition_factors_stay_in_band() {
        let manager = VoiceContinuityManager::new();
        let context = manager
            .create_context(reference_clip(5.0), "hello there", VoiceParams::default())
            .unwrap();
        let session = manager.session(context);

        for (i, (chunk_type, prosody)) in [
            (ChunkType::Narrative, ProsodyType::Neutral),
            (ChunkType::Dialogue, ProsodyType::Exclamatory),
            (ChunkType::Transition, ProsodyType::Interrogative),
            (ChunkType::Enumeration, ProsodyType::Neutral),
        ]
        .iter()
        .enumerate()
        {
            let state = session.prepare_chunk_state(i, "some words here", *chunk_type, *prosody);
            for factor in [
                state.transition.pitch_factor,
                state.transition.energy_factor,
                state.transition.tempo_factor,
            ] {
                assert!((DAMPING_FLOOR..=DAMPING_CEIL).contains(&factor));
            }
        }
    }

    #[test]
    fn test_crossfade_shrinks_at_sentence_boundary() {
        let manager = VoiceContinuityManager::new();
        let context = manager
            .create_context(reference_clip(5.0), "hello there", VoiceParams::default())
            .unwrap();
        let session = manager.session(context);

        let clean_end = session.prepare_chunk_state(
            0,
            "This one ends cleanly.",
            ChunkType::Narrative,
            ProsodyType::Neutral,
        );
        let mid = session.prepare_chunk_state(
            1,
            "this one stops mid",
            ChunkType::Narrative,
            ProsodyType::Neutral,
        );
        assert!(clean_end.crossfade.fade_secs < mid.crossfade.fade_secs);
        assert!(clean_end.ends_at_sentence);
        assert!(!mid.ends_at_sentence);
    }

    #[test]
    fn test_continuity_sees_previous_outcome() {
        let manager = VoiceContinuityManager::new();
        let context = manager
            .create_context(reference_clip(5.0), "hello there", VoiceParams::default())
            .unwrap();
        let session = manager.session(context);

        assert!(session.continuity(0).previous.is_none());
        session.prepare_chunk_state(0, "Loud start!", ChunkType::Narrative, ProsodyType::Exclamatory);
        let merged = session.continuity(1);
        let prev = merged.previous.expect("previous outcome recorded");
        assert!(prev.energy_factor > 1.0);
    }
}
