//! Chunk synthesis and job orchestration
//!
//! Consumes chunks, a warm session and continuity state; produces one
//! stitched waveform. A chunk that keeps hitting resource exhaustion
//! is retried with progressively shortened text and finally replaced
//! by silence of its expected duration: a partial, degraded result
//! beats failing the whole job. The silence fallback is the one place
//! below the scheduler allowed to absorb an error, and it is logged.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audio::AudioStitcher;
use crate::core::config::{SegmenterConfig, StitchConfig};
use crate::core::error::{Result, TtsError};
use crate::core::metrics::{ScopedTimer, StageTimings};
use crate::engine::{AudioBuffer, InferenceSession, SynthesisInput};
use crate::text::{Chunk, TextSegmenter};
use crate::voice::{ChunkVoiceState, ContinuityParams, VoiceContinuityManager, VoiceParams};

/// Word fractions tried when a chunk keeps exhausting resources
const RETRY_FRACTIONS: &[f32] = &[1.0, 0.7, 0.5];

/// Reference material for a voice-cloning request
#[derive(Debug, Clone)]
pub struct ReferenceMaterial {
    /// Reference audio clip
    pub audio: Arc<AudioBuffer>,
    /// Transcription of the clip
    pub text: String,
}

/// Payload of one synthesis job
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    /// Target text
    pub text: String,
    /// Synthesis language
    pub language: String,
    /// Reference material when cloning a voice
    pub reference: Option<ReferenceMaterial>,
    /// Requested voice adjustments
    pub voice_params: VoiceParams,
}

impl SynthesisRequest {
    /// Create a plain request
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            reference: None,
            voice_params: VoiceParams::default(),
        }
    }

    /// Attach cloning reference material
    pub fn with_reference(mut self, audio: Arc<AudioBuffer>, text: impl Into<String>) -> Self {
        self.reference = Some(ReferenceMaterial {
            audio,
            text: text.into(),
        });
        self
    }
}

/// Chunking and timing statistics for one completed job
#[derive(Debug, Clone, Default, Serialize)]
pub struct SynthesisStats {
    /// Number of chunks synthesized
    pub chunk_count: usize,
    /// Whether the text was chunked at all
    pub chunking_used: bool,
    /// Whether reference-length matching chose the boundaries
    pub reference_matched: bool,
    /// Chunks replaced by silence after exhausted retries
    pub degraded_chunks: usize,
    /// Per-stage wall-clock timing
    pub timings: StageTimings,
    /// Output duration in seconds
    pub audio_secs: f32,
}

/// A finished synthesis: waveform plus statistics
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    /// Stitched mono waveform
    pub audio: AudioBuffer,
    /// Generation statistics
    pub stats: SynthesisStats,
}

/// Progress callback: fraction complete in [0, 1] and a stage label
pub type ProgressFn = Arc<dyn Fn(f32, &str) + Send + Sync>;

/// Orchestrates segmentation, per-chunk synthesis and stitching
pub struct SynthesisPipeline {
    segmenter: TextSegmenter,
    stitcher: AudioStitcher,
    continuity: Arc<VoiceContinuityManager>,
}

impl SynthesisPipeline {
    /// Create a pipeline
    pub fn new(
        segmenter_config: SegmenterConfig,
        stitch_config: StitchConfig,
        continuity: Arc<VoiceContinuityManager>,
    ) -> Self {
        Self {
            segmenter: TextSegmenter::new(segmenter_config),
            stitcher: AudioStitcher::new(stitch_config),
            continuity,
        }
    }

    /// Run one job end to end against a warm session.
    ///
    /// Chunks are synthesized and stitched strictly in index order.
    pub async fn run(
        &self,
        request: &SynthesisRequest,
        session: Arc<dyn InferenceSession>,
        progress: Option<ProgressFn>,
    ) -> Result<SynthesisOutcome> {
        if request.text.trim().is_empty() {
            return Err(TtsError::Validation {
                message: "empty synthesis text".to_string(),
                field: Some("text".to_string()),
            });
        }

        let mut timings = StageTimings::default();
        let report = |fraction: f32, stage: &str| {
            if let Some(cb) = &progress {
                cb(fraction, stage);
            }
        };

        report(0.0, "analysis");
        let timer = ScopedTimer::start();
        let analysis = self.segmenter.analyzer().analyze(&request.text);
        timings.analysis_ms = timer.elapsed_ms();

        let timer = ScopedTimer::start();
        let segmentation = match &request.reference {
            Some(reference) => self
                .segmenter
                .segment_with_reference(&request.text, &reference.text),
            None => self.segmenter.segment(&request.text),
        };
        timings.segmentation_ms = timer.elapsed_ms();

        let chunks = segmentation.chunks;
        if chunks.is_empty() {
            return Err(TtsError::Validation {
                message: "text produced no synthesizable chunks".to_string(),
                field: Some("text".to_string()),
            });
        }
        debug!(
            chunks = chunks.len(),
            reference_matched = segmentation.reference_matched,
            "segmented request"
        );

        // Voice context is derived once per job; chunk states come
        // from the continuity session (or stay neutral without
        // reference material).
        let continuity_session = match &request.reference {
            Some(reference) => {
                let context = self.continuity.create_context(
                    Arc::clone(&reference.audio),
                    &reference.text,
                    request.voice_params.clone(),
                )?;
                Some(self.continuity.session(context))
            }
            None => None,
        };

        report(0.1, "synthesis");
        let timer = ScopedTimer::start();
        let mut states: Vec<ChunkVoiceState> = Vec::with_capacity(chunks.len());
        let mut audios: Vec<AudioBuffer> = Vec::with_capacity(chunks.len());
        let mut degraded_chunks = 0usize;

        for chunk in &chunks {
            // Where the audio conversation left off, read before this
            // chunk's state becomes the new reference point.
            let continuity = continuity_session
                .as_ref()
                .map(|session| session.continuity(chunk.index));
            let state = match &continuity_session {
                Some(session) => session.prepare_chunk_state(
                    chunk.index,
                    &chunk.text,
                    chunk.chunk_type,
                    chunk.prosody,
                ),
                None => ChunkVoiceState::neutral(
                    chunk.index,
                    chunk.crossfade_secs,
                    chunk.ends_at_sentence(),
                ),
            };

            let (audio, degraded) = self
                .synthesize_chunk(chunk, session.as_ref(), &state, request, continuity.as_ref())
                .await?;
            if degraded {
                degraded_chunks += 1;
            }
            states.push(state);
            audios.push(audio);
            report(
                0.1 + 0.8 * (chunk.index + 1) as f32 / chunks.len() as f32,
                "synthesis",
            );
        }
        timings.synthesis_ms = timer.elapsed_ms();

        report(0.9, "stitch");
        let timer = ScopedTimer::start();
        let audio = self.stitcher.concatenate(&audios, &states)?;
        timings.stitch_ms = timer.elapsed_ms();
        report(1.0, "done");

        let stats = SynthesisStats {
            chunk_count: chunks.len(),
            chunking_used: analysis.requires_chunking,
            reference_matched: segmentation.reference_matched,
            degraded_chunks,
            audio_secs: audio.duration_secs(),
            timings,
        };
        if degraded_chunks > 0 {
            warn!(degraded_chunks, "job completed with degraded chunks");
        }
        info!(
            chunks = stats.chunk_count,
            audio_secs = stats.audio_secs,
            "synthesis complete"
        );

        Ok(SynthesisOutcome { audio, stats })
    }

    /// Synthesize one chunk with the resource-exhaustion retry ladder.
    ///
    /// Returns the audio and whether it was replaced by silence.
    /// Non-exhaustion errors propagate for the scheduler to classify.
    pub async fn synthesize_chunk(
        &self,
        chunk: &Chunk,
        session: &dyn InferenceSession,
        state: &ChunkVoiceState,
        request: &SynthesisRequest,
        continuity: Option<&ContinuityParams>,
    ) -> Result<(AudioBuffer, bool)> {
        for (attempt, &fraction) in RETRY_FRACTIONS.iter().enumerate() {
            let text = shorten_words(&chunk.text, fraction);
            let mut input = SynthesisInput::new(text);
            input.pitch_factor = state.transition.pitch_factor;
            input.energy_factor = state.transition.energy_factor * request.voice_params.energy;
            input.tempo_factor = state.transition.tempo_factor * request.voice_params.speed;
            if let Some(reference) = &request.reference {
                input = input.with_reference(Arc::clone(&reference.audio), reference.text.clone());
            }
            // Conditioning hints for runtimes that accept them.
            if let Some(params) = continuity {
                input.extra.insert(
                    "baseline_rate_wps".to_string(),
                    format!("{:.3}", params.baseline.rate_wps),
                );
                input.extra.insert(
                    "baseline_energy_rms".to_string(),
                    format!("{:.5}", params.baseline.energy_rms),
                );
                if let Some(prev) = params.previous {
                    input.extra.insert(
                        "prev_energy_factor".to_string(),
                        format!("{:.4}", prev.energy_factor),
                    );
                }
            }

            match session.synthesize(&input).await {
                Ok(audio) => {
                    if attempt > 0 {
                        warn!(
                            chunk = chunk.index,
                            attempt,
                            fraction,
                            "chunk synthesized with shortened text"
                        );
                    }
                    return Ok((audio, false));
                }
                Err(err) if err.is_resource_exhaustion() => {
                    warn!(
                        chunk = chunk.index,
                        attempt,
                        error = %err,
                        "resource exhaustion during chunk synthesis"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        // Documented degradation: emit silence of the chunk's expected
        // duration instead of failing the whole job.
        error!(
            chunk = chunk.index,
            secs = chunk.estimated_secs,
            "retries exhausted, substituting silence"
        );
        let silence = AudioBuffer::silence(chunk.estimated_secs, crate::engine::OUTPUT_SAMPLE_RATE);
        Ok((silence, true))
    }
}

/// Keep the first `fraction` of the words, at least one
fn shorten_words(text: &str, fraction: f32) -> String {
    if fraction >= 1.0 {
        return text.to_string();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let keep = ((words.len() as f32 * fraction).ceil() as usize).clamp(1, words.len());
    words[..keep].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TtsError;
    use crate::engine::{DevicePreference, OUTPUT_SAMPLE_RATE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Session producing tones, optionally exhausting on a marker word
    struct ScriptedSession {
        calls: AtomicUsize,
        fail_on_marker: Option<String>,
    }

    impl ScriptedSession {
        fn healthy() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_marker: None,
            }
        }

        fn failing_on(marker: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_marker: Some(marker.to_string()),
            }
        }
    }

    #[async_trait]
    impl InferenceSession for ScriptedSession {
        async fn synthesize(&self, input: &SynthesisInput) -> crate::core::error::Result<AudioBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(marker) = &self.fail_on_marker {
                if input.text.contains(marker.as_str()) {
                    return Err(TtsError::Synthesis {
                        message: "device out of memory".to_string(),
                        chunk_index: 0,
                        exhausted: true,
                    });
                }
            }
            let secs = (input.text.chars().count() as f32 / 15.0).max(0.05);
            let n = (secs * OUTPUT_SAMPLE_RATE as f32) as usize;
            let samples = (0..n)
                .map(|i| if i % 2 == 0 { 0.2 } else { -0.2 })
                .collect();
            Ok(AudioBuffer::new(samples, OUTPUT_SAMPLE_RATE))
        }

        fn device(&self) -> DevicePreference {
            DevicePreference::Cpu
        }

        fn estimated_memory(&self) -> u64 {
            1024
        }

        fn close(&self) {}
    }

    fn pipeline() -> SynthesisPipeline {
        SynthesisPipeline::new(
            SegmenterConfig::default(),
            StitchConfig::default(),
            Arc::new(VoiceContinuityManager::new()),
        )
    }

    fn four_chunk_pipeline() -> SynthesisPipeline {
        let segmenter = SegmenterConfig {
            max_chunk_chars: 120,
            chunking_threshold_chars: 60,
            ..Default::default()
        };
        SynthesisPipeline::new(
            segmenter,
            StitchConfig::default(),
            Arc::new(VoiceContinuityManager::new()),
        )
    }

    fn four_sentences(marker: &str) -> String {
        format!(
            "The first sentence in this narration describes a long winding road through hills. \
             {} was the word that opened the second sentence of the evening broadcast today. \
             The third sentence carries the narration onward without any surprises at all here. \
             The fourth sentence finally brings the whole recording to a quiet gentle close.",
            marker
        )
    }

    #[tokio::test]
    async fn test_short_text_single_chunk_no_chunking() {
        let pipeline = pipeline();
        let request = SynthesisRequest::new("A fifty character sentence fits in one chunk.", "en");
        let session = Arc::new(ScriptedSession::healthy());

        let outcome = pipeline.run(&request, session, None).await.unwrap();
        assert_eq!(outcome.stats.chunk_count, 1);
        assert!(!outcome.stats.chunking_used);
        assert_eq!(outcome.stats.degraded_chunks, 0);
        assert!(outcome.audio.duration_secs() > 0.0);
    }

    #[tokio::test]
    async fn test_long_text_chunked() {
        let pipeline = pipeline();
        let text = "Every sentence here adds a little more to the running tale. ".repeat(100);
        let request = SynthesisRequest::new(text, "en");
        let session = Arc::new(ScriptedSession::healthy());

        let outcome = pipeline.run(&request, session, None).await.unwrap();
        assert!(outcome.stats.chunking_used);
        assert!(outcome.stats.chunk_count > 1);
        // Stitched duration stays near the sum of chunk durations,
        // within the crossfade overlap budget.
        assert!(outcome.stats.audio_secs > 0.0);
    }

    #[tokio::test]
    async fn test_exhausted_chunk_becomes_silence() {
        let pipeline = four_chunk_pipeline();
        let text = four_sentences("Zebra");
        let request = SynthesisRequest::new(text, "en");
        let session = Arc::new(ScriptedSession::failing_on("Zebra"));

        let outcome = pipeline
            .run(&request, session.clone() as Arc<dyn InferenceSession>, None)
            .await
            .unwrap();
        assert_eq!(outcome.stats.chunk_count, 4);
        assert_eq!(outcome.stats.degraded_chunks, 1);
        // 3 good chunks + 3 failed attempts for the marked chunk.
        assert_eq!(session.calls.load(Ordering::SeqCst), 6);
        assert!(outcome.audio.duration_secs() > 0.0);
    }

    #[tokio::test]
    async fn test_non_exhaustion_error_propagates() {
        struct BrokenSession;

        #[async_trait]
        impl InferenceSession for BrokenSession {
            async fn synthesize(
                &self,
                _input: &SynthesisInput,
            ) -> crate::core::error::Result<AudioBuffer> {
                Err(TtsError::Internal {
                    message: "graph mismatch".to_string(),
                })
            }

            fn device(&self) -> DevicePreference {
                DevicePreference::Cpu
            }

            fn estimated_memory(&self) -> u64 {
                0
            }

            fn close(&self) {}
        }

        let pipeline = pipeline();
        let request = SynthesisRequest::new("Some text worth speaking aloud.", "en");
        let err = pipeline
            .run(&request, Arc::new(BrokenSession), None)
            .await
            .unwrap_err();
        assert!(!err.is_resource_exhaustion());
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let pipeline = pipeline();
        let request = SynthesisRequest::new("   ", "en");
        let session = Arc::new(ScriptedSession::healthy());
        assert!(matches!(
            pipeline.run(&request, session, None).await,
            Err(TtsError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_progress_reported_in_order() {
        let pipeline = pipeline();
        let text = "Another sentence for the narration to carry forward. ".repeat(40);
        let request = SynthesisRequest::new(text, "en");
        let session = Arc::new(ScriptedSession::healthy());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |fraction, _stage| {
            sink.lock().unwrap().push(fraction);
        });

        pipeline.run(&request, session, Some(progress)).await.unwrap();
        let fractions = seen.lock().unwrap();
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*fractions.last().unwrap(), 1.0);
    }

    #[test]
    fn test_shorten_words() {
        let text = "one two three four five six seven eight nine ten";
        assert_eq!(shorten_words(text, 1.0), text);
        assert_eq!(shorten_words(text, 0.7).split_whitespace().count(), 7);
        assert_eq!(shorten_words(text, 0.5).split_whitespace().count(), 5);
        assert_eq!(shorten_words("single", 0.5), "single");
    }
}
