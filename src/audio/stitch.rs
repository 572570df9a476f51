//! Audio-domain stitching of independently synthesized chunks
//!
//! Chunks are volume-normalized toward a reference RMS taken from the
//! first chunk, cross-faded at each boundary with a curve chosen from
//! the surrounding energy, and lightly smoothed at the seams. Chunks
//! are always combined in original index order; the crossfade overlap
//! never exceeds the shorter of the two neighbors.

use serde::Serialize;
use tracing::debug;

use crate::core::config::StitchConfig;
use crate::core::error::{AudioOperation, Result, TtsError};
use crate::engine::AudioBuffer;
use crate::voice::ChunkVoiceState;

/// RMS below which a region counts as quiet
const QUIET_RMS: f32 = 0.02;
/// Energy delta above which the extra-smooth curve is used
const LARGE_DELTA_RMS: f32 = 0.08;

/// Fade curve shapes for crossfading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FadeCurve {
    /// Straight blend, for quiet-to-quiet transitions
    Linear,
    /// Standard cosine blend
    Cosine,
    /// Extra-smooth blend for large energy deltas
    SmoothStep,
}

impl FadeCurve {
    /// Fade-in weight at position `t` in [0, 1]
    pub fn fade_in(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::Cosine => 0.5 * (1.0 - (std::f32::consts::PI * t).cos()),
            FadeCurve::SmoothStep => t * t * (3.0 - 2.0 * t),
        }
    }

    /// Fade-out weight at position `t` in [0, 1]
    pub fn fade_out(&self, t: f32) -> f32 {
        1.0 - self.fade_in(t)
    }
}

/// Stitches chunk audio into one continuous waveform
#[derive(Debug, Clone)]
pub struct AudioStitcher {
    config: StitchConfig,
}

impl AudioStitcher {
    /// Create a stitcher
    pub fn new(config: StitchConfig) -> Self {
        Self { config }
    }

    /// Concatenate chunk audio in index order.
    ///
    /// A single chunk is returned unchanged. Every buffer must share
    /// one sample rate.
    pub fn concatenate(
        &self,
        chunks: &[AudioBuffer],
        states: &[ChunkVoiceState],
    ) -> Result<AudioBuffer> {
        if chunks.is_empty() {
            return Ok(AudioBuffer::default());
        }
        if chunks.len() == 1 {
            return Ok(chunks[0].clone());
        }

        let sample_rate = chunks[0].sample_rate;
        if chunks.iter().any(|c| c.sample_rate != sample_rate) {
            return Err(TtsError::Audio {
                message: "chunk sample rates differ".to_string(),
                operation: AudioOperation::Concatenation,
            });
        }

        let normalized = self.normalize(chunks, states);

        let mut out: Vec<f32> = normalized[0].clone();
        let mut seams: Vec<(usize, usize)> = Vec::new();

        for i in 1..normalized.len() {
            let prev = &normalized[i - 1];
            let next = &normalized[i];

            let fade_secs = states
                .get(i - 1)
                .map(|s| s.crossfade.fade_secs)
                .unwrap_or(0.0)
                .clamp(self.config.min_crossfade_secs, self.config.max_crossfade_secs);
            let requested = (fade_secs * sample_rate as f32).round() as usize;
            // Bounded by the shorter of the two neighbors.
            let overlap = requested.min(prev.len()).min(next.len());

            if overlap == 0 {
                out.extend_from_slice(next);
                continue;
            }

            let default_curve = states
                .get(i - 1)
                .map(|s| s.crossfade.curve)
                .unwrap_or(FadeCurve::Cosine);
            let curve = choose_curve(
                region_rms(&out[out.len() - overlap..]),
                region_rms(&next[..overlap]),
                default_curve,
            );

            let start = out.len() - overlap;
            for j in 0..overlap {
                let t = (j + 1) as f32 / (overlap + 1) as f32;
                out[start + j] = out[start + j] * curve.fade_out(t) + next[j] * curve.fade_in(t);
            }
            out.extend_from_slice(&next[overlap..]);
            seams.push((start, start + overlap));
        }

        self.smooth_seams(&mut out, &seams);

        // Final clipping guard: scale down rather than hard-clip when
        // the blend pushed a peak over full scale.
        let peak = out.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));
        if peak > 1.0 {
            let scale = 1.0 / peak;
            for sample in &mut out {
                *sample *= scale;
            }
        }

        debug!(
            chunks = chunks.len(),
            samples = out.len(),
            "stitched chunk audio"
        );
        Ok(AudioBuffer::new(out, sample_rate))
    }

    /// Pull each chunk's RMS toward the first chunk's, with a clamped
    /// gain that tightens at clean sentence boundaries
    fn normalize(&self, chunks: &[AudioBuffer], states: &[ChunkVoiceState]) -> Vec<Vec<f32>> {
        let reference_rms = chunks[0].rms();
        let mut normalized: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        normalized.push(chunks[0].samples.clone());

        for (i, chunk) in chunks.iter().enumerate().skip(1) {
            let rms = chunk.rms();
            if reference_rms <= f32::EPSILON || rms <= f32::EPSILON {
                // Silent reference or silent chunk: leave untouched.
                normalized.push(chunk.samples.clone());
                continue;
            }

            let after_boundary = states
                .get(i - 1)
                .map(|s| s.ends_at_sentence)
                .unwrap_or(false);
            let (lo, hi) = if after_boundary {
                (
                    self.config.min_gain + self.config.boundary_gain_margin,
                    self.config.max_gain - self.config.boundary_gain_margin,
                )
            } else {
                (self.config.min_gain, self.config.max_gain)
            };

            let gain = (reference_rms / rms).clamp(lo, hi);
            normalized.push(chunk.samples.iter().map(|s| s * gain).collect());
        }
        normalized
    }

    /// Light 3-tap smoothing around each seam to remove residual
    /// micro-discontinuities
    fn smooth_seams(&self, samples: &mut [f32], seams: &[(usize, usize)]) {
        let radius = self.config.smoothing_radius;
        if radius == 0 {
            return;
        }
        for &(start, end) in seams {
            let lo = start.saturating_sub(radius).max(1);
            let hi = (end + radius).min(samples.len().saturating_sub(1));
            if lo >= hi {
                continue;
            }
            let original: Vec<f32> = samples[lo - 1..=hi].to_vec();
            for i in lo..hi {
                let k = i - (lo - 1);
                samples[i] = 0.25 * original[k - 1] + 0.5 * original[k] + 0.25 * original[k + 1];
            }
        }
    }
}

/// Pick the fade curve from the energy on both sides of a boundary
fn choose_curve(tail_rms: f32, head_rms: f32, default: FadeCurve) -> FadeCurve {
    if tail_rms < QUIET_RMS && head_rms < QUIET_RMS {
        FadeCurve::Linear
    } else if (tail_rms - head_rms).abs() > LARGE_DELTA_RMS {
        FadeCurve::SmoothStep
    } else {
        default
    }
}

/// RMS of a sample slice
fn region_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
