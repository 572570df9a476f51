//! Inference runtime seam
//!
//! The core never interprets model internals. It talks to the neural
//! runtime through two traits: [`InferenceRuntime`] constructs warm
//! sessions from resolved model artifacts, and [`InferenceSession`]
//! turns a reference-conditioned text request into a PCM buffer.
//! Everything behind these traits (graph execution, tensors, weights)
//! belongs to the collaborating runtime crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::{AudioOperation, Result, TtsError};

/// Sample rate of every buffer produced by the core, in Hz
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Mono PCM audio in 32-bit float samples
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    /// Audio samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a buffer from raw samples
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Create a buffer of silence with the given duration
    pub fn silence(duration_secs: f32, sample_rate: u32) -> Self {
        let n = (duration_secs.max(0.0) * sample_rate as f32).round() as usize;
        Self {
            samples: vec![0.0; n],
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square energy of the buffer
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()))
    }

    /// Encode as 16-bit WAV bytes
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer =
                hound::WavWriter::new(&mut buffer, spec).map_err(|e| TtsError::Audio {
                    message: format!("Failed to create WAV writer: {}", e),
                    operation: AudioOperation::Encoding,
                })?;

            for &sample in &self.samples {
                let sample_i16 = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                writer.write_sample(sample_i16).map_err(|e| TtsError::Audio {
                    message: format!("Failed to write sample: {}", e),
                    operation: AudioOperation::Encoding,
                })?;
            }

            writer.finalize().map_err(|e| TtsError::Audio {
                message: format!("Failed to finalize WAV: {}", e),
                operation: AudioOperation::Encoding,
            })?;
        }

        Ok(buffer.into_inner())
    }

    /// Write a 16-bit WAV file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_wav_bytes()?;
        std::fs::write(path.as_ref(), bytes).map_err(|e| TtsError::Io {
            message: format!("Failed to save audio: {}", e),
            path: Some(path.as_ref().to_path_buf()),
        })
    }
}

/// Device placement requested for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevicePreference {
    /// Run on a specific accelerator
    Gpu(u32),
    /// Run without an accelerator
    Cpu,
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DevicePreference::Gpu(id) => write!(f, "gpu:{}", id),
            DevicePreference::Cpu => write!(f, "cpu"),
        }
    }
}

/// A resolved model artifact location
///
/// Resolution (download, checksum, unpack) happens in the external
/// loader; the core only sees a local path plus a variant tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelArtifact {
    /// Local filesystem path of the model weights
    pub path: PathBuf,
    /// Model variant identifier (e.g. "base", "clone-1.7b")
    pub variant: String,
}

impl ModelArtifact {
    /// Create an artifact reference
    pub fn new(path: impl Into<PathBuf>, variant: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            variant: variant.into(),
        }
    }
}

/// One synthesis call against a warm session
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    /// Target text to speak
    pub text: String,
    /// Reference audio conditioning the voice, if cloning
    pub reference_audio: Option<Arc<AudioBuffer>>,
    /// Transcription of the reference audio
    pub reference_text: Option<String>,
    /// Pitch adjustment factor around 1.0
    pub pitch_factor: f32,
    /// Energy adjustment factor around 1.0
    pub energy_factor: f32,
    /// Tempo adjustment factor around 1.0
    pub tempo_factor: f32,
    /// Engine-specific parameters
    pub extra: HashMap<String, String>,
}

impl SynthesisInput {
    /// Create a plain input with neutral prosody factors
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reference_audio: None,
            reference_text: None,
            pitch_factor: 1.0,
            energy_factor: 1.0,
            tempo_factor: 1.0,
            extra: HashMap::new(),
        }
    }

    /// Attach reference material for voice cloning
    pub fn with_reference(
        mut self,
        audio: Arc<AudioBuffer>,
        text: impl Into<String>,
    ) -> Self {
        self.reference_audio = Some(audio);
        self.reference_text = Some(text.into());
        self
    }
}

/// A loaded, ready-to-run acoustic model bound to a device
#[async_trait]
pub trait InferenceSession: Send + Sync {
    /// Run one synthesis call. The returned buffer is mono PCM at
    /// [`OUTPUT_SAMPLE_RATE`].
    async fn synthesize(&self, input: &SynthesisInput) -> Result<AudioBuffer>;

    /// Device this session is bound to
    fn device(&self) -> DevicePreference;

    /// Estimated resident memory of the loaded model, in bytes
    fn estimated_memory(&self) -> u64;

    /// Release underlying runtime resources. Called by the cache on
    /// eviction; must be safe to call more than once.
    fn close(&self);
}

/// Constructs warm inference sessions from resolved artifacts
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Load model weights and warm the runtime. Expensive; callers go
    /// through the model cache rather than invoking this directly.
    ///
    /// A missing or unreadable artifact is a configuration error.
    async fn create_session(
        &self,
        artifact: &ModelArtifact,
        language: &str,
        device: DevicePreference,
    ) -> Result<Arc<dyn InferenceSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_duration() {
        let buf = AudioBuffer::silence(1.5, OUTPUT_SAMPLE_RATE);
        assert_eq!(buf.len(), 36_000);
        assert!((buf.duration_secs() - 1.5).abs() < 1e-4);
        assert_eq!(buf.rms(), 0.0);
    }

    #[test]
    fn test_rms_of_constant_signal() {
        let buf = AudioBuffer::new(vec![0.5; 1000], OUTPUT_SAMPLE_RATE);
        assert!((buf.rms() - 0.5).abs() < 1e-5);
        assert!((buf.peak() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_wav_bytes_header() {
        let buf = AudioBuffer::new(vec![0.0; 100], OUTPUT_SAMPLE_RATE);
        let bytes = buf.to_wav_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
    }

    #[test]
    fn test_device_preference_display() {
        assert_eq!(DevicePreference::Gpu(1).to_string(), "gpu:1");
        assert_eq!(DevicePreference::Cpu.to_string(), "cpu");
    }
}
