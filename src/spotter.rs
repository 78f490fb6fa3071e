/// Keyword spotter module
///
/// The trigger loop treats keyword spotting as an opaque classifier over
/// fixed-length frames. This module defines that contract and the engines
/// that can sit behind it.

use crate::audio_source::{AudioFrame, SAMPLE_RATE};
use crate::vad::{VadConfig, VadTransition, VoiceActivityDetector};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Porcupine's fixed frame length at 16kHz
pub const DEFAULT_FRAME_LENGTH: usize = 512;

#[derive(Error, Debug)]
pub enum SpotterError {
    #[error("Invalid access credential: {0}")]
    InvalidCredential(String),

    #[error("Failed to load spotting model: {0}")]
    ModelLoadFailure(String),

    #[error("Invalid frame length: expected {expected} samples, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    #[error("Spotting engine error: {0}")]
    Engine(String),
}

/// Verdict for a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    NoMatch,

    /// Index into the configured keyword list
    Matched(usize),
}

/// Frame classifier that reports which keyword, if any, was spoken
#[cfg_attr(test, mockall::automock)]
pub trait KeywordSpotter: Send {
    /// Exact number of samples `process` accepts
    fn frame_length(&self) -> usize;

    /// Sample rate the frames must be captured at
    fn sample_rate(&self) -> u32;

    /// Classify one frame
    fn process(&mut self, frame: &AudioFrame) -> Result<Detection, SpotterError>;
}

/// Spotting engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotterEngine {
    /// Picovoice Porcupine (requires the `porcupine` feature)
    Porcupine,

    /// Energy-based stand-in, triggers on speech onset
    Energy,
}

impl Default for SpotterEngine {
    fn default() -> Self {
        Self::Porcupine
    }
}

/// Everything an engine needs at construction
#[derive(Debug, Clone)]
pub struct SpotterSettings {
    pub access_key: String,
    pub model_path: PathBuf,
    pub keyword_paths: Vec<PathBuf>,
    pub sensitivities: Vec<f32>,
}

/// Construct the configured engine
pub fn build_spotter(
    engine: SpotterEngine,
    settings: &SpotterSettings,
) -> Result<Box<dyn KeywordSpotter>, SpotterError> {
    if settings.access_key.trim().is_empty() {
        return Err(SpotterError::InvalidCredential(
            "access key is empty".to_string(),
        ));
    }

    match engine {
        SpotterEngine::Porcupine => build_porcupine(settings),
        SpotterEngine::Energy => {
            let sensitivity = settings.sensitivities.first().copied().unwrap_or(0.5);
            Ok(Box::new(EnergySpotter::new(sensitivity, DEFAULT_FRAME_LENGTH)?))
        }
    }
}

#[cfg(feature = "porcupine")]
fn build_porcupine(settings: &SpotterSettings) -> Result<Box<dyn KeywordSpotter>, SpotterError> {
    Ok(Box::new(porcupine_engine::PorcupineSpotter::new(settings)?))
}

#[cfg(not(feature = "porcupine"))]
fn build_porcupine(_settings: &SpotterSettings) -> Result<Box<dyn KeywordSpotter>, SpotterError> {
    Err(SpotterError::ModelLoadFailure(
        "built without Porcupine support (enable the `porcupine` feature or use the energy engine)"
            .to_string(),
    ))
}

#[cfg(feature = "porcupine")]
pub use porcupine_engine::PorcupineSpotter;

#[cfg(feature = "porcupine")]
mod porcupine_engine {
    use super::{Detection, KeywordSpotter, SpotterError, SpotterSettings};
    use crate::audio_source::AudioFrame;
    use porcupine::{Porcupine, PorcupineBuilder};
    use tracing::info;

    /// Picovoice Porcupine engine
    pub struct PorcupineSpotter {
        engine: Porcupine,
        frame_length: usize,
        sample_rate: u32,
    }

    impl PorcupineSpotter {
        pub fn new(settings: &SpotterSettings) -> Result<Self, SpotterError> {
            for path in std::iter::once(&settings.model_path).chain(&settings.keyword_paths) {
                if !path.exists() {
                    return Err(SpotterError::ModelLoadFailure(format!(
                        "file not found: {}",
                        path.display()
                    )));
                }
            }

            let engine = PorcupineBuilder::new_with_keyword_paths(
                settings.access_key.clone(),
                &settings.keyword_paths,
            )
            .sensitivities(&settings.sensitivities)
            .model_path(settings.model_path.clone())
            .init()
            .map_err(|e| classify_init_error(e.to_string()))?;

            let frame_length = engine.frame_length() as usize;
            let sample_rate = engine.sample_rate();
            info!(
                "Porcupine ready: {} keyword(s), frame length {}, {} Hz",
                settings.keyword_paths.len(),
                frame_length,
                sample_rate
            );

            Ok(Self {
                engine,
                frame_length,
                sample_rate,
            })
        }
    }

    fn classify_init_error(message: String) -> SpotterError {
        let lowered = message.to_lowercase();
        if lowered.contains("accesskey") || lowered.contains("access key") || lowered.contains("activation") {
            SpotterError::InvalidCredential(message)
        } else {
            SpotterError::ModelLoadFailure(message)
        }
    }

    impl KeywordSpotter for PorcupineSpotter {
        fn frame_length(&self) -> usize {
            self.frame_length
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn process(&mut self, frame: &AudioFrame) -> Result<Detection, SpotterError> {
            if frame.len() != self.frame_length {
                return Err(SpotterError::InvalidFrameLength {
                    expected: self.frame_length,
                    actual: frame.len(),
                });
            }

            let index = self
                .engine
                .process(frame.samples())
                .map_err(|e| SpotterError::Engine(e.to_string()))?;

            Ok(usize::try_from(index).map_or(Detection::NoMatch, Detection::Matched))
        }
    }
}

/// Energy-based stand-in for a keyword engine
///
/// Reports `Matched(0)` each time the voice activity detector confirms the
/// start of speech. Higher sensitivity lowers the energy threshold.
pub struct EnergySpotter {
    vad: VoiceActivityDetector,
    frame_length: usize,
}

impl EnergySpotter {
    const MIN_ENERGY_THRESHOLD: f32 = 0.005;
    const ENERGY_RANGE: f32 = 0.2;

    pub fn new(sensitivity: f32, frame_length: usize) -> Result<Self, SpotterError> {
        if !(0.0..=1.0).contains(&sensitivity) {
            return Err(SpotterError::ModelLoadFailure(format!(
                "sensitivity {} outside [0, 1]",
                sensitivity
            )));
        }

        let config = VadConfig {
            energy_threshold: Self::MIN_ENERGY_THRESHOLD + Self::ENERGY_RANGE * (1.0 - sensitivity),
            zcr_threshold: 0.01,
            frame_size: frame_length,
            ..Default::default()
        };

        let vad = VoiceActivityDetector::with_config(config)
            .map_err(|e| SpotterError::ModelLoadFailure(e.to_string()))?;

        info!(
            "Energy spotter ready: threshold {:.3}, frame length {}",
            vad.config().energy_threshold,
            frame_length
        );

        Ok(Self { vad, frame_length })
    }

    pub fn energy_threshold(&self) -> f32 {
        self.vad.config().energy_threshold
    }
}

impl KeywordSpotter for EnergySpotter {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn process(&mut self, frame: &AudioFrame) -> Result<Detection, SpotterError> {
        if frame.len() != self.frame_length {
            return Err(SpotterError::InvalidFrameLength {
                expected: self.frame_length,
                actual: frame.len(),
            });
        }

        match self.vad.process_frame(frame.samples()) {
            Ok(VadTransition::SpeechStarted) => {
                debug!("Speech onset detected");
                Ok(Detection::Matched(0))
            }
            Ok(_) => Ok(Detection::NoMatch),
            Err(e) => Err(SpotterError::Engine(e.to_string())),
        }
    }
}
