/// Voice Activity Detection (VAD) module
///
/// Detects speech vs silence using energy and zero-crossing rate analysis.
/// Backs the energy spotter used when the keyword engine is not built in.

use crate::audio_source::AudioSample;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum VadError {
    #[error("Frame length mismatch: expected {expected} samples, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// VAD configuration parameters
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS energy threshold for a speech frame (0.0 - 1.0)
    pub energy_threshold: f32,

    /// Zero-crossing rate threshold for a speech frame
    pub zcr_threshold: f32,

    /// Frame size in samples
    pub frame_size: usize,

    /// Consecutive speech frames needed to confirm speech
    pub speech_frames_required: usize,

    /// Consecutive silence frames needed to end speech
    pub silence_frames_required: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            zcr_threshold: 0.05,
            frame_size: 512,             // 32ms at 16kHz, Porcupine's frame length
            speech_frames_required: 3,   // ~96ms of speech to confirm
            silence_frames_required: 10, // ~320ms of silence to end
        }
    }
}

impl VadConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VadError> {
        if !(0.0..=1.0).contains(&self.energy_threshold) {
            return Err(VadError::InvalidConfig(
                "energy_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.zcr_threshold) {
            return Err(VadError::InvalidConfig(
                "zcr_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.frame_size == 0 {
            return Err(VadError::InvalidConfig(
                "frame_size must be greater than 0".to_string(),
            ));
        }

        if self.speech_frames_required == 0 || self.silence_frames_required == 0 {
            return Err(VadError::InvalidConfig(
                "frame counts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Voice Activity Detector state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Currently detecting silence
    Silence,

    /// Potential speech detected (waiting for confirmation)
    MaybeSpeech,

    /// Active speech confirmed
    Speech,

    /// Speech ending (waiting for confirmation)
    MaybeSilence,
}

/// What a single frame did to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    /// State changed without starting or ending speech
    None,

    /// Speech was confirmed on this frame
    SpeechStarted,

    /// Silence was confirmed on this frame
    SpeechEnded,
}

/// Voice Activity Detector
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    speech_frame_count: usize,
    silence_frame_count: usize,
}

impl VoiceActivityDetector {
    pub fn with_config(config: VadConfig) -> Result<Self, VadError> {
        config.validate()?;
        debug!("Initializing VAD with config: {:?}", config);

        Ok(Self {
            config,
            state: VadState::Silence,
            speech_frame_count: 0,
            silence_frame_count: 0,
        })
    }

    /// Process one frame and report the resulting transition
    pub fn process_frame(&mut self, samples: &[AudioSample]) -> Result<VadTransition, VadError> {
        if samples.len() != self.config.frame_size {
            return Err(VadError::FrameLength {
                expected: self.config.frame_size,
                actual: samples.len(),
            });
        }

        let energy = calculate_energy(samples);
        let zcr = calculate_zero_crossing_rate(samples);

        trace!(
            "Frame analysis: energy={:.4}, zcr={:.4}, state={:?}",
            energy, zcr, self.state
        );

        let is_speech_frame =
            energy > self.config.energy_threshold && zcr > self.config.zcr_threshold;

        Ok(self.update_state(is_speech_frame))
    }

    fn update_state(&mut self, is_speech_frame: bool) -> VadTransition {
        match self.state {
            VadState::Silence => {
                if is_speech_frame {
                    self.speech_frame_count = 1;
                    self.silence_frame_count = 0;
                    if self.config.speech_frames_required <= 1 {
                        self.state = VadState::Speech;
                        return VadTransition::SpeechStarted;
                    }
                    self.state = VadState::MaybeSpeech;
                }
                VadTransition::None
            }

            VadState::MaybeSpeech => {
                if is_speech_frame {
                    self.speech_frame_count += 1;
                    if self.speech_frame_count >= self.config.speech_frames_required {
                        self.state = VadState::Speech;
                        debug!("State: MaybeSpeech -> Speech (confirmed)");
                        return VadTransition::SpeechStarted;
                    }
                } else {
                    self.state = VadState::Silence;
                    self.speech_frame_count = 0;
                }
                VadTransition::None
            }

            VadState::Speech => {
                if !is_speech_frame {
                    self.silence_frame_count = 1;
                    self.speech_frame_count = 0;
                    if self.config.silence_frames_required <= 1 {
                        self.state = VadState::Silence;
                        return VadTransition::SpeechEnded;
                    }
                    self.state = VadState::MaybeSilence;
                } else {
                    self.silence_frame_count = 0;
                }
                VadTransition::None
            }

            VadState::MaybeSilence => {
                if !is_speech_frame {
                    self.silence_frame_count += 1;
                    if self.silence_frame_count >= self.config.silence_frames_required {
                        self.state = VadState::Silence;
                        debug!("State: MaybeSilence -> Silence (speech ended)");
                        return VadTransition::SpeechEnded;
                    }
                } else {
                    self.state = VadState::Speech;
                    self.silence_frame_count = 0;
                }
                VadTransition::None
            }
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

/// Normalized RMS energy of a frame
pub fn calculate_energy(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Fraction of adjacent sample pairs that change sign
pub fn calculate_zero_crossing_rate(samples: &[AudioSample]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();

    crossings as f32 / (samples.len() - 1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const FRAME: usize = 512;

    fn generate_tone(frequency: f32, duration_samples: usize, amplitude: f32) -> Vec<AudioSample> {
        let sample_rate = 16000.0;
        (0..duration_samples)
            .map(|i| {
                let t = i as f32 / sample_rate;
                let sample = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
                (sample * i16::MAX as f32) as i16
            })
            .collect()
    }

    fn detector(speech: usize, silence: usize) -> VoiceActivityDetector {
        VoiceActivityDetector::with_config(VadConfig {
            energy_threshold: 0.01,
            zcr_threshold: 0.01,
            frame_size: FRAME,
            speech_frames_required: speech,
            silence_frames_required: silence,
        })
        .unwrap()
    }

    #[test]
    fn test_vad_config_validation() {
        assert!(VadConfig::default().validate().is_ok());

        let config = VadConfig {
            energy_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = VadConfig {
            frame_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_energy_and_zcr() {
        let silence = vec![0; FRAME];
        assert!(calculate_energy(&silence) < 0.001);
        assert_relative_eq!(calculate_zero_crossing_rate(&silence), 0.0, epsilon = 0.001);

        let tone = generate_tone(200.0, FRAME, 0.5);
        assert!(calculate_energy(&tone) > 0.1);
        assert!(calculate_zero_crossing_rate(&tone) > 0.01);
    }

    #[test]
    fn test_state_transitions() {
        let mut vad = detector(2, 2);
        let speech = generate_tone(200.0, FRAME, 0.3);
        let silence = vec![0; FRAME];

        assert_eq!(vad.process_frame(&speech).unwrap(), VadTransition::None);
        assert_eq!(vad.state(), VadState::MaybeSpeech);

        assert_eq!(vad.process_frame(&speech).unwrap(), VadTransition::SpeechStarted);
        assert_eq!(vad.state(), VadState::Speech);

        assert_eq!(vad.process_frame(&speech).unwrap(), VadTransition::None);

        assert_eq!(vad.process_frame(&silence).unwrap(), VadTransition::None);
        assert_eq!(vad.state(), VadState::MaybeSilence);

        assert_eq!(vad.process_frame(&silence).unwrap(), VadTransition::SpeechEnded);
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn test_single_frame_confirmation() {
        let mut vad = detector(1, 1);
        let speech = generate_tone(200.0, FRAME, 0.3);

        assert_eq!(vad.process_frame(&speech).unwrap(), VadTransition::SpeechStarted);
        assert_eq!(vad.process_frame(&vec![0; FRAME]).unwrap(), VadTransition::SpeechEnded);
    }

    #[test]
    fn test_false_alarm_handling() {
        let mut vad = detector(3, 2);
        let speech = generate_tone(200.0, FRAME, 0.3);

        vad.process_frame(&speech).unwrap();
        assert_eq!(vad.state(), VadState::MaybeSpeech);

        vad.process_frame(&vec![0; FRAME]).unwrap();
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn test_frame_length_error() {
        let mut vad = detector(2, 2);

        match vad.process_frame(&[0; 100]) {
            Err(VadError::FrameLength { expected, actual }) => {
                assert_eq!(expected, FRAME);
                assert_eq!(actual, 100);
            }
            other => panic!("Expected FrameLength error, got {:?}", other),
        }
    }
}
