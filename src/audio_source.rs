/// Audio frame source module
///
/// Defines the fixed-length PCM frame handed to the keyword spotter and the
/// `FrameSource` contract the trigger loop pulls frames from. Also provides
/// a WAV replay source for running the pipeline against recorded audio.

use async_trait::async_trait;
use hound::{SampleFormat, WavReader};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Default sample rate for speech capture (Porcupine requires 16kHz)
pub const SAMPLE_RATE: u32 = 16000;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio capture interrupted: {0}")]
    CaptureInterrupted(String),

    #[error("Audio source closed")]
    Closed,

    #[error("Audio stream ended")]
    EndOfStream,
}

/// One frame of mono PCM audio
///
/// The length always equals the frame length the spotter asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Box<[AudioSample]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<AudioSample>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    /// Frame of `length` zero samples
    pub fn silence(length: usize) -> Self {
        Self::new(vec![0; length])
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<AudioSample>> for AudioFrame {
    fn from(samples: Vec<AudioSample>) -> Self {
        Self::new(samples)
    }
}

/// Pull-based source of fixed-length audio frames
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSource: Send {
    /// Number of samples in every frame this source returns
    fn frame_length(&self) -> usize;

    /// Wait for the next full frame
    ///
    /// Never returns a short frame. `CaptureInterrupted` is transient and
    /// the caller may retry; every other error ends capture.
    async fn read_frame(&mut self) -> Result<AudioFrame, CaptureError>;

    /// Throw away audio captured but not yet read, returning the sample count
    ///
    /// Sources that only produce audio when asked have nothing to discard.
    fn discard_pending(&mut self) -> usize {
        0
    }

    /// Samples lost because the reader fell behind
    fn dropped_samples(&self) -> u64 {
        0
    }

    /// Release the underlying device
    fn close(&mut self);
}

/// Frame source replaying a mono 16-bit WAV file
pub struct WavFrameSource {
    reader: Option<WavReader<BufReader<File>>>,
    frame_length: usize,
    frames_read: u64,
}

impl WavFrameSource {
    /// Open a WAV file, checking it matches the spotter's audio format
    pub fn open(
        path: impl AsRef<Path>,
        frame_length: usize,
        sample_rate: u32,
    ) -> Result<Self, CaptureError> {
        let path = path.as_ref();

        if frame_length == 0 {
            return Err(CaptureError::DeviceUnavailable(
                "frame length must be greater than 0".to_string(),
            ));
        }

        let reader = WavReader::open(path).map_err(|e| {
            CaptureError::DeviceUnavailable(format!("{}: {}", path.display(), e))
        })?;

        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{}: expected mono audio, found {} channels",
                path.display(),
                spec.channels
            )));
        }

        if spec.sample_rate != sample_rate {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{}: expected {} Hz, found {} Hz",
                path.display(),
                sample_rate,
                spec.sample_rate
            )));
        }

        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{}: expected 16-bit integer PCM",
                path.display()
            )));
        }

        info!(
            "Replaying {} ({} samples, frame length {})",
            path.display(),
            reader.duration(),
            frame_length
        );

        Ok(Self {
            reader: Some(reader),
            frame_length,
            frames_read: 0,
        })
    }

    /// Number of frames handed out so far
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

#[async_trait]
impl FrameSource for WavFrameSource {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    async fn read_frame(&mut self) -> Result<AudioFrame, CaptureError> {
        let reader = self.reader.as_mut().ok_or(CaptureError::Closed)?;

        let samples = reader
            .samples::<AudioSample>()
            .take(self.frame_length)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CaptureError::CaptureInterrupted(e.to_string()))?;

        // A trailing partial frame is never handed out
        if samples.len() < self.frame_length {
            debug!("Replay finished after {} frames", self.frames_read);
            return Err(CaptureError::EndOfStream);
        }

        self.frames_read += 1;
        Ok(AudioFrame::new(samples))
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("Replay source closed");
        }
    }
}
