/// Trigger controller module
///
/// Runs the wake-word loop: pull a frame, classify it, and on a match
/// publish a trigger event and then ask the listener to start. The loop is
/// strictly sequential. While an activation request is in flight no frames
/// are read, so at most one handshake is ever outstanding and detections in
/// that window are dropped.
///
/// State machine:
///   Idle -> Classifying -> Idle              (no match)
///   Idle -> Classifying -> Dispatching -> Idle  (match)

use crate::activation::{ActivationError, ListenActivationClient};
use crate::audio_source::{AudioFrame, CaptureError, FrameSource};
use crate::channel::{EventChannel, TriggerEvent};
use crate::spotter::{Detection, KeywordSpotter, SpotterError};
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Audio capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Audio capture failed after {attempts} attempts: {source}")]
    CaptureExhausted { attempts: u32, source: CaptureError },

    #[error("Keyword spotting failed: {0}")]
    Spotter(#[from] SpotterError),
}

/// Where the controller is within one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Waiting for the next frame
    Idle,

    /// Frame handed to the spotter
    Classifying,

    /// Keyword matched, publish and activation in progress
    Dispatching,
}

/// Loop and handshake policy
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name published for each keyword index
    pub keyword_names: Vec<String>,

    /// Upper bound on one activation request
    pub activation_timeout: Duration,

    /// Consecutive interrupted reads tolerated before giving up
    pub capture_retry_limit: u32,

    /// Pause between retried reads
    pub capture_retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            keyword_names: vec!["Hey Alfred".to_string()],
            activation_timeout: Duration::from_secs(2),
            capture_retry_limit: 3,
            capture_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Controller statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub frames_processed: u64,
    pub detections: u64,
    pub publish_failures: u64,
    pub activation_failures: u64,
    pub capture_retries: u64,
    pub dropped_samples: u64,
}

/// Wake-word trigger state machine
pub struct TriggerController {
    config: ControllerConfig,
    source: Box<dyn FrameSource>,
    spotter: Box<dyn KeywordSpotter>,
    events: Box<dyn EventChannel>,
    activation: Box<dyn ListenActivationClient>,
    state: ControllerState,
    stats: ControllerStats,
    last_timestamp: Option<i64>,
}

impl TriggerController {
    /// Wire the loop together
    ///
    /// Fails if the source does not produce frames of the length the
    /// spotter requires.
    pub fn new(
        config: ControllerConfig,
        source: Box<dyn FrameSource>,
        spotter: Box<dyn KeywordSpotter>,
        events: Box<dyn EventChannel>,
        activation: Box<dyn ListenActivationClient>,
    ) -> Result<Self, TriggerError> {
        if source.frame_length() != spotter.frame_length() {
            return Err(SpotterError::InvalidFrameLength {
                expected: spotter.frame_length(),
                actual: source.frame_length(),
            }
            .into());
        }

        Ok(Self {
            config,
            source,
            spotter,
            events,
            activation,
            state: ControllerState::Idle,
            stats: ControllerStats::default(),
            last_timestamp: None,
        })
    }

    /// Run until `shutdown` is cancelled or the source runs dry
    ///
    /// Cancellation is only observed between iterations; a handshake in
    /// progress always completes first.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), TriggerError> {
        info!(
            "Listening for {:?} (frame length {})",
            self.config.keyword_names,
            self.spotter.frame_length()
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving trigger loop");
                break;
            }

            let frame = match self.next_frame().await? {
                Some(frame) => frame,
                None => {
                    info!("Audio source exhausted, leaving trigger loop");
                    break;
                }
            };

            self.process_frame(&frame).await?;
        }

        Ok(())
    }

    /// Classify one frame and dispatch on a match
    ///
    /// Returns the published event when the frame matched a keyword.
    pub async fn process_frame(
        &mut self,
        frame: &AudioFrame,
    ) -> Result<Option<TriggerEvent>, TriggerError> {
        self.state = ControllerState::Classifying;
        let verdict = self.spotter.process(frame);
        self.stats.frames_processed += 1;

        if self.stats.frames_processed % 1000 == 0 {
            debug!(
                "Processed {} frames, detected {} wake-words",
                self.stats.frames_processed, self.stats.detections
            );
        }

        let index = match verdict {
            Ok(Detection::NoMatch) => {
                self.state = ControllerState::Idle;
                return Ok(None);
            }
            Ok(Detection::Matched(index)) => index,
            Err(e) => {
                self.state = ControllerState::Idle;
                return Err(e.into());
            }
        };

        self.state = ControllerState::Dispatching;
        let event = self.dispatch(index).await;
        self.state = ControllerState::Idle;

        Ok(Some(event))
    }

    /// Publish, then request activation
    async fn dispatch(&mut self, index: usize) -> TriggerEvent {
        let event = TriggerEvent::new(self.keyword_name(index), self.next_timestamp());
        self.stats.detections += 1;
        info!("Detected keyword: {}", event.word);

        if let Err(e) = self.events.publish(&event) {
            self.stats.publish_failures += 1;
            warn!("Failed to publish trigger event: {}", e);
        }

        let limit = self.config.activation_timeout;
        let outcome = match timeout(limit, self.activation.request_listen()).await {
            Ok(result) => result,
            Err(_) => Err(ActivationError::Timeout(limit)),
        };

        match outcome {
            Ok(()) => info!("Listener activated"),
            Err(e) => {
                self.stats.activation_failures += 1;
                warn!("Listen activation failed: {}", e);
            }
        }

        // Audio buffered during the handshake never starts a second one
        let discarded = self.source.discard_pending();
        if discarded > 0 {
            debug!("Discarded {} samples captured during activation", discarded);
        }

        event
    }

    /// Read a frame, retrying transient interruptions
    ///
    /// `None` means the source has no more audio.
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>, TriggerError> {
        let limit = self.config.capture_retry_limit;
        let mut failures = 0u32;

        loop {
            match self.source.read_frame().await {
                Ok(frame) => return Ok(Some(frame)),
                Err(CaptureError::EndOfStream) => return Ok(None),
                Err(CaptureError::CaptureInterrupted(reason)) if failures < limit => {
                    failures += 1;
                    self.stats.capture_retries += 1;
                    warn!("Capture interrupted ({}), retry {}/{}", reason, failures, limit);
                    sleep(self.config.capture_retry_delay).await;
                }
                Err(e @ CaptureError::CaptureInterrupted(_)) => {
                    return Err(TriggerError::CaptureExhausted {
                        attempts: failures + 1,
                        source: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn keyword_name(&self, index: usize) -> String {
        self.config
            .keyword_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| {
                warn!("Spotter reported unknown keyword index {}", index);
                format!("keyword-{}", index)
            })
    }

    /// Current time in seconds, never earlier than the previous event
    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp();
        let timestamp = self.last_timestamp.map_or(now, |last| now.max(last));
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            dropped_samples: self.source.dropped_samples(),
            ..self.stats.clone()
        }
    }

    pub fn frame_length(&self) -> usize {
        self.spotter.frame_length()
    }

    /// Release the audio source
    pub fn close(&mut self) {
        self.source.close();
    }
}
