/// Wake-word trigger library
///
/// Listens to a microphone for the trigger phrase and, on detection,
/// publishes a trigger event and asks the downstream listener to start.

pub mod activation;
pub mod audio_source;
pub mod capture;
pub mod channel;
pub mod config;
pub mod controller;
pub mod service;
pub mod spotter;
pub mod vad;

// Re-export main types
pub use activation::{ActivationError, ListenActivationClient, TcpActivationClient};
pub use audio_source::{AudioFrame, AudioSample, CaptureError, FrameSource, WavFrameSource, SAMPLE_RATE};
pub use capture::{CaptureConfig, CpalFrameSource};
pub use channel::{BroadcastEventChannel, EventChannel, PublishError, TriggerEvent, UdpEventChannel};
pub use config::{ConfigError, TriggerConfig};
pub use controller::{ControllerConfig, ControllerState, ControllerStats, TriggerController, TriggerError};
pub use service::{start, Service, StartupError, StartupOptions};
pub use spotter::{build_spotter, Detection, EnergySpotter, KeywordSpotter, SpotterEngine, SpotterError, SpotterSettings};
pub use vad::{VadConfig, VadError, VadState, VoiceActivityDetector};

/// Initialize tracing with `RUST_LOG`, defaulting to info for this crate
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wakeword_trigger=info".into()),
        )
        .init();
}
