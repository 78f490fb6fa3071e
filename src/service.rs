/// Service startup
///
/// Assembles a ready-to-run trigger controller from configuration. Startup
/// is ordered so that a bad credential or spotter fails before any audio
/// device is opened:
///   credential -> spotter -> frame source -> event channel -> activation

use crate::activation::{ListenActivationClient, TcpActivationClient};
use crate::audio_source::{CaptureError, FrameSource, WavFrameSource};
use crate::capture::{CaptureConfig, CpalFrameSource};
use crate::channel::{BroadcastEventChannel, EventChannel, PublishError, TriggerEvent, UdpEventChannel};
use crate::config::{load_access_key, ConfigError, TriggerConfig};
use crate::controller::{TriggerController, TriggerError};
use crate::spotter::{build_spotter, SpotterError};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Queue depth of the in-process event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create keyword spotter: {0}")]
    Spotter(#[from] SpotterError),

    #[error("Failed to open audio source: {0}")]
    Capture(#[from] CaptureError),

    #[error("Failed to open event channel: {0}")]
    Events(#[from] PublishError),

    #[error("Failed to assemble trigger loop: {0}")]
    Trigger(#[from] TriggerError),
}

/// Inputs that come from the command line rather than the config file
#[derive(Debug, Clone)]
pub struct StartupOptions {
    /// Secrets file holding the engine access key
    pub secrets_path: PathBuf,

    /// Access key taken from the environment, preferred over the file
    pub access_key: Option<String>,

    /// Replay this WAV file instead of opening a capture device
    pub replay: Option<PathBuf>,
}

/// A started service
pub struct Service {
    pub controller: TriggerController,

    /// Receiver on the in-process event channel, when no UDP target is set
    pub events: Option<broadcast::Receiver<TriggerEvent>>,
}

/// Validate `config` and wire up every collaborator of the trigger loop
///
/// Nothing is read from the frame source here. Waiting for the activation
/// service is bounded and only warns.
pub async fn start(config: &TriggerConfig, options: &StartupOptions) -> Result<Service, StartupError> {
    config.validate()?;

    let access_key = load_access_key(&options.secrets_path, options.access_key.as_deref())?;
    let spotter = build_spotter(config.engine, &config.spotter_settings(access_key))?;

    let source: Box<dyn FrameSource> = match &options.replay {
        Some(path) => {
            info!("Replaying {}", path.display());
            Box::new(WavFrameSource::open(
                path,
                spotter.frame_length(),
                spotter.sample_rate(),
            )?)
        }
        None => Box::new(CpalFrameSource::open(&CaptureConfig {
            device_index: config.audio_device_index,
            frame_length: spotter.frame_length(),
            sample_rate: spotter.sample_rate(),
            buffer_frames: config.capture_buffer_frames,
            read_timeout: config.capture_timeout(),
        })?),
    };

    let (events, receiver) = match config.event_address {
        Some(address) => {
            let channel: Box<dyn EventChannel> =
                Box::new(UdpEventChannel::bind(config.wakeword_topic.clone(), address).await?);
            (channel, None)
        }
        None => {
            let in_process =
                BroadcastEventChannel::new(config.wakeword_topic.clone(), EVENT_CHANNEL_CAPACITY);
            let receiver = in_process.subscribe();
            let channel: Box<dyn EventChannel> = Box::new(in_process);
            (channel, Some(receiver))
        }
    };

    let activation = TcpActivationClient::new(
        config.activation_service.clone(),
        config.activation_address.clone(),
    );
    if let Err(e) = activation.wait_ready(config.service_wait_timeout()).await {
        warn!("{}; continuing, activations will fail until it is up", e);
    }

    let controller = TriggerController::new(
        config.controller_config(),
        source,
        spotter,
        events,
        Box::new(activation),
    )?;

    Ok(Service {
        controller,
        events: receiver,
    })
}
