/// Wake-word trigger service binary
///
/// Listens for "Hey Alfred" and asks the speech listener to start.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wakeword_trigger::capture::list_input_devices;
use wakeword_trigger::config::default_secrets_path;
use wakeword_trigger::{init_logging, start, Service, StartupOptions, TriggerConfig, TriggerEvent};

#[derive(Parser)]
#[command(name = "wakeword-trigger")]
#[command(about = "Wake-word trigger for the speech listener", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "WAKEWORD_CONFIG")]
    config: Option<PathBuf>,

    /// Secrets file holding PORCUPINE_ACCESS_KEY
    #[arg(long, env = "WAKEWORD_SECRETS")]
    secrets: Option<PathBuf>,

    #[arg(long, env = "PORCUPINE_ACCESS_KEY", hide = true, hide_env_values = true)]
    access_key: Option<String>,

    /// Capture device index (overrides the config file)
    #[arg(long)]
    device: Option<usize>,

    /// Replay a mono 16-bit WAV file instead of capturing
    #[arg(long)]
    replay: Option<PathBuf>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();

    if cli.list_devices {
        match list_input_devices() {
            Ok(devices) => {
                for (index, name) in devices.iter().enumerate() {
                    println!("{:>3}  {}", index, name);
                }
            }
            Err(e) => {
                error!("Failed to list input devices: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Wake-word trigger stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Starting wake-word trigger");

    let mut config = match &cli.config {
        Some(path) => TriggerConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => TriggerConfig::default(),
    };
    if let Some(device) = cli.device {
        config.audio_device_index = device;
    }

    let options = StartupOptions {
        secrets_path: match cli.secrets {
            Some(path) => path,
            None => default_secrets_path()?,
        },
        access_key: cli.access_key,
        replay: cli.replay,
    };

    let Service {
        mut controller,
        events,
    } = start(&config, &options).await?;

    if let Some(receiver) = events {
        tokio::spawn(echo_events(config.wakeword_topic.clone(), receiver));
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current frame");
            signal.cancel();
        }
    });

    let result = controller.run(shutdown).await;
    controller.close();

    let stats = controller.stats();
    info!(
        "Frames: {}, detections: {}, publish failures: {}, activation failures: {}, capture retries: {}, dropped samples: {}",
        stats.frames_processed,
        stats.detections,
        stats.publish_failures,
        stats.activation_failures,
        stats.capture_retries,
        stats.dropped_samples
    );

    result.context("Trigger loop failed")
}

/// Write every trigger event to stdout as a JSON line
async fn echo_events(topic: String, mut events: broadcast::Receiver<TriggerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.to_json() {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode event on {}: {}", topic, e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event echo on {} missed {} events", topic, missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
