/// Microphone capture module
///
/// Streams 16-bit mono audio from a cpal input device into a lock-free ring
/// buffer and hands it out in fixed-length frames. The cpal stream lives on
/// a dedicated audio thread; the reader side only touches the ring consumer.
///
/// When the reader falls behind, the ring fills up and new samples are
/// dropped. Dropped samples are counted but never reported as errors.

use crate::audio_source::{AudioFrame, AudioSample, CaptureError, FrameSource};
use async_trait::async_trait;
use cache_padded::CachePadded;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Capture parameters for a live input device
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Index into the host's input device list
    pub device_index: usize,

    /// Samples per frame (dictated by the spotter)
    pub frame_length: usize,

    /// Sample rate in Hz (dictated by the spotter)
    pub sample_rate: u32,

    /// Ring capacity, in frames
    pub buffer_frames: usize,

    /// Longest wait for a frame before the read counts as interrupted
    pub read_timeout: Duration,
}

/// State shared between the audio thread and the reader
struct CaptureShared {
    notify: Notify,
    dropped_samples: CachePadded<AtomicU64>,
    stream_error: Mutex<Option<String>>,
}

impl CaptureShared {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            dropped_samples: CachePadded::new(AtomicU64::new(0)),
            stream_error: Mutex::new(None),
        }
    }

    fn report_error(&self, reason: String) {
        if let Ok(mut slot) = self.stream_error.lock() {
            *slot = Some(reason);
        }
        self.notify.notify_one();
    }

    fn take_error(&self) -> Option<String> {
        self.stream_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Producer half of the capture ring, owned by the audio callback
pub struct CaptureWriter {
    producer: RingProducer,
    shared: Arc<CaptureShared>,
    scratch: Vec<AudioSample>,
}

impl CaptureWriter {
    /// Push samples into the ring, dropping whatever does not fit
    pub fn push(&mut self, samples: &[AudioSample]) -> usize {
        let written = self.producer.push_slice(samples);

        if written < samples.len() {
            let dropped = (samples.len() - written) as u64;
            self.shared
                .dropped_samples
                .fetch_add(dropped, Ordering::Relaxed);
        }

        self.shared.notify.notify_one();
        written
    }

    /// Convert f32 samples in [-1.0, 1.0] to 16-bit PCM and push them
    pub fn push_f32(&mut self, samples: &[f32]) -> usize {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend(
            samples
                .iter()
                .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as AudioSample),
        );

        let written = self.push(&scratch);
        self.scratch = scratch;
        written
    }

    /// Record a stream error; the next read reports it as an interruption
    pub fn report_error(&self, reason: impl Into<String>) {
        self.shared.report_error(reason.into());
    }
}

/// Handle on the thread keeping the cpal stream alive
struct CaptureWorker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Frame source reading from a live input device
pub struct CpalFrameSource {
    consumer: RingConsumer,
    shared: Arc<CaptureShared>,
    frame_length: usize,
    read_timeout: Duration,
    worker: Option<CaptureWorker>,
    closed: bool,
}

impl CpalFrameSource {
    /// Open the input device at `config.device_index` and start capturing
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        if config.frame_length == 0 {
            return Err(CaptureError::DeviceUnavailable(
                "frame length must be greater than 0".to_string(),
            ));
        }

        let capacity = config.frame_length * config.buffer_frames.max(2);
        let (mut source, writer) = Self::with_ring(config.frame_length, capacity, config.read_timeout);

        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, CaptureError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let error_shared = Arc::clone(&source.shared);
        let thread_config = config.clone();

        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(&thread_config, writer, error_shared) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until the source is closed or dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Audio capture thread exiting");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(format!("audio thread: {}", e)))?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(CaptureError::DeviceUnavailable(
                    "audio thread exited during startup".to_string(),
                ));
            }
        };

        info!(
            "Capturing from input device {} ({}) at {} Hz, frame length {}",
            config.device_index, device_name, config.sample_rate, config.frame_length
        );

        source.worker = Some(CaptureWorker { stop_tx, handle });
        Ok(source)
    }

    /// Build a source over an empty ring with no device attached
    ///
    /// The returned writer is the producer side; the live capture path hands
    /// it to the cpal callback.
    pub fn with_ring(
        frame_length: usize,
        capacity: usize,
        read_timeout: Duration,
    ) -> (Self, CaptureWriter) {
        debug!("Creating capture ring with capacity: {} samples", capacity);

        let (producer, consumer) = RingBuffer::new(capacity).split();
        let shared = Arc::new(CaptureShared::new());

        let writer = CaptureWriter {
            producer,
            shared: Arc::clone(&shared),
            scratch: Vec::with_capacity(frame_length),
        };

        let source = Self {
            consumer,
            shared,
            frame_length,
            read_timeout,
            worker: None,
            closed: false,
        };

        (source, writer)
    }

    /// Samples waiting in the ring
    pub fn buffered_samples(&self) -> usize {
        self.consumer.occupied_len()
    }
}

#[async_trait]
impl FrameSource for CpalFrameSource {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    async fn read_frame(&mut self) -> Result<AudioFrame, CaptureError> {
        loop {
            if self.closed {
                return Err(CaptureError::Closed);
            }

            if let Some(reason) = self.shared.take_error() {
                return Err(CaptureError::CaptureInterrupted(reason));
            }

            if self.consumer.occupied_len() >= self.frame_length {
                let mut samples = vec![0; self.frame_length];
                let read = self.consumer.pop_slice(&mut samples);
                debug_assert_eq!(read, self.frame_length);
                return Ok(AudioFrame::new(samples));
            }

            if timeout(self.read_timeout, self.shared.notify.notified())
                .await
                .is_err()
            {
                return Err(CaptureError::CaptureInterrupted(format!(
                    "no audio received for {} ms",
                    self.read_timeout.as_millis()
                )));
            }
        }
    }

    fn discard_pending(&mut self) -> usize {
        self.consumer.clear()
    }

    fn dropped_samples(&self) -> u64 {
        self.shared.dropped_samples.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.handle.join().is_err() {
                warn!("Audio capture thread panicked");
            }
        }

        let dropped = self.dropped_samples();
        if dropped > 0 {
            warn!("Capture closed, {} samples were dropped on overflow", dropped);
        } else {
            debug!("Capture closed");
        }
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of the host's input devices, in index order
pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    Ok(devices
        .map(|d| d.name().unwrap_or_else(|_| "<unknown>".to_string()))
        .collect())
}

fn build_stream(
    config: &CaptureConfig,
    mut writer: CaptureWriter,
    shared: Arc<CaptureShared>,
) -> Result<(cpal::Stream, String), CaptureError> {
    let host = cpal::default_host();
    let device: Device = host
        .input_devices()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
        .nth(config.device_index)
        .ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "no input device at index {}",
                config.device_index
            ))
        })?;

    let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
    let rate = SampleRate(config.sample_rate);

    let supported = device
        .supported_input_configs()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", name, e)))?
        .filter(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .filter(|c| matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .max_by_key(|c| c.sample_format() == SampleFormat::I16)
        .ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "{}: no mono 16-bit or float config at {} Hz",
                name, config.sample_rate
            ))
        })?;

    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.with_sample_rate(rate).config();

    let err_fn = move |err: cpal::StreamError| {
        error!("Audio stream error: {}", err);
        shared.report_error(err.to_string());
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                writer.push(data);
            },
            err_fn,
            None,
        ),
        _ => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                writer.push_f32(data);
            },
            err_fn,
            None,
        ),
    }
    .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", name, e)))?;

    stream
        .play()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", name, e)))?;

    debug!("Input stream started on {} ({:?})", name, sample_format);
    Ok((stream, name))
}
