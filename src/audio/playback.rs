//! Audio output
//!
//! An [`AudioSink`] is where the ingest task hands each new [`RenderCallback`].
//! Attaching replaces whatever was playing: a reconfiguration never resizes
//! storage under a running callback, it swaps the whole output stream.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::resolve_output_device;
use crate::audio::render::RenderCallback;
use crate::error::AudioError;
use crate::protocol::StreamFormat;

/// Destination for rendered audio
pub trait AudioSink: Send {
    /// Start driving `callback` at the format's rate, replacing any previous one
    fn attach(&mut self, format: StreamFormat, callback: RenderCallback) -> Result<(), AudioError>;

    /// Stop rendering and release the output
    fn detach(&mut self);
}

/// Builds a fresh sink for each client session
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn AudioSink> + Send + Sync>;

/// Poll period of the thread that keeps a stream alive
const STREAM_POLL: Duration = Duration::from_millis(10);

/// cpal-backed output sink
///
/// cpal streams are not `Send`, so each stream lives on its own thread for as
/// long as it plays.
pub struct AudioPlayback {
    device_id: Option<String>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Factory for [`StreamClient`](crate::session::StreamClient)
    pub fn factory(device_id: Option<String>) -> SinkFactory {
        Arc::new(move || Box::new(AudioPlayback::new(device_id.clone())) as Box<dyn AudioSink>)
    }
}

impl AudioSink for AudioPlayback {
    fn attach(&mut self, format: StreamFormat, mut callback: RenderCallback) -> Result<(), AudioError> {
        self.detach();

        let device = resolve_output_device(self.device_id.as_deref())?;
        if !device.supports(format.sample_rate, format.channels) {
            tracing::warn!(
                device = %device.name,
                sample_rate = format.sample_rate,
                channels = format.channels,
                "Device does not advertise f32 output at this format"
            );
        }

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let device_name = device.name.clone();

        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_output_thread(running.clone(), error_rx, move || {
            let stream = device
                .into_inner()
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callback.render(data);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamError(format!("build output stream: {}", e)))?;
            stream
                .play()
                .map_err(|e| AudioError::StreamError(format!("start output stream: {}", e)))?;
            Ok(stream)
        })?;

        tracing::info!(
            device = %device_name,
            sample_rate = format.sample_rate,
            channels = format.channels,
            "Output stream attached"
        );
        self.running = running;
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn detach(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Output stream detached");
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Build a stream on a dedicated thread and keep it alive until `running`
/// clears, logging errors the stream reports meanwhile.
///
/// Returns once the stream is playing, or with the error that kept it from
/// starting.
fn spawn_output_thread<S, F>(
    running: Arc<AtomicBool>,
    errors: Receiver<AudioError>,
    build: F,
) -> Result<JoinHandle<()>, AudioError>
where
    F: FnOnce() -> Result<S, AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

    let handle = thread::Builder::new()
        .name("playback-render".to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while running.load(Ordering::Relaxed) {
                match errors.recv_timeout(STREAM_POLL) {
                    Ok(e) => tracing::warn!(error = %e, "Output stream error"),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(STREAM_POLL),
                }
            }
            // Dropping the stream stops playback
            drop(stream);
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(AudioError::StreamError("output thread exited before starting".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Guard(Arc<AtomicBool>);

    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_build_failure_surfaces() {
        let (_error_tx, error_rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let result = spawn_output_thread::<(), _>(running, error_rx, || {
            Err(AudioError::StreamError("no f32 config".to_string()))
        });
        assert!(matches!(result, Err(AudioError::StreamError(msg)) if msg == "no f32 config"));
    }

    #[test]
    fn test_panicking_build_surfaces() {
        let (_error_tx, error_rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let result = spawn_output_thread::<(), _>(running, error_rx, || panic!("driver crashed"));
        assert!(matches!(result, Err(AudioError::StreamError(_))));
    }

    #[test]
    fn test_stream_lives_until_stopped() {
        let (error_tx, error_rx) = bounded(4);
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Guard(dropped.clone());

        let handle = spawn_output_thread(running.clone(), error_rx, move || Ok(guard)).unwrap();
        // Runtime errors are consumed by the thread, not fatal
        error_tx.send(AudioError::StreamError("xrun".to_string())).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!dropped.load(Ordering::SeqCst));

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
