//! Audio capture from microphone

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};

use crate::capture::{InputStream, MicrophoneSource};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Captures mono audio from the default input device
pub struct AudioCapture {
    device: cpal::Device,
    config: StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device
    ///
    /// Prefers a mono 16kHz config; multi-channel devices are downmixed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if no usable input device exists
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

        let supports_rate = |c: &SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        };
        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .filter(|c| supports_rate(c) && c.sample_format() == cpal::SampleFormat::F32)
            .collect();

        let supported_config = configs
            .iter()
            .find(|c| c.channels() == 1)
            .or_else(|| configs.iter().min_by_key(|c| c.channels()))
            .cloned()
            .ok_or_else(|| {
                Error::DeviceUnavailable("no suitable audio config found".to_string())
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let channels = usize::from(self.config.channels.max(1));
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / channels as f32;

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        if channels == 1 {
                            buf.extend_from_slice(data);
                        } else {
                            buf.extend(
                                data.chunks(channels)
                                    .map(|frame| frame.iter().sum::<f32>() * scale),
                            );
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Get captured audio buffer and clear it
    ///
    /// Returns the audio samples captured since last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        take_samples(&self.buffer)
    }

    /// Shared handle to the sample buffer the stream writes into
    #[must_use]
    pub fn buffer_handle(&self) -> Arc<Mutex<Vec<f32>>> {
        Arc::clone(&self.buffer)
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

fn take_samples(buffer: &Mutex<Vec<f32>>) -> Vec<f32> {
    buffer
        .lock()
        .map(|mut buf| std::mem::take(&mut *buf))
        .unwrap_or_default()
}

/// Microphone backed by the default cpal input device
///
/// A cpal stream cannot leave the thread that built it, so each capture runs
/// its stream on a dedicated thread that lives until the capture is stopped.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn open(&self) -> Result<Box<dyn InputStream>> {
        let (opened_tx, opened_rx) = tokio::sync::oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("companion-mic".to_string())
            .spawn(move || {
                let mut capture = match AudioCapture::new().and_then(|mut c| c.start().map(|()| c))
                {
                    Ok(capture) => capture,
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                let _ = opened_tx.send(Ok((capture.buffer_handle(), capture.sample_rate())));

                // Returns on stop or when the handle is dropped
                let _ = stop_rx.recv();
                capture.stop();
            })
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        let (buffer, sample_rate) = opened_rx
            .await
            .map_err(|_| Error::DeviceUnavailable("capture thread exited".to_string()))??;

        Ok(Box::new(CpalInputStream {
            buffer,
            sample_rate,
            stop: Some(stop_tx),
        }))
    }
}

struct CpalInputStream {
    buffer: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    stop: Option<std::sync::mpsc::Sender<()>>,
}

impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn drain(&mut self) -> Vec<f32> {
        take_samples(&self.buffer)
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert f32 samples to 16-bit PCM WAV bytes for upload
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_encoding() {
        let samples: Vec<f32> = (0..1600).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 1600);
    }

    #[test]
    fn test_wav_clamps_out_of_range_samples() {
        let wav = samples_to_wav(&[2.0, -2.0], SAMPLE_RATE).unwrap();
        let mut reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![32767, -32768]);
    }

    #[test]
    fn test_take_samples_drains() {
        let buffer = Mutex::new(vec![0.1, 0.2]);
        assert_eq!(take_samples(&buffer), vec![0.1, 0.2]);
        assert!(take_samples(&buffer).is_empty());
    }
}
