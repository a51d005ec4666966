//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use url::Url;

use crate::playback::SpeechOutput;
use crate::{Error, Result};

/// Poll cadence while waiting for a stream to drain
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Preferred output rate
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Input frames per resampler pass
const RESAMPLE_CHUNK: usize = 1024;

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Plays audio to the default output device
pub struct AudioPlayback {
    device: cpal::Device,
    config: StreamConfig,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// Prefers a 24kHz f32 config; devices that only expose their mix format
    /// are opened at their default rate. Callers resample to
    /// [`AudioPlayback::sample_rate`].
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let preferred = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            });

        let config = match preferred {
            Some(supported) => supported
                .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
                .config(),
            None => {
                let default = device
                    .default_output_config()
                    .map_err(|e| Error::Audio(e.to_string()))?;
                if default.sample_format() != cpal::SampleFormat::F32 {
                    return Err(Error::Audio("no suitable output config found".to_string()));
                }
                default.config()
            }
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { device, config })
    }

    /// Rate the output stream runs at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Play samples, blocking until they finish or `cancelled` returns true
    ///
    /// # Errors
    ///
    /// Returns error if the output stream fails
    pub fn play_blocking(&self, samples: Vec<f32>, cancelled: impl Fn() -> bool) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels.max(1));
        let sample_count = samples.len();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_cb = Arc::clone(&finished);
        let mut position = 0usize;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(position).copied().unwrap_or(0.0);
                        if position < samples.len() {
                            position += 1;
                        } else {
                            finished_cb.store(true, Ordering::Release);
                        }
                        frame.fill(sample);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms =
            (sample_count as u64 * 1000) / u64::from(self.config.sample_rate.0.max(1));
        let timeout = Duration::from_millis(duration_ms + 500);
        let start = std::time::Instant::now();

        while !finished.load(Ordering::Acquire) {
            if cancelled() {
                tracing::debug!("playback cancelled");
                return Ok(());
            }
            if start.elapsed() > timeout {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        Ok(())
    }
}

/// Decode a WAV or MP3 asset to mono samples
///
/// # Errors
///
/// Returns error if the bytes are neither valid WAV nor MP3
pub fn decode_audio(bytes: &[u8]) -> Result<DecodedAudio> {
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?
        }
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate.get_or_insert(frame.sample_rate);
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&pcm, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    let sample_rate = sample_rate
        .and_then(|rate| u32::try_from(rate).ok())
        .ok_or_else(|| Error::Audio("MP3 decode error: no frames".to_string()))?;

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Resample mono audio using rubato
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f64>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        2,
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected = usize::try_from(
        samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate.max(1)),
    )
    .unwrap_or(usize::MAX);
    let delay = resampler.output_delay();
    let mut output: Vec<f64> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut input: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        input.resize(RESAMPLE_CHUNK, 0.0);
        let result = resampler
            .process(&[input], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    // Flush the filter delay with silence
    let silence = vec![0.0f64; RESAMPLE_CHUNK];
    while output.len() < expected + delay {
        let result = resampler
            .process(&[silence.as_slice()], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output
        .iter()
        .skip(delay)
        .take(expected)
        .map(|&s| s as f32)
        .collect())
}

/// Average interleaved channels down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Speech output on the default speakers
///
/// Assets are fetched over HTTP, resolving relative URLs against the server.
/// Each `play` call takes a new ticket; `stop` invalidates every ticket so a
/// superseded playback thread ends at its next poll.
#[derive(Debug, Clone)]
pub struct SpeakerOutput {
    client: reqwest::Client,
    base_url: Url,
    ticket: Arc<AtomicU64>,
}

impl SpeakerOutput {
    /// Create an output resolving asset URLs against `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            ticket: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Resolve a peer-supplied asset URL, which may be relative to the server
    fn resolve(&self, url: &str) -> Result<Url> {
        Ok(self.base_url.join(url)?)
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.client.get(url.clone()).send().await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechOutput for SpeakerOutput {
    async fn play(&self, url: &str) -> Result<()> {
        let ticket = self.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let url = self.resolve(url)?;

        tracing::debug!(url = %url, "fetching speech audio");
        let bytes = self.fetch(&url).await?;
        let audio = decode_audio(&bytes)?;

        let current = Arc::clone(&self.ticket);
        tokio::task::spawn_blocking(move || {
            let playback = AudioPlayback::new()?;
            let samples = resample(&audio.samples, audio.sample_rate, playback.sample_rate())?;
            playback.play_blocking(samples, || current.load(Ordering::SeqCst) != ticket)
        })
        .await
        .map_err(|e| Error::Audio(e.to_string()))?
    }

    fn stop(&self) {
        self.ticket.fetch_add(1, Ordering::SeqCst);
    }
}
