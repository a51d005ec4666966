//! Audio device access
//!
//! Microphone input for the capture pipeline and speaker output for speech
//! playback, both on the default cpal devices.

mod capture;
mod playback;

pub use capture::{AudioCapture, CpalMicrophone, SAMPLE_RATE, samples_to_wav};
pub use playback::{
    AudioPlayback, DecodedAudio, PLAYBACK_SAMPLE_RATE, SpeakerOutput, decode_audio, resample,
};
