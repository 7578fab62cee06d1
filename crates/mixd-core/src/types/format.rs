//! PCM sample format and stream geometry types.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Nanoseconds in one second.
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Highest sample rate any endpoint accepts.
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Interleaved PCM sample encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8-bit, silence at 128.
    U8,
    /// Signed 16-bit little endian.
    #[default]
    S16Le,
    /// Signed 24-bit little endian, packed in 3 bytes.
    S24Le,
    /// Signed 32-bit little endian.
    S32Le,
    /// 32-bit float little endian, nominal range [-1.0, 1.0].
    F32Le,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    pub const fn bytes_per_sample(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le | Self::F32Le => 4,
        }
    }

    /// Short lowercase name, as used in dumps and config files.
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16Le => "s16le",
            Self::S24Le => "s24le",
            Self::S32Le => "s32le",
            Self::F32Le => "f32le",
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Geometry of a PCM stream: rate, channel count and sample encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StreamInfo {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample encoding.
    pub format: SampleFormat,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            format: SampleFormat::S16Le,
        }
    }
}

impl StreamInfo {
    pub const fn new(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }

    /// Bytes occupied by one frame (one sample per channel).
    pub const fn bytes_per_frame(&self) -> u32 {
        self.channels as u32 * self.format.bytes_per_sample()
    }

    /// Duration of `frames` frames in nanoseconds.
    pub const fn frames_to_nanos(&self, frames: u64) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as i64) * NANOS_PER_SECOND / self.sample_rate as i64
    }

    /// Reject geometry no endpoint can serve.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(Error::invalid_param(format!(
                "sample rate {} outside (0, {MAX_SAMPLE_RATE}]",
                self.sample_rate
            )));
        }
        if self.channels == 0 {
            return Err(Error::invalid_param("channel count is zero"));
        }
        Ok(())
    }
}

impl std::fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch/{}", self.sample_rate, self.channels, self.format)
    }
}
