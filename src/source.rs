//! Upstream side: where frames and wall clock time come from.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::error::{ConfigError, Result};
use crate::timestamp::Timestamp;
use crate::Sample;

/// Interleaved frames read in one go, with the source's own idea of when
/// the first frame was taken and at what rate.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub channels: usize,
    pub samples: Vec<Sample>,
    /// Time of the first frame, if the source knows it.
    pub timestamp: Timestamp,
    pub srcal: f64,
}

impl FrameBatch {
    pub fn new(channels: usize) -> Self {
        Self { channels, samples: Vec::new(), timestamp: Timestamp::NONE, srcal: 1.0 }
    }

    pub fn len(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn frames(&self) -> std::slice::ChunksExact<'_, Sample> {
        self.samples.chunks_exact(self.channels.max(1))
    }
}

impl Default for FrameBatch {
    fn default() -> Self {
        Self::new(1)
    }
}

pub trait FrameSource {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// True for a real-time capture paced by its own free-running clock.
    fn is_live(&self) -> bool {
        false
    }

    /// Replace the contents of `batch` with the next frames. Returns the
    /// number of frames read, or `None` at end of stream.
    fn read_batch(&mut self, batch: &mut FrameBatch) -> Result<Option<usize>>;
}

pub trait WallClock {
    fn now(&self) -> Timestamp;
}

/// The system real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Little-endian PCM sample encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    /// 24 bits in 3 bytes.
    S24Packed,
    /// 24 bits in the low 3 bytes of 4.
    S24In32,
    S32,
}

impl SampleFormat {
    pub fn from_bits(bits: u32, packed24: bool) -> std::result::Result<Self, ConfigError> {
        match bits {
            8 => Ok(SampleFormat::U8),
            16 => Ok(SampleFormat::S16),
            24 if packed24 => Ok(SampleFormat::S24Packed),
            24 => Ok(SampleFormat::S24In32),
            32 => Ok(SampleFormat::S32),
            _ => Err(ConfigError::InvalidBits(bits)),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24Packed => 3,
            SampleFormat::S24In32 | SampleFormat::S32 => 4,
        }
    }

    /// Decode one sample to the range ±1.
    pub fn decode(self, bytes: &[u8]) -> Sample {
        match self {
            SampleFormat::U8 => (bytes[0] as Sample - 127.0) / 128.0,
            SampleFormat::S16 => LittleEndian::read_i16(bytes) as Sample / i16::MAX as Sample,
            SampleFormat::S24Packed => LittleEndian::read_i24(bytes) as Sample / 8388607.0,
            SampleFormat::S24In32 => {
                LittleEndian::read_i24(&bytes[..3]) as Sample / 8388607.0
            }
            SampleFormat::S32 => LittleEndian::read_i32(bytes) as Sample / i32::MAX as Sample,
        }
    }
}

/// Headerless interleaved PCM from any reader, such as a sound card
/// capture piped to stdin.
pub struct RawFrameSource<R: Read> {
    reader: R,
    format: SampleFormat,
    channels: usize,
    sample_rate: u32,
    gain: Sample,
    live: bool,
    frames_per_read: usize,
    buffer: Vec<u8>,
    /// Bytes of an incomplete frame left over from the last read.
    pending: usize,
}

impl<R: Read> RawFrameSource<R> {
    pub fn new(
        reader: R,
        format: SampleFormat,
        channels: usize,
        sample_rate: u32,
    ) -> std::result::Result<Self, ConfigError> {
        if channels == 0 {
            return Err(ConfigError::InvalidChannels(channels));
        }
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        Ok(Self {
            reader,
            format,
            channels,
            sample_rate,
            gain: 1.0,
            live: false,
            frames_per_read: 1024,
            buffer: Vec::new(),
            pending: 0,
        })
    }

    pub fn with_gain(mut self, gain: Sample) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn with_frames_per_read(mut self, frames: usize) -> Self {
        self.frames_per_read = frames.max(1);
        self
    }

    fn frame_bytes(&self) -> usize {
        self.format.bytes() * self.channels
    }
}

impl<R: Read> FrameSource for RawFrameSource<R> {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn read_batch(&mut self, batch: &mut FrameBatch) -> Result<Option<usize>> {
        let frame_bytes = self.frame_bytes();
        self.buffer.resize(self.frames_per_read * frame_bytes, 0);

        let count = self.reader.read(&mut self.buffer[self.pending..])?;
        if count == 0 {
            if self.pending > 0 {
                warn!(bytes = self.pending, "discarding incomplete final frame");
            }
            return Ok(None);
        }
        let available = self.pending + count;
        let frames = available / frame_bytes;

        batch.channels = self.channels;
        batch.timestamp = Timestamp::NONE;
        batch.srcal = 1.0;
        batch.samples.clear();
        let sample_bytes = self.format.bytes();
        batch.samples.extend(
            self.buffer[..frames * frame_bytes]
                .chunks_exact(sample_bytes)
                .map(|b| self.format.decode(b) * self.gain),
        );

        self.buffer.copy_within(frames * frame_bytes..available, 0);
        self.pending = available - frames * frame_bytes;
        Ok(Some(frames))
    }
}
