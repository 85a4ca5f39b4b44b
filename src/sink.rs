//! Downstream side: assembling stamped frames into blocks and writing
//! them out.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, trace};

use crate::configuration::{MAX_BLOCK_SIZE, MAX_CHANNELS};
use crate::error::{Error, Result};
use crate::source::{FrameBatch, FrameSource};
use crate::timestamp::Timestamp;
use crate::Sample;

/// Receiver of disciplined frames.
pub trait FrameSink {
    /// Declare the time of the next frame and the rate of those following.
    fn set_output_timebase(&mut self, timebase: Timestamp, srcal: f64) -> Result<()>;
    fn emit_frame(&mut self, frame: &[Sample]) -> Result<()>;
    /// True when the next frame will start a new block.
    fn at_block_start(&self) -> bool;
    /// Pass on anything buffered. Called at end of stream.
    fn flush(&mut self) -> Result<()>;
}

/// Frames sharing one timestamp, the time of the first frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub timestamp: Timestamp,
    pub srcal: f64,
    pub sample_rate: u32,
    pub channels: usize,
    /// Interleaved samples.
    pub samples: Vec<Sample>,
}

impl Block {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn frame(&self, index: usize) -> &[Sample] {
        &self.samples[index * self.channels..(index + 1) * self.channels]
    }

    /// Time of frame `index` within the block.
    pub fn frame_time(&self, index: usize) -> Timestamp {
        self.timestamp.add(index as f64 / (self.srcal * self.sample_rate as f64))
    }

    /// Samples of one channel.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = Sample> + '_ {
        self.samples.iter().skip(channel).step_by(self.channels.max(1)).copied()
    }
}

/// Destination for completed blocks.
pub trait BlockOutput {
    fn write_block(&mut self, block: &Block) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Blocks collected in memory.
pub type MemoryBlocks = Vec<Block>;

impl BlockOutput for Vec<Block> {
    fn write_block(&mut self, block: &Block) -> Result<()> {
        self.push(block.clone());
        Ok(())
    }
}

/// Assembles frames into fixed-size timestamped blocks.
pub struct BlockSink<O> {
    output: O,
    block_size: usize,
    /// Block being filled. Its timestamp is set when the first frame
    /// arrives.
    block: Block,
    timebase: Option<Timestamp>,
    /// Frames since `timebase` was last set.
    nft: u64,
    frames_emitted: u64,
    blocks_written: u64,
}

impl<O: BlockOutput> BlockSink<O> {
    pub fn new(output: O, channels: usize, sample_rate: u32, block_size: usize) -> Self {
        Self {
            output,
            block_size: block_size.max(1),
            block: Block {
                timestamp: Timestamp::NONE,
                srcal: 1.0,
                sample_rate,
                channels,
                samples: Vec::with_capacity(block_size * channels),
            },
            timebase: None,
            nft: 0,
            frames_emitted: 0,
            blocks_written: 0,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn into_output(self) -> O {
        self.output
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    fn release(&mut self) -> Result<()> {
        if self.block.samples.is_empty() {
            return Ok(());
        }
        trace!(timestamp = %self.block.timestamp, frames = self.block.frames(), "block");
        self.output.write_block(&self.block)?;
        self.block.samples.clear();
        self.blocks_written += 1;
        Ok(())
    }

    fn current_time(&self) -> Option<Timestamp> {
        let rate = self.block.srcal * self.block.sample_rate as f64;
        self.timebase.map(|t| t.add(self.nft as f64 / rate))
    }
}

impl<O: BlockOutput> FrameSink for BlockSink<O> {
    fn set_output_timebase(&mut self, timebase: Timestamp, srcal: f64) -> Result<()> {
        if let Some(current) = self.current_time() {
            let shift = timebase.diff(current);
            if !self.block.samples.is_empty() && shift.abs() > 1.0 / self.block.sample_rate as f64 {
                debug!(shift_ms = shift * 1e3, "timebase jump, releasing short block");
                self.release()?;
            }
        }
        self.timebase = Some(timebase);
        self.block.srcal = srcal;
        self.nft = 0;
        Ok(())
    }

    fn emit_frame(&mut self, frame: &[Sample]) -> Result<()> {
        if self.block.samples.is_empty() {
            self.block.timestamp = self.current_time().unwrap_or(Timestamp::NONE);
        }
        self.block.samples.extend_from_slice(&frame[..self.block.channels]);
        self.nft += 1;
        self.frames_emitted += 1;
        if self.block.frames() >= self.block_size {
            self.release()?;
        }
        Ok(())
    }

    fn at_block_start(&self) -> bool {
        self.block.samples.is_empty()
    }

    fn flush(&mut self) -> Result<()> {
        self.release()?;
        self.output.flush()
    }
}

const BLOCK_MAGIC: u32 = 0x564c_4643;

/// Writes blocks as a little-endian binary stream: a header of magic,
/// channels, sample rate, frame count, whole seconds, nanoseconds and
/// srcal, then the interleaved samples as `f32`.
pub struct BlockWriter<W: Write> {
    writer: W,
    buffer: Vec<u8>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, buffer: Vec::new() }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> BlockOutput for BlockWriter<W> {
    fn write_block(&mut self, block: &Block) -> Result<()> {
        let mut secs = block.timestamp.secs();
        let mut nanos = (block.timestamp.frac() * 1e9).round() as u32;
        if nanos >= 1_000_000_000 {
            nanos -= 1_000_000_000;
            secs += 1;
        }

        self.buffer.clear();
        self.buffer.write_u32::<LittleEndian>(BLOCK_MAGIC)?;
        self.buffer.write_u32::<LittleEndian>(block.channels as u32)?;
        self.buffer.write_u32::<LittleEndian>(block.sample_rate)?;
        self.buffer.write_u32::<LittleEndian>(block.frames() as u32)?;
        self.buffer.write_i64::<LittleEndian>(secs)?;
        self.buffer.write_u32::<LittleEndian>(nanos)?;
        self.buffer.write_f64::<LittleEndian>(block.srcal)?;
        for &sample in &block.samples {
            self.buffer.write_f32::<LittleEndian>(sample as f32)?;
        }
        self.writer.write_all(&self.buffer)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

struct BlockHeader {
    channels: usize,
    sample_rate: u32,
    frames: usize,
    timestamp: Timestamp,
    srcal: f64,
}

/// Reads a stream written by [`BlockWriter`]. Each block becomes one
/// batch.
pub struct BlockReader<R: Read> {
    reader: R,
    channels: usize,
    sample_rate: u32,
    pending: Option<BlockHeader>,
    buffer: Vec<u8>,
}

impl<R: Read> BlockReader<R> {
    /// Reads the first header to learn the stream format.
    pub fn new(mut reader: R) -> Result<Self> {
        let header = read_header(&mut reader)?
            .ok_or_else(|| Error::BlockFormat("empty stream".to_string()))?;
        Ok(Self {
            reader,
            channels: header.channels,
            sample_rate: header.sample_rate,
            pending: Some(header),
            buffer: Vec::new(),
        })
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<Option<BlockHeader>> {
    let magic = match reader.read_u32::<LittleEndian>() {
        Ok(magic) => magic,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if magic != BLOCK_MAGIC {
        return Err(Error::BlockFormat(format!("bad magic {:#010x}", magic)));
    }
    let channels = reader.read_u32::<LittleEndian>()? as usize;
    let sample_rate = reader.read_u32::<LittleEndian>()?;
    let frames = reader.read_u32::<LittleEndian>()? as usize;
    let secs = reader.read_i64::<LittleEndian>()?;
    let nanos = reader.read_u32::<LittleEndian>()?;
    let srcal = reader.read_f64::<LittleEndian>()?;
    if channels == 0 || channels > MAX_CHANNELS || sample_rate == 0 {
        return Err(Error::BlockFormat(format!("{} channels at {} Hz", channels, sample_rate)));
    }
    if frames > MAX_BLOCK_SIZE {
        return Err(Error::BlockFormat(format!("{} frames in one block", frames)));
    }
    Ok(Some(BlockHeader {
        channels,
        sample_rate,
        frames,
        timestamp: Timestamp::compose(secs, nanos as f64 * 1e-9),
        srcal,
    }))
}

impl<R: Read> FrameSource for BlockReader<R> {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_batch(&mut self, batch: &mut FrameBatch) -> Result<Option<usize>> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match read_header(&mut self.reader)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };
        if header.channels != self.channels || header.sample_rate != self.sample_rate {
            return Err(Error::BlockFormat(format!(
                "format changed to {} channels at {} Hz",
                header.channels, header.sample_rate
            )));
        }

        let bytes = header
            .frames
            .checked_mul(header.channels)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                Error::BlockFormat(format!(
                    "{} frames of {} channels",
                    header.frames, header.channels
                ))
            })?;
        self.buffer.resize(bytes, 0);
        self.reader.read_exact(&mut self.buffer)?;
        batch.channels = header.channels;
        batch.timestamp = header.timestamp;
        batch.srcal = header.srcal;
        batch.samples.clear();
        batch
            .samples
            .extend(self.buffer.chunks_exact(4).map(|b| LittleEndian::read_f32(b) as Sample));
        Ok(Some(header.frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;

    fn memory_sink(block_size: usize) -> BlockSink<MemoryBlocks> {
        BlockSink::new(MemoryBlocks::new(), 2, 8000, block_size)
    }

    #[test]
    fn test_blocks_stamped_from_timebase() {
        let mut sink = memory_sink(4);
        sink.set_output_timebase(Timestamp::from_secs(T0), 1.0).unwrap();
        for i in 0..10 {
            sink.emit_frame(&[i as Sample, -(i as Sample)]).unwrap();
        }
        sink.flush().unwrap();
        let blocks = sink.into_output();
        assert_eq!(blocks.iter().map(Block::frames).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(blocks[1].timestamp, Timestamp::from_secs(T0).add(4.0 / 8000.0));
        assert_eq!(blocks[2].frame(1), &[9.0, -9.0]);
        assert_eq!(blocks[2].channel(1).collect::<Vec<_>>(), vec![-8.0, -9.0]);
    }

    #[test]
    fn test_short_block_on_timebase_jump() {
        let mut sink = memory_sink(8);
        let t0 = Timestamp::from_secs(T0);
        sink.set_output_timebase(t0, 1.0).unwrap();
        for _ in 0..3 {
            sink.emit_frame(&[0.0, 0.0]).unwrap();
        }
        // consistent with the frames so far, nothing released
        sink.set_output_timebase(t0.add(3.0 / 8000.0), 1.0).unwrap();
        assert_eq!(sink.blocks_written(), 0);
        sink.emit_frame(&[0.0, 0.0]).unwrap();
        // a jump of 10 ms releases the 4 frames as a short block
        sink.set_output_timebase(t0.add(4.0 / 8000.0 + 0.01), 1.0).unwrap();
        assert_eq!(sink.blocks_written(), 1);
        sink.emit_frame(&[0.0, 0.0]).unwrap();
        sink.flush().unwrap();
        let blocks = sink.into_output();
        assert_eq!(blocks[0].frames(), 4);
        assert_eq!(blocks[1].timestamp, t0.add(4.0 / 8000.0 + 0.01));
    }

    #[test]
    fn test_srcal_applies_to_frame_times() {
        let mut sink = memory_sink(100);
        sink.set_output_timebase(Timestamp::from_secs(T0), 1.0005).unwrap();
        for _ in 0..150 {
            sink.emit_frame(&[0.0, 0.0]).unwrap();
        }
        sink.flush().unwrap();
        let blocks = sink.into_output();
        let expected = 100.0 / (8000.0 * 1.0005);
        assert!((blocks[1].timestamp.diff(blocks[0].timestamp) - expected).abs() < 1e-12);
        assert!((blocks[0].frame_time(100).diff(blocks[1].timestamp)).abs() < 1e-12);
    }

    #[test]
    fn test_stream_round_trip() {
        let mut writer = BlockWriter::new(Vec::new());
        let blocks = vec![
            Block {
                timestamp: Timestamp::compose(T0, 0.123456789),
                srcal: 1.00005,
                sample_rate: 8000,
                channels: 2,
                samples: vec![0.5, -0.25, 0.125, 1.0],
            },
            Block {
                timestamp: Timestamp::compose(T0, 0.9999999999),
                srcal: 1.00005,
                sample_rate: 8000,
                channels: 2,
                samples: vec![0.0, 0.75],
            },
        ];
        for block in &blocks {
            writer.write_block(block).unwrap();
        }
        let bytes = writer.into_inner();

        let mut reader = BlockReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.sample_rate(), 8000);
        let mut batch = FrameBatch::new(2);
        assert_eq!(reader.read_batch(&mut batch).unwrap(), Some(2));
        assert!(batch.timestamp.diff(blocks[0].timestamp).abs() < 1e-9);
        assert_eq!(batch.srcal, 1.00005);
        assert_eq!(batch.samples, vec![0.5, -0.25, 0.125, 1.0]);
        assert_eq!(reader.read_batch(&mut batch).unwrap(), Some(1));
        assert_eq!(batch.timestamp, Timestamp::from_secs(T0 + 1));
        assert_eq!(reader.read_batch(&mut batch).unwrap(), None);
    }

    #[test]
    fn test_reader_rejects_garbage() {
        assert!(matches!(BlockReader::new(&b""[..]), Err(Error::BlockFormat(_))));
        assert!(matches!(BlockReader::new(&b"RIFF0000"[..]), Err(Error::BlockFormat(_))));
    }

    fn header(channels: u32, frames: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(BLOCK_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(channels).unwrap();
        bytes.write_u32::<LittleEndian>(8000).unwrap();
        bytes.write_u32::<LittleEndian>(frames).unwrap();
        bytes.write_i64::<LittleEndian>(T0).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_f64::<LittleEndian>(1.0).unwrap();
        bytes
    }

    #[test]
    fn test_reader_rejects_oversized_headers() {
        let oversized = [
            (u32::MAX, u32::MAX),
            (1, u32::MAX),
            (1, MAX_BLOCK_SIZE as u32 + 1),
            (4096, 1),
        ];
        for (channels, frames) in oversized {
            let bytes = header(channels, frames);
            assert!(
                matches!(BlockReader::new(bytes.as_slice()), Err(Error::BlockFormat(_))),
                "{} channels, {} frames",
                channels,
                frames
            );
        }

        // the largest block allowed is read up to the missing samples
        let bytes = header(2, MAX_BLOCK_SIZE as u32);
        let mut reader = BlockReader::new(bytes.as_slice()).unwrap();
        let mut batch = FrameBatch::new(2);
        assert!(matches!(reader.read_batch(&mut batch), Err(Error::Io(_))));
    }

    #[test]
    fn test_reader_rejects_oversized_later_block() {
        let mut bytes = header(1, 2);
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend(header(1, u32::MAX));
        let mut reader = BlockReader::new(bytes.as_slice()).unwrap();
        let mut batch = FrameBatch::new(1);
        assert_eq!(reader.read_batch(&mut batch).unwrap(), Some(2));
        assert!(matches!(reader.read_batch(&mut batch), Err(Error::BlockFormat(_))));
    }
}
