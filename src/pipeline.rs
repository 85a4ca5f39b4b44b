//! Read → discipline → (resample) → write loops for both disciplines.

use tracing::{debug, info, warn};

use crate::configuration::PulseConfig;
use crate::discipline::{ControlOutcome, HardwareClockDiscipline, PulseDiscipline, PulseEvent};
use crate::error::{ConfigError, Error, Result};
use crate::resample::SincResampler;
use crate::sink::FrameSink;
use crate::source::{FrameBatch, FrameSource, WallClock};
use crate::Sample;

/// Consecutive failed reads, with no valid read in between, after which
/// the source is assumed to be broken.
pub const MAX_READ_ERRORS: u32 = 10;

enum BatchRead {
    Frames(usize),
    Failed,
    End,
}

/// Read the next batch, counting transient failures in `error_count`.
fn read_counted<S: FrameSource + ?Sized>(
    source: &mut S,
    batch: &mut FrameBatch,
    error_count: &mut u32,
) -> Result<BatchRead> {
    match source.read_batch(batch) {
        Ok(Some(frames)) => {
            *error_count = 0;
            Ok(BatchRead::Frames(frames))
        }
        Ok(None) => Ok(BatchRead::End),
        Err(err) if err.is_transient() => {
            *error_count += 1;
            warn!(error_count, %err, "error reading input");
            // Occasional errors are tolerated, as long as valid reads
            // come in between.
            if *error_count >= MAX_READ_ERRORS {
                return Err(Error::TooManyReadErrors(*error_count));
            }
            Ok(BatchRead::Failed)
        }
        Err(err) => Err(err),
    }
}

/// Hardware-clock disciplined acquisition: frames from a free-running
/// source are stamped against the system clock and passed on.
pub struct HardwareClockPipeline<S, C, K> {
    source: S,
    discipline: HardwareClockDiscipline<C>,
    sink: K,
    batch: FrameBatch,
    error_count: u32,
    restarts: u32,
}

impl<S: FrameSource, C: WallClock, K: FrameSink> HardwareClockPipeline<S, C, K> {
    pub fn new(source: S, discipline: HardwareClockDiscipline<C>, sink: K) -> Self {
        let batch = FrameBatch::new(source.channels());
        Self { source, discipline, sink, batch, error_count: 0, restarts: 0 }
    }

    pub fn discipline(&self) -> &HardwareClockDiscipline<C> {
        &self.discipline
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Number of times calibration has started over.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Read and process one batch.
    pub fn step(&mut self) -> Result<ControlOutcome> {
        let frames = match read_counted(&mut self.source, &mut self.batch, &mut self.error_count)? {
            BatchRead::Frames(frames) => frames,
            BatchRead::Failed => return Ok(ControlOutcome::Continue),
            BatchRead::End => {
                self.sink.flush()?;
                return Ok(ControlOutcome::Drained);
            }
        };

        let outcome = self.discipline.update(frames);
        if outcome == ControlOutcome::Restart {
            self.restarts += 1;
        }
        for frame in self.batch.frames() {
            self.discipline.commit_frame(frame, &mut self.sink)?;
        }
        Ok(outcome)
    }

    /// Run until the source is exhausted.
    pub fn run(&mut self) -> Result<()> {
        while self.step()? != ControlOutcome::Drained {}
        info!(restarts = self.restarts, "end of input");
        Ok(())
    }
}

/// Pulse disciplined retiming: the timing channel of a roughly
/// timestamped stream is used to discipline its timebase, and the other
/// channels are resampled onto the exact nominal rate and UT grid.
pub struct PulsePipeline {
    discipline: PulseDiscipline,
    resampler: SincResampler,
    timing_channel: usize,
    output_channels: Vec<usize>,
    frame: Vec<Sample>,
    sample_rate: u32,
    batch: FrameBatch,
    error_count: u32,
    restarts: u32,
}

impl PulsePipeline {
    pub fn new(
        config: PulseConfig,
        channels: usize,
        sample_rate: u32,
    ) -> std::result::Result<Self, ConfigError> {
        if channels == 0 {
            return Err(ConfigError::InvalidChannels(channels));
        }
        let timing_channel = config.timing_channel;
        let keep_timing = config.output_timing_channel;
        let discipline = PulseDiscipline::new(config, sample_rate)?;

        let untimed = discipline.is_untimed();
        if !untimed && timing_channel >= channels {
            return Err(ConfigError::InvalidChannel { channel: timing_channel + 1, channels });
        }
        let output_channels: Vec<usize> = (0..channels)
            .filter(|&c| untimed || keep_timing || c != timing_channel)
            .collect();
        if output_channels.is_empty() {
            return Err(ConfigError::NoOutputChannels);
        }
        debug!(timing_channel, ?output_channels, untimed, "pulse pipeline");

        Ok(Self {
            discipline,
            resampler: SincResampler::new(output_channels.len(), sample_rate),
            timing_channel,
            frame: vec![0.0; output_channels.len()],
            output_channels,
            sample_rate,
            batch: FrameBatch::new(channels),
            error_count: 0,
            restarts: 0,
        })
    }

    pub fn discipline(&self) -> &PulseDiscipline {
        &self.discipline
    }

    /// Input channel indices passed to the output, in order.
    pub fn output_channels(&self) -> &[usize] {
        &self.output_channels
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Discipline and resample one batch of input frames.
    pub fn process_batch<K: FrameSink + ?Sized>(
        &mut self,
        batch: &FrameBatch,
        sink: &mut K,
    ) -> Result<ControlOutcome> {
        let mut outcome = ControlOutcome::Continue;
        let period = 1.0 / (self.sample_rate as f64 * batch.srcal);
        let untimed = self.discipline.is_untimed();

        for (i, frame) in batch.frames().enumerate() {
            let t = batch.timestamp.add(i as f64 * period);
            let timing = if untimed { 0.0 } else { frame[self.timing_channel] };
            match self.discipline.process_frame(t, timing, batch.srcal)? {
                PulseEvent::None => {}
                PulseEvent::Locked(epoch) => {
                    self.resampler.set_epoch(epoch);
                    sink.set_output_timebase(epoch, 1.0)?;
                }
                PulseEvent::Reset => {
                    self.resampler.clear_epoch();
                    self.restarts += 1;
                    outcome = ControlOutcome::Restart;
                }
            }

            for (out, &channel) in self.frame.iter_mut().zip(&self.output_channels) {
                *out = frame[channel];
            }
            self.resampler.push(&self.frame, self.discipline.frame_stamp());
            self.discipline.advance();

            if self.discipline.is_running() {
                self.resampler.emit(sink)?;
            }
        }
        Ok(outcome)
    }

    /// Read and process one batch from `source`.
    pub fn step<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<ControlOutcome>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut batch = std::mem::take(&mut self.batch);
        let read = read_counted(source, &mut batch, &mut self.error_count);
        let outcome = match read {
            Ok(BatchRead::Frames(_)) => self.process_batch(&batch, sink),
            Ok(BatchRead::Failed) => Ok(ControlOutcome::Continue),
            Ok(BatchRead::End) => sink.flush().map(|_| ControlOutcome::Drained),
            Err(err) => Err(err),
        };
        self.batch = batch;
        outcome
    }

    /// Run until `source` is exhausted.
    pub fn run<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<()>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        while self.step(source, sink)? != ControlOutcome::Drained {}
        info!(
            restarts = self.restarts,
            output_frames = self.resampler.emitted(),
            "end of input"
        );
        Ok(())
    }
}
