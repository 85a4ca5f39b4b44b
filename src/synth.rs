//! Synthetic sources and a simulated wall clock, useful for testing.

use std::cell::Cell;
use std::f64::consts::PI;
use std::rc::Rc;

use crate::error::Result;
use crate::source::{FrameBatch, FrameSource, WallClock};
use crate::timestamp::Timestamp;
use crate::Sample;

/// Wall clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now: Rc<Cell<Timestamp>>,
}

impl SimulatedClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: Rc::new(Cell::new(start)) }
    }

    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get().add(seconds));
    }
}

impl WallClock for SimulatedClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

/// Single channel sound card running at `true_rate` while claiming its
/// nominal rate. Each read advances the simulated clock by the real
/// duration of the frames read, as a blocking read from a capture device
/// would.
pub struct ToneSource {
    clock: SimulatedClock,
    sample_rate: u32,
    true_rate: f64,
    /// Tone frequency in cycles per true second.
    frequency: f64,
    batch_frames: usize,
    /// Frames left to produce.
    remaining: u64,
    /// Number of frames produced so far.
    frame_counter: u64,
    /// Reads which take longer than they should, as (read index, extra
    /// seconds).
    stalls: Vec<(u64, f64)>,
    reads: u64,
}

impl ToneSource {
    pub fn new(clock: SimulatedClock, sample_rate: u32, true_rate: f64, duration: f64) -> Self {
        Self {
            clock,
            sample_rate,
            true_rate,
            frequency: 1000.0,
            batch_frames: 1000,
            remaining: (duration * true_rate) as u64,
            frame_counter: 0,
            stalls: Vec::new(),
            reads: 0,
        }
    }

    /// A tone slow enough not to wrap gives each frame a recognisable
    /// value.
    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_batch_frames(mut self, frames: usize) -> Self {
        self.batch_frames = frames.max(1);
        self
    }

    /// Make read number `read` take `extra` seconds longer.
    pub fn with_stall(mut self, read: u64, extra: f64) -> Self {
        self.stalls.push((read, extra));
        self
    }

    /// Successful reads so far.
    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl FrameSource for ToneSource {
    fn channels(&self) -> usize {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_live(&self) -> bool {
        true
    }

    fn read_batch(&mut self, batch: &mut FrameBatch) -> Result<Option<usize>> {
        let frames = (self.batch_frames as u64).min(self.remaining) as usize;
        if frames == 0 {
            return Ok(None);
        }
        batch.channels = 1;
        batch.timestamp = Timestamp::NONE;
        batch.srcal = 1.0;
        batch.samples.clear();
        batch.samples.extend((0..frames as u64).map(|k| {
            let t = (self.frame_counter + k) as f64 / self.true_rate;
            (2.0 * PI * self.frequency * t).sin() as Sample
        }));
        self.frame_counter += frames as u64;
        self.remaining -= frames as u64;

        let stall: f64 = self
            .stalls
            .iter()
            .filter(|(read, _)| *read == self.reads)
            .map(|(_, extra)| extra)
            .sum();
        self.clock.advance(frames as f64 / self.true_rate + stall);
        self.reads += 1;
        Ok(Some(frames))
    }
}

/// Roughly timestamped two channel stream: a one pulse per second timing
/// signal on channel 0 and a tone on channel 1.
///
/// Frames are taken at `true_rate`. Each batch is stamped with the true
/// time of its first frame but claims a rate of `reported_srcal` times
/// nominal, so timestamps within a batch drift the way they do from a
/// sound card calibrated only coarsely.
pub struct PpsSource {
    start: Timestamp,
    sample_rate: u32,
    true_rate: f64,
    reported_srcal: f64,
    /// Delay of the pulse centre after the second.
    pulse_delay: f64,
    /// Gaussian pulse width parameter in seconds.
    pulse_sigma: f64,
    pulse_amplitude: f64,
    /// Extra pulse delay from `step_at` seconds after the start on.
    step_at: f64,
    step: f64,
    tone_frequency: f64,
    batch_frames: usize,
    remaining: u64,
    frame_counter: u64,
}

impl PpsSource {
    pub fn new(start: Timestamp, sample_rate: u32, true_rate: f64, duration: f64) -> Self {
        Self {
            start,
            sample_rate,
            true_rate,
            reported_srcal: 1.0,
            pulse_delay: 1e-3,
            pulse_sigma: 0.2e-3,
            pulse_amplitude: 1.0,
            step_at: f64::INFINITY,
            step: 0.0,
            tone_frequency: 100.0,
            batch_frames: 1000,
            remaining: (duration * true_rate) as u64,
            frame_counter: 0,
        }
    }

    pub fn with_reported_srcal(mut self, srcal: f64) -> Self {
        self.reported_srcal = srcal;
        self
    }

    /// Negative amplitude gives a negative going pulse.
    pub fn with_pulse(mut self, delay: f64, sigma: f64, amplitude: f64) -> Self {
        self.pulse_delay = delay;
        self.pulse_sigma = sigma;
        self.pulse_amplitude = amplitude;
        self
    }

    /// Delay every pulse from `at` seconds after the start by a further
    /// `step` seconds, as if the timing receiver had been swapped.
    pub fn with_pulse_step(mut self, at: f64, step: f64) -> Self {
        self.step_at = at;
        self.step = step;
        self
    }

    pub fn with_tone(mut self, frequency: f64) -> Self {
        self.tone_frequency = frequency;
        self
    }

    pub fn with_batch_frames(mut self, frames: usize) -> Self {
        self.batch_frames = frames.max(1);
        self
    }

    /// True time at which frame `frame` was taken.
    pub fn frame_time(&self, frame: u64) -> Timestamp {
        self.start.add(frame as f64 / self.true_rate)
    }

    /// The tone channel as a function of true time.
    pub fn tone_at(&self, t: Timestamp) -> Sample {
        (2.0 * PI * self.tone_frequency * t.diff(self.start)).sin() as Sample
    }

    /// The timing channel as a function of true time.
    pub fn pulse_at(&self, t: Timestamp) -> Sample {
        let step = if t.diff(self.start) >= self.step_at { self.step } else { 0.0 };
        let mut d = t.add(-self.pulse_delay - step).frac();
        if d > 0.5 {
            d -= 1.0;
        }
        (self.pulse_amplitude * (-0.5 * (d / self.pulse_sigma).powi(2)).exp()) as Sample
    }
}

impl FrameSource for PpsSource {
    fn channels(&self) -> usize {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_batch(&mut self, batch: &mut FrameBatch) -> Result<Option<usize>> {
        let frames = (self.batch_frames as u64).min(self.remaining) as usize;
        if frames == 0 {
            return Ok(None);
        }
        batch.channels = 2;
        batch.timestamp = self.frame_time(self.frame_counter);
        batch.srcal = self.reported_srcal;
        batch.samples.clear();
        for k in 0..frames as u64 {
            let t = self.frame_time(self.frame_counter + k);
            batch.samples.push(self.pulse_at(t));
            batch.samples.push(self.tone_at(t));
        }
        self.frame_counter += frames as u64;
        self.remaining -= frames as u64;
        Ok(Some(frames))
    }
}
