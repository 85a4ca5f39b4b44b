//! Sinc interpolation of disciplined input frames onto an exactly
//! periodic output grid.
//!
//! Input frames are held in a ring along with their disciplined
//! timestamps. The ring centre trails the newest frame by half the ring,
//! giving the interpolation kernel 35 frames either side of the pair of
//! frames `get(0)` and `get(1)` that bracket the output time.

use wide::f64x4;

use crate::error::Result;
use crate::ring::Ring;
use crate::sink::FrameSink;
use crate::timestamp::Timestamp;
use crate::Sample;

pub const RING_LEN: usize = 256;
/// Half-length of the kernel in zero crossings.
pub const ZERO_CROSSINGS: usize = 36;
/// Kernel table points between zero crossings.
pub const PHASES: usize = 128;
pub const TAPS: usize = 2 * (ZERO_CROSSINGS - 1) + 1;
const HALF_TAPS: isize = ZERO_CROSSINGS as isize - 1;
/// Tap count rounded up to a whole number of SIMD lanes.
const PADDED_TAPS: usize = (TAPS + 3) / 4 * 4;

/// `sin(πa)/(πa)` sampled at `PHASES` points per zero crossing, rearranged
/// into one column of tap weights per interpolation phase.
pub struct SincKernelTable {
    columns: Vec<[f64; PADDED_TAPS]>,
}

impl SincKernelTable {
    pub fn new() -> Self {
        let sinc: Vec<f64> = (0..=ZERO_CROSSINGS * PHASES)
            .map(|i| {
                if i == 0 {
                    1.0
                } else {
                    let a = std::f64::consts::PI * i as f64 / PHASES as f64;
                    a.sin() / a
                }
            })
            .collect();

        // column k, tap j weights input frame get(-j) for an output phase
        // of k / PHASES past frame get(0)
        let columns = (0..=PHASES as isize)
            .map(|k| {
                let mut column = [0.0; PADDED_TAPS];
                for (weight, j) in column.iter_mut().zip(-HALF_TAPS..=HALF_TAPS) {
                    *weight = sinc[(k + j * PHASES as isize).unsigned_abs()];
                }
                column
            })
            .collect();
        Self { columns }
    }

    /// Nearest table phase for a fractional position `x` in `0..=1`.
    pub fn phase_index(x: f64) -> usize {
        let k = (x * PHASES as f64).round();
        if k > 0.0 {
            (k as usize).min(PHASES)
        } else {
            0
        }
    }

    pub fn column(&self, phase: usize) -> &[f64; PADDED_TAPS] {
        &self.columns[phase]
    }
}

impl Default for SincKernelTable {
    fn default() -> Self {
        Self::new()
    }
}

fn dot(a: &[f64; PADDED_TAPS], b: &[f64; PADDED_TAPS]) -> f64 {
    let mut acc = f64x4::splat(0.0);
    for (a, b) in a.chunks_exact(4).zip(b.chunks_exact(4)) {
        acc = acc + f64x4::from([a[0], a[1], a[2], a[3]]) * f64x4::from([b[0], b[1], b[2], b[3]]);
    }
    acc.reduce_add()
}

pub struct SincResampler {
    kernel: SincKernelTable,
    frames: Ring<Vec<Sample>, RING_LEN>,
    stamps: Ring<Timestamp, RING_LEN>,
    channels: usize,
    sample_rate: u32,
    /// Time of output frame 0.
    epoch: Option<Timestamp>,
    /// Output frames produced since the epoch.
    emitted: u64,
    taps: [f64; PADDED_TAPS],
    output: Vec<Sample>,
}

impl SincResampler {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            kernel: SincKernelTable::new(),
            frames: Ring::new(vec![0.0; channels]),
            stamps: Ring::new(Timestamp::NONE),
            channels,
            sample_rate,
            epoch: None,
            emitted: 0,
            taps: [0.0; PADDED_TAPS],
            output: vec![0.0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epoch(&self) -> Option<Timestamp> {
        self.epoch
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Start output at `epoch`, counting output frames from there.
    pub fn set_epoch(&mut self, epoch: Timestamp) {
        self.epoch = Some(epoch);
        self.emitted = 0;
    }

    /// Stop output until a new epoch is set.
    pub fn clear_epoch(&mut self) {
        self.epoch = None;
    }

    /// Add the newest input frame and its disciplined time.
    pub fn push(&mut self, frame: &[Sample], stamp: Timestamp) {
        self.frames.next_slot().copy_from_slice(&frame[..self.channels]);
        self.stamps.push(stamp);
    }

    /// Interpolated frame at fraction `x` of the way from frame `get(0)`
    /// to frame `get(1)`.
    pub fn interpolate(&mut self, x: f64) -> &[Sample] {
        let column = self.kernel.column(SincKernelTable::phase_index(x));
        for channel in 0..self.channels {
            for (tap, j) in self.taps.iter_mut().zip(-HALF_TAPS..=HALF_TAPS) {
                *tap = self.frames.get(-j)[channel];
            }
            self.output[channel] = dot(&self.taps, column) as Sample;
        }
        &self.output
    }

    /// Emit every output frame whose time falls before the time of frame
    /// `get(1)`. Returns the number of frames emitted.
    pub fn emit<K: FrameSink + ?Sized>(&mut self, sink: &mut K) -> Result<usize> {
        let Some(epoch) = self.epoch else {
            return Ok(0);
        };
        let t0 = *self.stamps.get(0);
        let interval = self.stamps.get(1).diff(t0);
        if !(interval > 0.0) {
            return Ok(0);
        }

        let period = 1.0 / self.sample_rate as f64;
        let mut x = epoch.add(self.emitted as f64 * period).diff(t0) / interval;
        let step = period / interval;
        let mut count = 0;
        while x < 1.0 {
            self.interpolate(x.max(0.0));
            sink.emit_frame(&self.output)?;
            self.emitted += 1;
            count += 1;
            x += step;
        }
        Ok(count)
    }
}
