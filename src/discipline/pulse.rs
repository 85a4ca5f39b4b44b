//! Discipline from a one pulse per second timing signal.
//!
//! A window of the timing channel centred on each expected second is
//! captured and the pulse located in it to a fraction of a sample, either
//! at the half-amplitude point of its leading edge or at its energy
//! centroid. Successive pulse positions give the true sample rate and the
//! input frame count at a known UT second. The timebase is corrected a
//! fraction of the measured error per pulse, through a median of three
//! filter so one bad pulse cannot throw it.

use tracing::{debug, info, warn};

use super::method::{CentroidWindow, MethodSpec, PulseMethod};
use super::{CalibrationState, MedianCorrectionQueue};
use crate::configuration::PulseConfig;
use crate::error::{ConfigError, Error, Result};
use crate::timestamp::Timestamp;
use crate::Sample;

/// Timing channel samples around one expected pulse.
pub struct CaptureBuffer {
    samples: Vec<Sample>,
    half_width: f64,
    /// Number of samples loaded so far.
    load: usize,
    loading: bool,
    peak: Sample,
    peak_pos: usize,
    abs_sum: f64,
    /// Input frame count at the first sample.
    start_frame: i64,
    /// Input time of the first sample.
    start_time: Timestamp,
}

impl CaptureBuffer {
    pub fn new(half_width: f64, sample_rate: u32) -> std::result::Result<Self, ConfigError> {
        let len = (half_width * 2.0 * sample_rate as f64).round() as usize;
        if !(half_width > 0.0 && half_width < 0.5) || len < 4 {
            return Err(ConfigError::InvalidHalfWidth(half_width));
        }
        Ok(Self {
            samples: vec![0.0; len],
            half_width,
            load: 0,
            loading: false,
            peak: 0.0,
            peak_pos: 0,
            abs_sum: 0.0,
            start_frame: 0,
            start_time: Timestamp::NONE,
        })
    }

    /// Offer one timing sample taken at input time `t`, input frame
    /// `frame`. Capture starts `half_width` before each second. Returns
    /// true when the buffer has just been filled.
    pub fn load(&mut self, t: Timestamp, value: Sample, frame: i64) -> bool {
        if !self.loading && t.frac() > 1.0 - self.half_width {
            self.loading = true;
            self.load = 0;
            self.peak = 0.0;
            self.peak_pos = 0;
            self.abs_sum = 0.0;
            self.start_frame = frame;
            self.start_time = t;
        }
        if !self.loading {
            return false;
        }

        if value > self.peak {
            self.peak = value;
            self.peak_pos = self.load;
        }
        self.abs_sum += value.abs() as f64;
        self.samples[self.load] = value;
        self.load += 1;
        if self.load < self.samples.len() {
            return false;
        }
        self.loading = false;
        true
    }

    /// Peak value over mean absolute value.
    pub fn peak_mean_ratio(&self) -> f64 {
        self.peak as f64 / (self.abs_sum / self.samples.len() as f64)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn peak(&self) -> Sample {
        self.peak
    }

    pub fn peak_pos(&self) -> usize {
        self.peak_pos
    }

    pub fn start_frame(&self) -> i64 {
        self.start_frame
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }
}

/// Finds the mark, the position of the true second, in a full capture.
pub trait PulseLocator {
    /// Fractional sample index of the mark within the capture, or `None`
    /// if this capture is unusable.
    fn locate(
        &self,
        capture: &mut CaptureBuffer,
        sample_rate: u32,
        srcal: f64,
    ) -> Result<Option<f64>>;
}

/// Half-amplitude point of the leading edge.
pub struct EdgeLocator;

impl PulseLocator for EdgeLocator {
    fn locate(
        &self,
        capture: &mut CaptureBuffer,
        _sample_rate: u32,
        _srcal: f64,
    ) -> Result<Option<f64>> {
        let half = 0.5 * capture.peak;
        let start = capture.samples[..=capture.peak_pos].iter().rposition(|&v| v <= half);
        match start {
            Some(i) => Ok(Some((i + 1) as f64)),
            None => {
                warn!("pulse starts too early, skipped");
                Ok(None)
            }
        }
    }
}

/// Energy centroid of the pulse, less the known delay of the centroid
/// after the true second.
pub struct CentroidLocator {
    pub offset: f64,
    pub window: CentroidWindow,
}

impl CentroidLocator {
    /// Integration window `start..end` in capture sample indices. May run
    /// off either end of the buffer.
    fn window(
        &self,
        samples: &[Sample],
        peak_pos: usize,
        peak: Sample,
        sample_rate: u32,
    ) -> (isize, isize) {
        let rate = sample_rate as f64;
        let p = peak_pos as f64;
        match self.window {
            CentroidWindow::Asymmetric { before, after } => {
                ((p - before * rate) as isize, (p + after * rate) as isize)
            }
            CentroidWindow::Fixed(width) => {
                ((p - width * rate) as isize, (p + width * rate) as isize)
            }
            CentroidWindow::Auto => {
                let threshold = 0.01 * peak;
                let mut start = peak_pos;
                while start > 0 && samples[start] > threshold {
                    start -= 1;
                }
                let mut end = peak_pos;
                while end < samples.len() - 1 && samples[end] > threshold {
                    end += 1;
                }
                (start as isize - 2, end as isize)
            }
        }
    }
}

impl PulseLocator for CentroidLocator {
    fn locate(
        &self,
        capture: &mut CaptureBuffer,
        sample_rate: u32,
        srcal: f64,
    ) -> Result<Option<f64>> {
        let peak_pos = capture.peak_pos;
        let (start, end) = self.window(&capture.samples, peak_pos, capture.peak, sample_rate);
        if start <= 0 || end >= capture.samples.len() as isize - 1 {
            warn!(start, end, "pulse at timing limit, skipped");
            return Ok(None);
        }
        let (start, end) = (start as usize, end as usize);
        if self.window == CentroidWindow::Auto {
            let rate = sample_rate as f64;
            debug!(
                before_ms = (peak_pos - start) as f64 / rate * 1e3,
                after_ms = (end - peak_pos) as f64 / rate * 1e3,
                "centroid window"
            );
        }

        despike(&mut capture.samples, start, end, peak_pos);
        let c = centroid(&capture.samples, start, end);
        if !c.is_finite() {
            return Err(Error::UndefinedMark {
                centroid: c,
                start: start as isize,
                end: end as isize,
            });
        }
        Ok(Some(c - self.offset * sample_rate as f64 * srcal))
    }
}

/// Replace each isolated single-sample spike strictly inside `start..end`
/// by the mean of its neighbours, leaving `keep` alone. One pass, in
/// place.
pub fn despike(samples: &mut [Sample], start: usize, end: usize, keep: usize) {
    for j in start + 1..end.saturating_sub(1) {
        if j == keep {
            continue;
        }
        let d1 = samples[j] - samples[j - 1];
        let d2 = samples[j + 1] - samples[j];
        if d1 * d2 < 0.0 {
            samples[j] = (samples[j - 1] + samples[j + 1]) / 2.0;
        }
    }
}

/// Centre of mass of `samples[start..end]` as a fractional index.
pub fn centroid(samples: &[Sample], start: usize, end: usize) -> f64 {
    let (moment, mass) = samples[start..end]
        .iter()
        .zip(start..)
        .fold((0.0, 0.0), |(moment, mass), (&v, j)| {
            (moment + v as f64 * j as f64, mass + v as f64)
        });
    moment / mass
}

/// Exponentially smoothed pulse interval and its variance.
#[derive(Debug, Clone)]
pub struct IntervalStats {
    factor: f64,
    mean: f64,
    variance: f64,
}

impl IntervalStats {
    /// `time_constant` is in pulses.
    pub fn new(time_constant: f64) -> Self {
        Self { factor: (-1.0 / time_constant).exp(), mean: 0.0, variance: 0.0 }
    }

    pub fn update(&mut self, interval: f64) {
        if self.mean == 0.0 {
            self.mean = interval;
            return;
        }
        let deviation = interval - self.mean;
        self.mean = self.mean * self.factor + interval * (1.0 - self.factor);
        self.variance = self.variance * self.factor + deviation * deviation * (1.0 - self.factor);
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Standard deviation of the interval in seconds.
    pub fn sigma(&self, sample_rate: u32) -> f64 {
        self.variance.sqrt() / sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseState {
    Acquiring,
    /// Timebase established. Output is being produced.
    Running,
}

/// Notable transitions resulting from one input frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PulseEvent {
    None,
    /// Running, with output starting at the given epoch.
    Locked(Timestamp),
    /// Timebase lost. Acquiring again.
    Reset,
}

enum Timing {
    Untimed,
    Pulse { polarity: f64, check_peak_mean: bool, locator: Box<dyn PulseLocator> },
}

pub struct PulseDiscipline {
    config: PulseConfig,
    sample_rate: u32,
    timing: Timing,
    capture: Option<CaptureBuffer>,
    state: PulseState,
    /// Input frame counter.
    nin: i64,
    cal: CalibrationState,
    /// Estimated true sample period.
    dt: f64,
    /// Output epoch chosen when the discipline started running.
    outbase: Timestamp,
    /// Input frame count and capture index of the previous mark.
    previous: Option<(i64, f64)>,
    /// Rounded capture start time of the last accepted pulse.
    last_second: Timestamp,
    median: MedianCorrectionQueue,
    stats: IntervalStats,
}

impl PulseDiscipline {
    pub fn new(config: PulseConfig, sample_rate: u32) -> std::result::Result<Self, ConfigError> {
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        let spec: MethodSpec = config.method.ok_or(ConfigError::MissingMethod)?;
        let timing = match spec.method {
            PulseMethod::None => Timing::Untimed,
            PulseMethod::Edge { polarity } => Timing::Pulse {
                polarity: polarity.sign(),
                check_peak_mean: spec.check_peak_mean,
                locator: Box::new(EdgeLocator),
            },
            PulseMethod::Centroid { polarity, offset, window } => Timing::Pulse {
                polarity: polarity.sign(),
                check_peak_mean: spec.check_peak_mean,
                locator: Box::new(CentroidLocator { offset, window }),
            },
        };
        if matches!(timing, Timing::Pulse { .. }) {
            // validate the capture geometry up front
            CaptureBuffer::new(config.half_width, sample_rate)?;
        }
        let stats = IntervalStats::new(config.stats_time_constant);
        Ok(Self {
            config,
            sample_rate,
            timing,
            capture: None,
            state: PulseState::Acquiring,
            nin: 0,
            cal: CalibrationState::default(),
            dt: 1.0 / sample_rate as f64,
            outbase: Timestamp::ZERO,
            previous: None,
            last_second: Timestamp::ZERO,
            median: MedianCorrectionQueue::new(),
            stats,
        })
    }

    pub fn state(&self) -> PulseState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PulseState::Running
    }

    pub fn is_untimed(&self) -> bool {
        matches!(self.timing, Timing::Untimed)
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.cal
    }

    pub fn srcal(&self) -> f64 {
        self.cal.srcal
    }

    pub fn output_epoch(&self) -> Timestamp {
        self.outbase
    }

    pub fn interval_stats(&self) -> &IntervalStats {
        &self.stats
    }

    /// Disciplined time of the current input frame.
    pub fn frame_stamp(&self) -> Timestamp {
        let base = self.cal.ninbase.unwrap_or(0);
        self.cal.timebase.add((self.nin - base) as f64 * self.dt)
    }

    /// Move on to the next input frame.
    pub fn advance(&mut self) {
        self.nin += 1;
    }

    /// Drop the timebase and acquire again. The rate estimate starts over
    /// from the one claimed by the input.
    pub fn reset(&mut self) {
        self.state = PulseState::Acquiring;
        self.capture = None;
        self.nin = 0;
        self.cal = CalibrationState::default();
        self.dt = 1.0 / self.sample_rate as f64;
        self.previous = None;
        self.median.flush();
    }

    /// Process the timing sample of the current input frame, taken at
    /// input time `t` by a source claiming rate correction `srcal_in`.
    pub fn process_frame(
        &mut self,
        t: Timestamp,
        value: Sample,
        srcal_in: f64,
    ) -> Result<PulseEvent> {
        let rate = self.sample_rate as f64;
        if self.is_untimed() {
            return Ok(self.follow_input(t, srcal_in));
        }
        let Timing::Pulse { polarity, check_peak_mean, locator } = &self.timing else {
            return Ok(PulseEvent::None);
        };
        let (polarity, check_peak_mean) = (*polarity, *check_peak_mean);

        if self.capture.is_none() {
            self.cal.srcal = srcal_in;
            self.dt = 1.0 / (rate * srcal_in);
            self.capture = Some(CaptureBuffer::new(self.config.half_width, self.sample_rate)?);
        }
        let Some(capture) = self.capture.as_mut() else {
            return Ok(PulseEvent::None);
        };
        if !capture.load(t, polarity * value, self.nin) {
            return Ok(PulseEvent::None);
        }

        let pmr = capture.peak_mean_ratio();
        if check_peak_mean && !(pmr >= self.config.min_peak_mean_ratio) {
            warn!(pmr, "insufficient peak/mean ratio, skipped");
            return Ok(PulseEvent::None);
        }
        let Some(mark) = locator.locate(capture, self.sample_rate, self.cal.srcal)? else {
            return Ok(PulseEvent::None);
        };
        let (start_frame, start_time) = (capture.start_frame(), capture.start_time());
        Ok(self.revise_timebase(mark, start_frame, start_time, pmr))
    }

    /// Untimed operation: take the input timestamps and rate as they are.
    fn follow_input(&mut self, t: Timestamp, srcal_in: f64) -> PulseEvent {
        self.cal.srcal = srcal_in;
        self.dt = 1.0 / (self.sample_rate as f64 * srcal_in);
        self.cal.timebase = t;
        self.cal.ninbase = Some(0);
        self.nin = 0;
        if self.state == PulseState::Acquiring {
            self.outbase = Timestamp::from_secs(t.secs() + 2);
            self.state = PulseState::Running;
            info!(output_epoch = %self.outbase, "following input timestamps");
            return PulseEvent::Locked(self.outbase);
        }
        PulseEvent::None
    }

    /// Fold one located pulse into the rate and timebase estimates. `mark`
    /// is the capture index of the second which started at input frame
    /// `start_frame`, input time `start_time`.
    fn revise_timebase(
        &mut self,
        mark: f64,
        start_frame: i64,
        start_time: Timestamp,
        pmr: f64,
    ) -> PulseEvent {
        let rate = self.sample_rate as f64;
        let Some((previous_frame, previous_mark)) = self.previous.replace((start_frame, mark))
        else {
            debug!(mark, "first pulse");
            return PulseEvent::None;
        };
        let interval = (start_frame - previous_frame) as f64 + mark - previous_mark;
        let tolerance = self.config.interval_tolerance;
        if interval > rate * (1.0 + tolerance) || interval < rate * (1.0 - tolerance) {
            warn!(interval, "wild pulse interval, skipped");
            return PulseEvent::None;
        }

        let divisor = match self.state {
            PulseState::Running => self.config.steady_divisor,
            PulseState::Acquiring => self.config.acquire_divisor,
        };
        let current_rate = rate * self.cal.srcal;
        let raw_rate_error = interval - current_rate;
        let rate_correction = raw_rate_error / divisor;
        let second = start_time.round();

        let mut out_error = 0.0;
        let mut time_correction = 0.0;
        match self.cal.ninbase {
            Some(ninbase) => {
                let expected = current_rate * second.diff(self.cal.timebase);
                out_error = start_frame as f64 + mark - expected - ninbase as f64;
                time_correction = -out_error / divisor * self.dt;
            }
            None => self.median.flush(),
        }
        let (rate_correction, time_correction) =
            self.median.filter(rate_correction, time_correction);

        self.cal.srcal = (current_rate + rate_correction) / rate;
        self.dt = 1.0 / (rate * self.cal.srcal);

        let mut timebase_valid = false;
        match self.cal.ninbase {
            None => {
                self.last_second = second;
                self.cal.timebase = second.add(-mark * self.dt);
                self.cal.ninbase = Some(start_frame);
            }
            Some(ninbase) => {
                let secs = start_time.diff(self.last_second).round();
                let nadj = (rate * self.cal.srcal * secs).round() as i64;
                self.cal.ninbase = Some(ninbase + nadj);
                self.cal.timebase = self.cal.timebase.add(nadj as f64 * self.dt + time_correction);
                self.last_second = second;
                timebase_valid = true;
            }
        }

        self.stats.update(interval);
        let ninbase = self.cal.ninbase.unwrap_or(start_frame);
        let in_err = start_time.diff(self.cal.timebase) + (ninbase - start_frame) as f64 * self.dt;
        debug!(
            state = ?self.state,
            pmr,
            sigma_us = self.stats.sigma(self.sample_rate) * 1e6,
            in_err_ms = in_err * 1e3,
            out_err_us = out_error * self.dt * 1e6,
            raw_rate_error,
            rate = rate * self.cal.srcal,
            interval,
            "pulse"
        );

        if (time_correction / self.dt).abs() > self.config.max_time_correction {
            warn!(correction_samples = time_correction / self.dt, "input rate drifting too fast");
            if self.state == PulseState::Running {
                self.reset();
                return PulseEvent::Reset;
            }
            return PulseEvent::None;
        }

        if self.state == PulseState::Acquiring && timebase_valid {
            self.outbase = second.add(1.0);
            self.state = PulseState::Running;
            info!(
                rate = rate * self.cal.srcal,
                output_epoch = %self.outbase,
                "locked to timing pulse"
            );
            return PulseEvent::Locked(self.outbase);
        }
        PulseEvent::None
    }
}
