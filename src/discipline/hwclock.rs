//! Software PLL locking a free-running hardware sample clock to the
//! system clock.
//!
//! Frames arrive in batches from a sound card whose rate is only roughly
//! known. Every evaluation interval the number of frames received is
//! compared with the system clock time elapsed, and the rate estimate
//! `srcal` is nudged towards the measured rate. Once the estimate has been
//! stable for a while the discipline starts running: output frames are
//! stamped from an accumulated timebase which is slewed, a fraction of a
//! sample per block, towards the system clock.

use tracing::{debug, info, warn};

use super::{CalibrationState, ControlOutcome};
use crate::configuration::HardwareClockConfig;
use crate::error::{ConfigError, Result};
use crate::sink::FrameSink;
use crate::source::WallClock;
use crate::timestamp::Timestamp;
use crate::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Reset,
    /// Counting frames for a first rough rate estimate.
    Prerun,
    /// Refining the rate estimate until it has been stable for long enough.
    Setup,
    /// Locked. Frames are stamped and passed on.
    Run,
}

pub struct HardwareClockDiscipline<C> {
    config: HardwareClockConfig,
    sample_rate: u32,
    block_size: usize,
    skip_calibration: bool,
    clock: C,
    state: ClockState,
    cal: CalibrationState,
    /// System clock time at the start of the current evaluation interval.
    reftime: Timestamp,
    /// Timebase slew applied at each output block.
    tadj: f64,
    /// Consecutive noisy evaluations deferred while running.
    defer: u32,
    /// The next committed frame starts a new timebase, even mid-block.
    restamp: bool,
}

impl<C: WallClock> HardwareClockDiscipline<C> {
    /// `skip_calibration` is forced on for sources that are not live,
    /// since their frame rate has nothing to do with the system clock.
    pub fn new(
        config: HardwareClockConfig,
        sample_rate: u32,
        block_size: usize,
        live: bool,
        clock: C,
    ) -> std::result::Result<Self, ConfigError> {
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        if block_size == 0 {
            return Err(ConfigError::InvalidBlockSize(block_size));
        }
        let skip_calibration = config.skip_calibration || !live;
        Ok(Self {
            config,
            sample_rate,
            block_size,
            skip_calibration,
            clock,
            state: ClockState::Reset,
            cal: CalibrationState::default(),
            reftime: Timestamp::ZERO,
            tadj: 0.0,
            defer: 0,
            restamp: false,
        })
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.cal
    }

    pub fn srcal(&self) -> f64 {
        self.cal.srcal
    }

    /// Timebase slew currently applied per block, in seconds.
    pub fn slew(&self) -> f64 {
        self.tadj
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn restart(&mut self, reason: &str) -> ControlOutcome {
        warn!(reason, "restarting rate calibration");
        self.state = ClockState::Reset;
        ControlOutcome::Restart
    }

    /// Account for `frames` more frames read from the source. Call once per
    /// batch, before committing the batch's frames.
    pub fn update(&mut self, frames: usize) -> ControlOutcome {
        let rate = self.sample_rate as f64;
        self.cal.nft += frames as u64;

        if self.state == ClockState::Reset {
            self.tadj = 0.0;
            self.defer = 0;
            if self.skip_calibration {
                let start = self.config.start_time.unwrap_or_else(|| self.clock.now());
                self.cal = CalibrationState { timebase: start, ..CalibrationState::new(1.0) };
                self.reftime = start;
                self.state = ClockState::Run;
                self.restamp = true;
                info!(timebase = %start, "running uncalibrated");
                return ControlOutcome::Continue;
            }
            self.cal = CalibrationState::new(self.cal.srcal);
            self.reftime = self.clock.now();
            self.state = ClockState::Prerun;
            return ControlOutcome::Continue;
        }

        if self.state == ClockState::Prerun {
            if (self.cal.nft as f64) < self.config.prerun_secs * rate {
                return ControlOutcome::Continue;
            }
            let now = self.clock.now();
            let elapsed = now.diff(self.reftime);
            self.cal.srcal = self.cal.nft as f64 / elapsed / rate;
            self.cal.n = 0;
            self.cal.timebase = now;
            self.cal.ntb = 0;
            self.cal.nout = 0;
            self.cal.nft = 0;
            self.reftime = now;
            self.state = ClockState::Setup;
            info!(rate = self.cal.rate(self.sample_rate), "pre-run complete");
            return ControlOutcome::Continue;
        }

        if self.skip_calibration || (self.cal.nft as f64) < self.config.evaluation_secs * rate {
            return ControlOutcome::Continue;
        }

        let now = self.clock.now();
        let expected = self.cal.nft as f64 / (self.cal.srcal * rate);
        let actual = now.diff(self.reftime);
        let err = (expected - actual) / actual;
        let r = err.abs() * self.block_size as f64 / self.config.error_scale;
        let raw_rate = self.cal.nft as f64 / actual;

        match self.state {
            ClockState::Setup => {
                self.cal.srcal *= 1.0 + err * self.config.setup_gain;
                self.reftime = now;
                self.cal.nft = 0;
                debug!(
                    n = self.cal.n,
                    err,
                    r,
                    raw_rate,
                    rate = self.cal.rate(self.sample_rate),
                    "setup"
                );
                if r > self.config.reset_ratio {
                    return self.restart("rate error too large");
                }

                let n = self.cal.n;
                self.cal.n = if r < 0.1 && n >= 0 {
                    n + 3
                } else if r < 0.5 && n >= 0 {
                    n + 2
                } else if r < 1.0 && n >= 0 {
                    n + 1
                } else if r < 1.0 {
                    0
                } else {
                    n - 1
                };

                if self.cal.n <= self.config.drift_score {
                    return self.restart("persistent drift");
                }
                if self.cal.n >= self.config.stable_score {
                    self.state = ClockState::Run;
                    self.cal.timebase = self.reftime;
                    self.cal.ntb = 0;
                    self.cal.nout = 0;
                    self.restamp = true;
                    info!(
                        rate = self.cal.rate(self.sample_rate),
                        timebase = %self.cal.timebase,
                        "running"
                    );
                }
                ControlOutcome::Continue
            }
            ClockState::Run => {
                if r > self.config.defer_threshold && self.defer <= self.config.max_defer {
                    self.defer += 1;
                    debug!(r, defer = self.defer, "deferred noisy evaluation");
                    return ControlOutcome::Continue;
                }

                self.cal.srcal *= 1.0 + err * self.config.run_gain;
                self.cal.timebase = self.cal.timebase.add(expected);
                self.cal.ntb += self.cal.nft;
                self.reftime = now;
                self.cal.nft = 0;
                self.defer = 0;

                let offset = self.cal.timebase.diff(self.reftime);
                let limit = self.config.max_slew_samples / rate;
                let blocks = self.config.slew_secs * rate / self.block_size as f64;
                self.tadj = (offset / blocks).clamp(-limit, limit);
                debug!(
                    err,
                    r,
                    raw_rate,
                    rate = self.cal.rate(self.sample_rate),
                    offset_ms = offset * 1e3,
                    tadj_us = self.tadj * 1e6,
                    "run"
                );
                if offset.abs() > self.config.offset_limit {
                    return self.restart("timebase error");
                }
                ControlOutcome::Continue
            }
            ClockState::Reset | ClockState::Prerun => ControlOutcome::Continue,
        }
    }

    /// Stamp and pass on one frame. Frames are dropped unless running.
    ///
    /// The first frame after (re)entering `Run` always declares a new
    /// timebase, so a block left open by a restart is released short
    /// rather than continued with a stale timestamp.
    pub fn commit_frame<K: FrameSink + ?Sized>(
        &mut self,
        frame: &[Sample],
        sink: &mut K,
    ) -> Result<()> {
        if self.state != ClockState::Run {
            return Ok(());
        }
        let block_start = sink.at_block_start();
        let restamp = std::mem::take(&mut self.restamp);
        if block_start {
            self.cal.timebase = self.cal.timebase.add(-self.tadj);
        }
        if block_start || restamp {
            let rate = self.cal.srcal * self.sample_rate as f64;
            let frames = self.cal.nout as i64 - self.cal.ntb as i64;
            let stamp = self.cal.timebase.add(frames as f64 / rate);
            sink.set_output_timebase(stamp, self.cal.srcal)?;
        }
        sink.emit_frame(frame)?;
        self.cal.nout += 1;
        Ok(())
    }
}
