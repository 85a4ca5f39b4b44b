//! Sample clock disciplines.
//!
//! Two ways to find the true sample rate and time origin of a frame
//! stream: against the system clock ([`hwclock`]) or against a one pulse
//! per second timing signal recorded alongside the data ([`pulse`]).

pub mod hwclock;
pub mod median;
pub mod method;
pub mod pulse;

pub use hwclock::{ClockState, HardwareClockDiscipline};
pub use median::MedianCorrectionQueue;
pub use method::{CentroidWindow, MethodSpec, Polarity, PulseMethod};
pub use pulse::{
    CaptureBuffer, CentroidLocator, EdgeLocator, IntervalStats, PulseDiscipline, PulseEvent,
    PulseLocator, PulseState,
};

use crate::timestamp::Timestamp;

/// What the driver loop should do after a control step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Continue,
    /// The discipline has thrown away its calibration and starts over.
    Restart,
    /// The source has no more data.
    Drained,
}

/// Estimate of the sample clock built up by a discipline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    /// True rate divided by nominal rate.
    pub srcal: f64,
    /// Time of frame `ninbase`, or of output frame `ntb`.
    pub timebase: Timestamp,
    /// Input frame counter value at `timebase`, if a timebase exists.
    pub ninbase: Option<i64>,
    /// Frames since the last rate evaluation.
    pub nft: u64,
    /// Frames passed downstream.
    pub nout: u64,
    /// Output frame count accounted for in `timebase`.
    pub ntb: u64,
    /// Stability score.
    pub n: i32,
}

impl CalibrationState {
    pub fn new(srcal: f64) -> Self {
        Self {
            srcal,
            timebase: Timestamp::ZERO,
            ninbase: None,
            nft: 0,
            nout: 0,
            ntb: 0,
            n: 0,
        }
    }

    /// Estimated true sample rate.
    pub fn rate(&self, nominal: u32) -> f64 {
        nominal as f64 * self.srcal
    }
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self::new(1.0)
    }
}
