use std::path::{Path, PathBuf};

pub use clap::Parser;
use clap::{ArgAction, Args, Subcommand};
use serde::{Deserialize, Serialize};

use crate::discipline::MethodSpec;
use crate::error::ConfigError;
use crate::timestamp::Timestamp;

/// Tuning of the hardware-clock software PLL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareClockConfig {
    /// Seconds of free running before the first rate estimate.
    pub prerun_secs: f64,
    /// Seconds of input between rate evaluations.
    pub evaluation_secs: f64,
    /// Fraction of the relative rate error applied per evaluation while
    /// settling.
    pub setup_gain: f64,
    /// Same, once running.
    pub run_gain: f64,
    /// The relative rate error is multiplied by block size and divided by
    /// this to give the normalised error `r`.
    pub error_scale: f64,
    /// Normalised error above which settling starts over.
    pub reset_ratio: f64,
    /// Stability score needed to start running.
    pub stable_score: i32,
    /// Stability score at which settling starts over.
    pub drift_score: i32,
    /// Normalised error above which a running evaluation is deferred.
    pub defer_threshold: f64,
    pub max_defer: u32,
    /// Timebase offsets are slewed out over this many seconds worth of
    /// blocks.
    pub slew_secs: f64,
    /// Largest timebase slew per block, in samples.
    pub max_slew_samples: f64,
    /// Timebase offset in seconds that forces a reset.
    pub offset_limit: f64,
    /// Run at the nominal rate without any calibration.
    pub skip_calibration: bool,
    /// Timebase for uncalibrated operation. Defaults to the time of the
    /// first read.
    pub start_time: Option<Timestamp>,
}

impl Default for HardwareClockConfig {
    fn default() -> Self {
        Self {
            prerun_secs: 20.0,
            evaluation_secs: 10.0,
            setup_gain: 0.15,
            run_gain: 0.05,
            error_scale: 2.5,
            reset_ratio: 20.0,
            stable_score: 10,
            drift_score: -10,
            defer_threshold: 0.5,
            max_defer: 3,
            slew_secs: 10.0,
            max_slew_samples: 0.25,
            offset_limit: 20e-3,
            skip_calibration: false,
            start_time: None,
        }
    }
}

/// Tuning of the pulse discipline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Channel carrying the timing signal, counting from 0.
    pub timing_channel: usize,
    pub method: Option<MethodSpec>,
    /// Half-width in seconds of the capture window centred on each second.
    pub half_width: f64,
    /// Captures with a lower peak to mean ratio are not pulses.
    pub min_peak_mean_ratio: f64,
    /// Relative deviation of a pulse interval from the nominal rate beyond
    /// which the pulse is ignored.
    pub interval_tolerance: f64,
    /// Correction smoothing divisor while acquiring.
    pub acquire_divisor: f64,
    /// Correction smoothing divisor once running.
    pub steady_divisor: f64,
    /// Largest acceptable timebase correction, in samples.
    pub max_time_correction: f64,
    /// Time constant in seconds of the interval statistics.
    pub stats_time_constant: f64,
    /// Keep the timing channel in the output.
    pub output_timing_channel: bool,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            timing_channel: 0,
            method: None,
            half_width: 0.45,
            min_peak_mean_ratio: 30.0,
            interval_tolerance: 1e-3,
            acquire_divisor: 2.0,
            steady_divisor: 6.0,
            max_time_correction: 0.5,
            stats_time_constant: 20.0,
            output_timing_channel: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames per output block. Chosen from the sample rate if not given.
    pub block_size: Option<usize>,
}

/// Largest number of frames in one output block.
pub const MAX_BLOCK_SIZE: usize = 262_144;

/// Largest channel count accepted in a block stream.
pub const MAX_CHANNELS: usize = 1024;

impl StreamConfig {
    pub fn block_size_for(&self, sample_rate: u32) -> Result<usize, ConfigError> {
        match self.block_size {
            Some(size) if size == 0 || size > MAX_BLOCK_SIZE => {
                Err(ConfigError::InvalidBlockSize(size))
            }
            Some(size) => Ok(size),
            None => Ok(choose_block_size(sample_rate)),
        }
    }
}

/// Frames per block for a sample rate. Low rates get at least 3 blocks a
/// second, high rates at most 25 up to [`MAX_BLOCK_SIZE`].
pub fn choose_block_size(sample_rate: u32) -> usize {
    let rate = sample_rate as usize;
    let mut size = 8192;
    if rate < 16000 {
        while size > 1 && rate / size < 3 {
            size /= 2;
        }
    } else if rate > 192000 {
        while size < MAX_BLOCK_SIZE && rate / size > 25 {
            size *= 2;
        }
    }
    size
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hardware_clock: HardwareClockConfig,
    pub pulse: PulseConfig,
    pub stream: StreamConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }
}

#[derive(Parser)]
#[command(name = "vlfclock", version, about = "Sample clock discipline and resampling")]
pub struct Cli {
    /// Increase log verbosity. Repeat for more.
    /// RUST_LOG overrides this if set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML file with tuning parameters.
    /// Command line options override values from the file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Timestamp raw PCM from a sound card, tracking its sample rate
    /// against the system clock.
    Card(CardArgs),
    /// Discipline a timestamped block stream with a timing pulse and
    /// resample it onto an exact UT-aligned grid.
    Time(TimeArgs),
}

#[derive(Args)]
pub struct CardArgs {
    /// Nominal sample rate in Hertz.
    #[arg(short = 'r', long)]
    pub rate: u32,

    #[arg(short = 'c', long, default_value_t = 2)]
    pub channels: usize,

    /// Bits per sample: 8, 16, 24 or 32.
    #[arg(short = 'b', long, default_value_t = 16)]
    pub bits: u32,

    /// 24 bit samples are packed in 3 bytes,
    /// instead of the low 3 bytes of 4.
    #[arg(long)]
    pub packed24: bool,

    #[arg(short = 'g', long, default_value_t = 1.0)]
    pub gain: f64,

    /// Input is a real-time capture.
    /// Without this, input is read as a recording and no
    /// rate calibration is done.
    #[arg(long)]
    pub live: bool,

    /// Don't calibrate, use the nominal sample rate.
    #[arg(short = 'u', long)]
    pub uncalibrated: bool,

    /// Timestamp of the first sample when not calibrating.
    /// Default is the time of the first read.
    #[arg(short = 'T', long)]
    pub start: Option<Timestamp>,

    /// Frames per output block.
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Frames per read from the input.
    #[arg(long, default_value_t = 1024)]
    pub read_frames: usize,

    /// Output file, - for stdout.
    #[arg(default_value = "-")]
    pub output: String,
}

impl CardArgs {
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::InvalidSampleRate(self.rate));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannels(self.channels));
        }
        if self.uncalibrated {
            config.hardware_clock.skip_calibration = true;
        }
        if self.start.is_some() {
            config.hardware_clock.start_time = self.start;
        }
        if self.block_size.is_some() {
            config.stream.block_size = self.block_size;
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct TimeArgs {
    /// Channel carrying the timing signal, counting from 1.
    #[arg(short = 'c', long)]
    pub timing_channel: Option<usize>,

    /// Timing method and its options, for example:
    /// ppsbase+,c=0.001 or ppsedge- or none.
    /// Options: c=offset w=width|auto w1=before w2=after noppm
    #[arg(short = 'm', long)]
    pub method: Option<MethodSpec>,

    /// Keep the timing channel in the output.
    #[arg(long)]
    pub keep_timing_channel: bool,

    /// Frames per output block.
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Input file, - for stdin.
    #[arg(default_value = "-")]
    pub input: String,

    /// Output file, - for stdout.
    #[arg(default_value = "-")]
    pub output: String,
}

impl TimeArgs {
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(channel) = self.timing_channel {
            if channel == 0 {
                return Err(ConfigError::InvalidChannel { channel, channels: 0 });
            }
            config.pulse.timing_channel = channel - 1;
        }
        if self.method.is_some() {
            config.pulse.method = self.method;
        }
        if self.keep_timing_channel {
            config.pulse.output_timing_channel = true;
        }
        if self.block_size.is_some() {
            config.stream.block_size = self.block_size;
        }
        Ok(())
    }
}

impl Cli {
    /// Configuration file if given, then command line overrides.
    pub fn resolve_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        match &self.command {
            Command::Card(args) => args.apply(&mut config)?,
            Command::Time(args) => args.apply(&mut config)?,
        }
        Ok(config)
    }
}
