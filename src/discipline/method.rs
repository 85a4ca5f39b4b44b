//! Timing method selection, parsed from option strings such as
//! `ppsbase+,c=0.001,w=auto`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }

    fn suffix(self) -> char {
        match self {
            Polarity::Positive => '+',
            Polarity::Negative => '-',
        }
    }
}

/// Integration window for the centroid estimate, in seconds either side
/// of the peak sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CentroidWindow {
    /// Extend both ways from the peak while above 1 % of the peak value.
    Auto,
    Fixed(f64),
    Asymmetric { before: f64, after: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PulseMethod {
    /// No timing signal. Trust the input timestamps.
    None,
    /// Half-amplitude point of the leading edge.
    Edge { polarity: Polarity },
    /// Energy centroid, offset back by the known delay of the centroid
    /// after the true second.
    Centroid { polarity: Polarity, offset: f64, window: CentroidWindow },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MethodSpec {
    pub method: PulseMethod,
    /// Reject captures whose peak/mean ratio is too low to be a pulse.
    pub check_peak_mean: bool,
}

impl MethodSpec {
    pub fn is_untimed(&self) -> bool {
        self.method == PulseMethod::None
    }
}

fn seconds(option: &str, value: &str) -> Result<f64, ConfigError> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(ConfigError::InvalidMethodValue {
            option: option.to_string(),
            value: value.to_string(),
        }),
    }
}

impl FromStr for MethodSpec {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        enum Kind {
            None,
            Edge(Polarity),
            Centroid(Polarity),
        }
        let mut kind = None;
        let mut offset = None;
        let mut width = None;
        let mut explicit_auto = false;
        let mut before = 0.0;
        let mut after = 0.0;
        let mut check_peak_mean = true;

        for option in text.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option {
                "none" => kind = Some(Kind::None),
                "ppsbase+" => kind = Some(Kind::Centroid(Polarity::Positive)),
                "ppsbase-" => kind = Some(Kind::Centroid(Polarity::Negative)),
                "ppsedge+" => kind = Some(Kind::Edge(Polarity::Positive)),
                "ppsedge-" => kind = Some(Kind::Edge(Polarity::Negative)),
                "noppm" => check_peak_mean = false,
                "w=auto" => explicit_auto = true,
                _ => match option.split_once('=') {
                    Some(("c", v)) => offset = Some(seconds("c", v)?),
                    Some(("w", v)) => width = Some(seconds("w", v)?),
                    Some(("w1", v)) => before = seconds("w1", v)?,
                    Some(("w2", v)) => after = seconds("w2", v)?,
                    _ => return Err(ConfigError::UnknownMethodOption(option.to_string())),
                },
            }
        }

        let method = match kind.ok_or(ConfigError::MissingMethod)? {
            Kind::None => PulseMethod::None,
            Kind::Edge(polarity) => PulseMethod::Edge { polarity },
            Kind::Centroid(polarity) => {
                let window = if before > 0.0 && after > 0.0 {
                    CentroidWindow::Asymmetric { before, after }
                } else if let Some(width) = width {
                    CentroidWindow::Fixed(width)
                } else if explicit_auto {
                    CentroidWindow::Auto
                } else if let Some(offset) = offset {
                    // c= alone fixes the window at 1.1 c either side of the peak
                    CentroidWindow::Fixed(1.1 * offset)
                } else {
                    CentroidWindow::Auto
                };
                PulseMethod::Centroid { polarity, offset: offset.unwrap_or(0.0), window }
            }
        };
        Ok(Self { method, check_peak_mean })
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            PulseMethod::None => f.write_str("none")?,
            PulseMethod::Edge { polarity } => write!(f, "ppsedge{}", polarity.suffix())?,
            PulseMethod::Centroid { polarity, offset, window } => {
                write!(f, "ppsbase{},c={}", polarity.suffix(), offset)?;
                match window {
                    CentroidWindow::Auto => f.write_str(",w=auto")?,
                    CentroidWindow::Fixed(width) => write!(f, ",w={}", width)?,
                    CentroidWindow::Asymmetric { before, after } => {
                        write!(f, ",w1={},w2={}", before, after)?
                    }
                }
            }
        }
        if !self.check_peak_mean {
            f.write_str(",noppm")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for MethodSpec {
    type Error = ConfigError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<MethodSpec> for String {
    fn from(spec: MethodSpec) -> String {
        spec.to_string()
    }
}
