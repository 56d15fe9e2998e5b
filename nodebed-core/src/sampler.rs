//! Value sources for delays and other sampled service parameters.
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::Error;

const MAX_REJECTIONS: usize = 1000;

/// Longest pause a sampled duration may produce.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Produces the next value of a configured distribution.
pub trait ValueSource {
    fn next_value(&mut self) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerConfig {
    Constant {
        value: f64,
    },
    Uniform {
        low: f64,
        high: f64,
    },
    TruncatedNormal {
        mean: f64,
        std_dev: f64,
        low: f64,
        high: f64,
    },
    Sequential {
        values: Vec<f64>,
        #[serde(default)]
        cycle: bool,
    },
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig::Constant { value: 1.0 }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let finite = |name: &str, v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(Error::Config(format!("sampler {name} must be finite")))
            }
        };
        match self {
            SamplerConfig::Constant { value } => finite("value", *value),
            SamplerConfig::Uniform { low, high } => {
                finite("low", *low)?;
                finite("high", *high)?;
                if low > high {
                    return Err(Error::Config(format!(
                        "uniform sampler low {low} is above high {high}"
                    )));
                }
                Ok(())
            }
            SamplerConfig::TruncatedNormal {
                mean,
                std_dev,
                low,
                high,
            } => {
                finite("mean", *mean)?;
                finite("std_dev", *std_dev)?;
                finite("low", *low)?;
                finite("high", *high)?;
                if *std_dev <= 0.0 {
                    return Err(Error::Config("truncated normal std_dev must be positive".into()));
                }
                if low > high {
                    return Err(Error::Config(format!(
                        "truncated normal low {low} is above high {high}"
                    )));
                }
                Ok(())
            }
            SamplerConfig::Sequential { values, .. } => {
                if values.is_empty() {
                    return Err(Error::Config("sequential sampler needs values".into()));
                }
                values.iter().try_for_each(|v| finite("values", *v))
            }
        }
    }
}

pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
    position: usize,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::from_entropy(),
            position: 0,
        })
    }

    pub fn with_seed(config: SamplerConfig, seed: u64) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            position: 0,
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Next value read as seconds, clamped to `0..=MAX_DELAY`.
    pub fn next_duration(&mut self) -> Duration {
        Duration::try_from_secs_f64(self.next_value().max(0.0))
            .map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
    }

    fn standard_normal(&mut self) -> f64 {
        // Box-Muller; 1 - u keeps the log argument away from zero.
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

impl ValueSource for Sampler {
    fn next_value(&mut self) -> f64 {
        match &self.config {
            SamplerConfig::Constant { value } => *value,
            SamplerConfig::Uniform { low, high } => {
                let (low, high) = (*low, *high);
                if low == high {
                    return low;
                }
                self.rng.gen_range(low..=high)
            }
            SamplerConfig::TruncatedNormal {
                mean,
                std_dev,
                low,
                high,
            } => {
                let (mean, std_dev, low, high) = (*mean, *std_dev, *low, *high);
                for _ in 0..MAX_REJECTIONS {
                    let v = mean + std_dev * self.standard_normal();
                    if (low..=high).contains(&v) {
                        return v;
                    }
                }
                mean.clamp(low, high)
            }
            SamplerConfig::Sequential { values, cycle } => {
                let v = values[self.position.min(values.len() - 1)];
                if self.position + 1 < values.len() {
                    self.position += 1;
                } else if *cycle {
                    self.position = 0;
                }
                v
            }
        }
    }
}
