use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ft_device::DeviceProfile;
use serde::{Deserialize, Serialize};

use crate::error::EstimateError;

/// Setting this to `1` models a device without a caching allocator, so
/// allocations are no longer rounded up to the caching block size.
pub const NO_CACHING_ENV: &str = "FT_NO_DEVICE_MEMORY_CACHING";

/// How each intercepted operation is timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EstimateMode {
    /// Realize operands and time the host kernel.
    #[default]
    #[serde(rename = "operator-level-benchmark")]
    Benchmark,
    /// Analytical roofline model.
    #[serde(rename = "operator-level-cost-model")]
    CostModel,
    /// Roofline transfer bound with a learned compute predictor.
    #[serde(rename = "operator-level-learned-model")]
    LearnedModel,
}

impl EstimateMode {
    #[must_use]
    pub const fn all() -> &'static [EstimateMode] {
        &[Self::Benchmark, Self::CostModel, Self::LearnedModel]
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Benchmark => "operator-level-benchmark",
            Self::CostModel => "operator-level-cost-model",
            Self::LearnedModel => "operator-level-learned-model",
        }
    }
}

impl fmt::Display for EstimateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EstimateMode {
    type Err = EstimateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|mode| mode.label() == value)
            .ok_or_else(|| EstimateError::UnsupportedMode {
                name: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub mode: EstimateMode,
    /// Modeled device. Without one, cost-model queries fail when first used.
    pub device: Option<DeviceProfile>,
    /// Directory holding `<group>/predictor.json` files for the learned mode.
    pub predictor_root: PathBuf,
    pub warmup_iters: usize,
    pub timed_iters: usize,
    /// Fraction of peak throughput a kernel is expected to reach.
    pub efficiency_factor: f64,
    /// Seed for the random fill of realized operands.
    pub benchmark_seed: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            mode: EstimateMode::default(),
            device: None,
            predictor_root: PathBuf::from("."),
            warmup_iters: 2,
            timed_iters: 3,
            efficiency_factor: 0.75,
            benchmark_seed: 0,
        }
    }
}

impl EstimatorConfig {
    #[must_use]
    pub fn new(mode: EstimateMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = Some(device);
        self
    }

    #[must_use]
    pub fn with_predictor_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.predictor_root = root.into();
        self
    }

    pub fn from_json(payload: &str) -> Result<Self, EstimateError> {
        let config: Self =
            serde_json::from_str(payload).map_err(|error| EstimateError::InvalidConfig {
                reason: error.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EstimateError> {
        let payload =
            std::fs::read_to_string(path).map_err(|error| EstimateError::InvalidConfig {
                reason: format!("{}: {error}", path.display()),
            })?;
        Self::from_json(&payload)
    }

    pub fn validate(&self) -> Result<(), EstimateError> {
        if self.timed_iters == 0 {
            return Err(EstimateError::InvalidConfig {
                reason: "timed_iters must be at least 1".to_string(),
            });
        }
        if !(self.efficiency_factor > 0.0 && self.efficiency_factor <= 1.0) {
            return Err(EstimateError::InvalidConfig {
                reason: format!(
                    "efficiency_factor must lie in (0, 1], got {}",
                    self.efficiency_factor
                ),
            });
        }
        if let Some(device) = &self.device {
            device.validate()?;
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    #[must_use]
    pub fn apply_env(self) -> Self {
        let value = std::env::var(NO_CACHING_ENV).ok();
        self.apply_no_caching(value.as_deref())
    }

    fn apply_no_caching(mut self, value: Option<&str>) -> Self {
        if value == Some("1") {
            if let Some(device) = self.device.as_mut() {
                device.min_allocation_bytes = 1;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use ft_device::DeviceProfile;

    use super::{EstimateMode, EstimatorConfig};
    use crate::error::EstimateError;

    #[test]
    fn mode_names_parse_and_print() {
        for mode in EstimateMode::all() {
            assert_eq!(mode.label().parse::<EstimateMode>().expect("parse"), *mode);
        }
        let err = "operator-level-learned-cost-model"
            .parse::<EstimateMode>()
            .expect_err("unsupported");
        assert!(matches!(err, EstimateError::UnsupportedMode { .. }));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn json_config_fills_defaults() {
        let config = EstimatorConfig::from_json(
            r#"{"mode": "operator-level-cost-model", "device": {"name": "toy", "peak_tflops": {"f32": 2.0}, "dram_gbps": 10.0}}"#,
        )
        .expect("config");
        assert_eq!(config.mode, EstimateMode::CostModel);
        assert_eq!(config.warmup_iters, 2);
        assert_eq!(config.timed_iters, 3);
        assert_eq!(config.efficiency_factor, 0.75);
        assert_eq!(config.device.expect("device").min_allocation_bytes, 512);
    }

    #[test]
    fn unknown_mode_in_json_is_rejected() {
        let err = EstimatorConfig::from_json(r#"{"mode": "operator-level-guess"}"#)
            .expect_err("bad mode");
        assert!(matches!(err, EstimateError::InvalidConfig { .. }));
    }

    #[test]
    fn zero_timed_iterations_are_rejected() {
        let err = EstimatorConfig::from_json(r#"{"timed_iters": 0}"#).expect_err("zero iters");
        assert!(err.to_string().contains("timed_iters"));
    }

    #[test]
    fn disabling_allocator_caching_drops_granularity() {
        let config = EstimatorConfig::new(EstimateMode::CostModel).with_device(DeviceProfile::a100());
        let unchanged = config.clone().apply_no_caching(Some("0"));
        assert_eq!(unchanged.device.expect("device").min_allocation_bytes, 512);
        let uncached = config.apply_no_caching(Some("1"));
        assert_eq!(uncached.device.expect("device").min_allocation_bytes, 1);
    }
}
