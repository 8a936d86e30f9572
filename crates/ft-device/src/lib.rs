#![forbid(unsafe_code)]

//! Device capability queries and the execution stream used for timing.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Instant;

use ft_core::{DType, Device, TensorMeta};
use serde::{Deserialize, Serialize};

/// Allocation granularity of a caching device allocator.
pub const DEFAULT_MIN_ALLOCATION_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    Unavailable { query: &'static str },
    UnknownPrecision { device: String, dtype: DType },
    InvalidProfile { reason: String },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::Unavailable { query } => {
                write!(f, "no device available to answer {query}")
            }
            Self::UnknownPrecision { device, dtype } => {
                write!(f, "device '{device}' reports no peak throughput for {dtype:?}")
            }
            Self::InvalidProfile { reason } => write!(f, "invalid device profile: {reason}"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Throughput and bandwidth figures of the device being modeled.
pub trait DeviceCapabilities {
    /// Peak arithmetic throughput for `dtype`, in operations per second.
    fn peak_throughput(&self, dtype: DType) -> Result<f64, DeviceError>;

    /// Main-memory bandwidth in bytes per second.
    fn memory_bandwidth(&self) -> Result<f64, DeviceError>;

    /// Every allocation is rounded up to a multiple of this many bytes.
    fn min_allocation_bytes(&self) -> usize;

    /// False when no real device backs the queries.
    fn is_available(&self) -> bool {
        true
    }
}

fn default_min_allocation_bytes() -> usize {
    DEFAULT_MIN_ALLOCATION_BYTES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    /// Dense peak TFLOP/s keyed by dtype name (`f16`, `bf16`, `f32`, ...).
    pub peak_tflops: BTreeMap<String, f64>,
    pub dram_gbps: f64,
    #[serde(default = "default_min_allocation_bytes")]
    pub min_allocation_bytes: usize,
}

impl DeviceProfile {
    #[must_use]
    pub fn a100() -> Self {
        Self::preset(
            "a100",
            &[("f16", 312.0), ("bf16", 312.0), ("f32", 19.5), ("f64", 19.5)],
            2039.0,
        )
    }

    #[must_use]
    pub fn h100() -> Self {
        Self::preset(
            "h100",
            &[("f16", 989.5), ("bf16", 989.5), ("f32", 67.0), ("f64", 67.0)],
            3352.0,
        )
    }

    /// Look up a built-in profile by name.
    #[must_use]
    pub fn named(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "a100" => Some(Self::a100()),
            "h100" => Some(Self::h100()),
            _ => None,
        }
    }

    fn preset(name: &str, tflops: &[(&str, f64)], dram_gbps: f64) -> Self {
        Self {
            name: name.to_string(),
            peak_tflops: tflops
                .iter()
                .map(|(dtype, value)| ((*dtype).to_string(), *value))
                .collect(),
            dram_gbps,
            min_allocation_bytes: DEFAULT_MIN_ALLOCATION_BYTES,
        }
    }

    pub fn from_json(payload: &str) -> Result<Self, DeviceError> {
        let profile: Self =
            serde_json::from_str(payload).map_err(|error| DeviceError::InvalidProfile {
                reason: error.to_string(),
            })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load(path: &Path) -> Result<Self, DeviceError> {
        let payload =
            std::fs::read_to_string(path).map_err(|error| DeviceError::InvalidProfile {
                reason: format!("{}: {error}", path.display()),
            })?;
        Self::from_json(&payload)
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if !(self.dram_gbps.is_finite() && self.dram_gbps > 0.0) {
            return Err(DeviceError::InvalidProfile {
                reason: format!("dram_gbps must be positive, got {}", self.dram_gbps),
            });
        }
        if self.min_allocation_bytes == 0 {
            return Err(DeviceError::InvalidProfile {
                reason: "min_allocation_bytes must be at least 1".to_string(),
            });
        }
        if let Some((dtype, value)) = self
            .peak_tflops
            .iter()
            .find(|(_, value)| !(value.is_finite() && **value > 0.0))
        {
            return Err(DeviceError::InvalidProfile {
                reason: format!("peak_tflops[{dtype}] must be positive, got {value}"),
            });
        }
        Ok(())
    }
}

impl DeviceCapabilities for DeviceProfile {
    fn peak_throughput(&self, dtype: DType) -> Result<f64, DeviceError> {
        self.peak_tflops
            .get(dtype.name())
            .map(|tflops| tflops * 1e12)
            .ok_or_else(|| DeviceError::UnknownPrecision {
                device: self.name.clone(),
                dtype,
            })
    }

    fn memory_bandwidth(&self) -> Result<f64, DeviceError> {
        Ok(self.dram_gbps * 1e9)
    }

    fn min_allocation_bytes(&self) -> usize {
        self.min_allocation_bytes
    }
}

/// Provider used when no device is configured; every query fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnavailableDevice;

impl DeviceCapabilities for UnavailableDevice {
    fn peak_throughput(&self, _dtype: DType) -> Result<f64, DeviceError> {
        Err(DeviceError::Unavailable {
            query: "peak throughput",
        })
    }

    fn memory_bandwidth(&self) -> Result<f64, DeviceError> {
        Err(DeviceError::Unavailable {
            query: "memory bandwidth",
        })
    }

    fn min_allocation_bytes(&self) -> usize {
        DEFAULT_MIN_ALLOCATION_BYTES
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingEvent {
    at: Instant,
}

impl TimingEvent {
    #[must_use]
    pub fn now() -> Self {
        Self { at: Instant::now() }
    }
}

/// Ordered queue of device work with event markers.
pub trait ExecutionStream {
    fn device(&self) -> Device;

    /// Enqueue a timing marker.
    fn record(&mut self) -> TimingEvent;

    /// Block until all enqueued work has completed.
    fn synchronize(&mut self);

    /// Milliseconds between two markers recorded on this stream.
    fn elapsed_ms(&self, start: &TimingEvent, end: &TimingEvent) -> f64 {
        end.at.saturating_duration_since(start.at).as_secs_f64() * 1e3
    }
}

/// Host execution is synchronous, so markers are taken immediately.
#[derive(Debug, Default)]
pub struct HostStream {
    synchronizations: usize,
}

impl HostStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn synchronizations(&self) -> usize {
        self.synchronizations
    }
}

impl ExecutionStream for HostStream {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn record(&mut self) -> TimingEvent {
        TimingEvent::now()
    }

    fn synchronize(&mut self) {
        self.synchronizations += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_meta_device(&self, meta: &TensorMeta) -> Result<(), DeviceError> {
        let actual = meta.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}
