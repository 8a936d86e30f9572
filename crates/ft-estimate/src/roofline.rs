//! Roofline cost model.
//!
//! An operation is bound either by arithmetic or by memory traffic:
//! `time = max(flops / peak, bytes / bandwidth)`. The arithmetic bound uses
//! multiply-accumulate units (half the FLOPs) against a fraction of the
//! device's theoretical peak.

use std::collections::BTreeSet;

use ft_core::{DType, OpInvocation, OpKind, Tensor, TensorMeta};
use ft_device::DeviceCapabilities;
use serde::Serialize;

use crate::error::EstimateError;
use crate::flops::FlopRegistry;
use crate::transfer::{transfer_bytes, transfer_time_ms};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RooflineEstimate {
    pub transfer_ms: f64,
    pub compute_ms: f64,
}

impl RooflineEstimate {
    #[must_use]
    pub fn total_ms(&self) -> f64 {
        self.transfer_ms.max(self.compute_ms)
    }
}

/// Distinct floating dtypes among `outputs`, in dtype order.
#[must_use]
pub fn floating_output_dtypes(outputs: &[Tensor]) -> Vec<DType> {
    outputs
        .iter()
        .map(|tensor| tensor.meta().dtype())
        .filter(|dtype| dtype.is_floating())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The one floating output dtype whose peak throughput applies to `op`.
pub fn output_precision(op: OpKind, outputs: &[Tensor]) -> Result<DType, EstimateError> {
    match floating_output_dtypes(outputs).as_slice() {
        [dtype] => Ok(*dtype),
        dtypes => Err(EstimateError::AmbiguousPrecision {
            op,
            dtypes: dtypes.to_vec(),
        }),
    }
}

/// Milliseconds for `flops` at `efficiency` of `peak` operations per second.
#[must_use]
pub fn compute_time_ms(flops: f64, peak: f64, efficiency: f64) -> f64 {
    let macs = flops / 2.0;
    macs / (efficiency * peak) * 1e3
}

pub(crate) fn output_metas(outputs: &[Tensor]) -> Vec<TensorMeta> {
    outputs.iter().map(|tensor| tensor.meta().clone()).collect()
}

/// Memory-traffic bound of `inv` producing `outputs`.
pub fn memory_bound_ms(
    inv: &OpInvocation,
    outputs: &[Tensor],
    device: &dyn DeviceCapabilities,
) -> Result<f64, EstimateError> {
    let bandwidth = device.memory_bandwidth()?;
    let bytes = transfer_bytes(inv.tensors(), outputs, device.min_allocation_bytes());
    Ok(transfer_time_ms(bytes, bandwidth))
}

/// Roofline estimate of `inv` given its already inferred `outputs`.
pub fn estimate(
    inv: &OpInvocation,
    outputs: &[Tensor],
    device: &dyn DeviceCapabilities,
    flops: &FlopRegistry,
    efficiency: f64,
) -> Result<RooflineEstimate, EstimateError> {
    if inv.kind.is_cost_free() {
        return Ok(RooflineEstimate::default());
    }
    let transfer_ms = memory_bound_ms(inv, outputs, device)?;
    let compute_ms = match flops.lookup(inv.kind) {
        Some(formula) => {
            let dtype = output_precision(inv.kind, outputs)?;
            let peak = device.peak_throughput(dtype)?;
            let count = formula(inv, &output_metas(outputs))?;
            compute_time_ms(count, peak, efficiency)
        }
        None => 0.0,
    };
    Ok(RooflineEstimate {
        transfer_ms,
        compute_ms,
    })
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, Device, OpInvocation, OpKind, Operand, SymbolicTensor, Tensor, TensorMeta};
    use ft_device::{DeviceProfile, UnavailableDevice};

    use super::{
        RooflineEstimate, compute_time_ms, estimate, floating_output_dtypes, output_precision,
    };
    use crate::error::EstimateError;
    use crate::flops::FlopRegistry;

    fn placeholder(shape: &[usize], dtype: DType) -> Tensor {
        let meta = TensorMeta::from_shape(shape.to_vec(), dtype, Device::Cpu);
        Tensor::Symbolic(SymbolicTensor::new(meta, 0).expect("placeholder"))
    }

    fn toy_device() -> DeviceProfile {
        DeviceProfile::from_json(
            r#"{"name": "toy", "peak_tflops": {"f16": 1.0, "f32": 0.5}, "dram_gbps": 1.0}"#,
        )
        .expect("profile")
    }

    #[test]
    fn compute_bound_uses_macs_and_efficiency() {
        let ms = compute_time_ms(2.0e12, 1.0e12, 0.5);
        assert!((ms - 2.0e3).abs() < 1e-9);
    }

    #[test]
    fn mixed_floating_outputs_are_ambiguous() {
        let outputs = [placeholder(&[2], DType::BF16), placeholder(&[2], DType::F32)];
        assert_eq!(floating_output_dtypes(&outputs), vec![DType::BF16, DType::F32]);
        assert!(matches!(
            output_precision(OpKind::SdpaFlash, &outputs),
            Err(EstimateError::AmbiguousPrecision { .. })
        ));
        let integer_only = [placeholder(&[2], DType::I64)];
        assert!(output_precision(OpKind::Sum, &integer_only).is_err());
    }

    #[test]
    fn no_formula_reduces_to_transfer_time() {
        let device = toy_device();
        let x = placeholder(&[1000], DType::F32);
        let y = placeholder(&[1000], DType::F32);
        let inv = OpInvocation::new(OpKind::Relu, vec![Operand::Tensor(x)]);
        let result = estimate(&inv, &[y], &device, &FlopRegistry::with_defaults(), 0.75)
            .expect("estimate");
        assert_eq!(result.compute_ms, 0.0);
        let expected = 2.0 * 4096.0 / 1.0e9 * 1e3;
        assert!((result.total_ms() - expected).abs() < 1e-12);
    }

    #[test]
    fn cost_free_kinds_have_no_modeled_cost() {
        let x = placeholder(&[4, 4], DType::F32);
        let inv = OpInvocation::new(OpKind::T, vec![Operand::Tensor(x.clone())]);
        let result = estimate(&inv, &[x], &toy_device(), &FlopRegistry::with_defaults(), 0.75)
            .expect("views are free");
        assert_eq!(result, RooflineEstimate::default());
    }

    #[test]
    fn unavailable_device_fails_on_use() {
        let x = placeholder(&[4], DType::F32);
        let inv = OpInvocation::new(OpKind::Relu, vec![Operand::Tensor(x.clone())]);
        let err = estimate(&inv, &[x], &UnavailableDevice, &FlopRegistry::empty(), 0.75)
            .expect_err("no device");
        assert!(matches!(err, EstimateError::Device(_)));
    }
}
