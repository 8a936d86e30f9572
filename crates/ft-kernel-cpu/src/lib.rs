#![forbid(unsafe_code)]

//! Host kernels and output-metadata inference for every [`OpKind`].
//!
//! Metadata inference is shared by symbolic execution (placeholders only) and
//! real execution, so both paths agree on shapes, dtypes and aliasing.

mod meta;
mod ops;

use std::fmt;

use ft_core::{
    DType, Device, OpInvocation, OpKind, Operand, RealTensor, Tensor, TensorCompatError,
    TensorMetaError,
};
use rand::rngs::StdRng;

pub use meta::{OutputOrigin, OutputSpec, broadcast_shapes, infer_outputs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Meta(TensorMetaError),
    Incompatible(TensorCompatError),
    ShapeMismatch {
        op: OpKind,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    MissingOperand {
        op: OpKind,
        index: usize,
    },
    InvalidOperand {
        op: OpKind,
        index: usize,
        expected: &'static str,
    },
    InvalidArgument {
        op: OpKind,
        reason: String,
    },
    SymbolicOperand {
        op: OpKind,
        index: usize,
    },
    UnsupportedLayout {
        op: OpKind,
    },
    UnsupportedDevice {
        op: OpKind,
        device: Device,
    },
    Unsupported {
        op: OpKind,
        reason: &'static str,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(error) => write!(f, "invalid tensor metadata: {error}"),
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::ShapeMismatch { op, lhs, rhs } => {
                write!(f, "{op}: shape mismatch lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::MissingOperand { op, index } => {
                write!(f, "{op}: missing operand at position {index}")
            }
            Self::InvalidOperand {
                op,
                index,
                expected,
            } => write!(f, "{op}: operand {index} is not {expected}"),
            Self::InvalidArgument { op, reason } => write!(f, "{op}: {reason}"),
            Self::SymbolicOperand { op, index } => write!(
                f,
                "{op}: operand {index} is symbolic and cannot feed a real kernel"
            ),
            Self::UnsupportedLayout { op } => {
                write!(f, "{op}: sparse operands have no host kernel")
            }
            Self::UnsupportedDevice { op, device } => {
                write!(f, "{op}: no host kernel for device {device:?}")
            }
            Self::Unsupported { op, reason } => write!(f, "{op}: unsupported: {reason}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorMetaError> for KernelError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

/// Run `inv` on the host. Every tensor operand must be real and on the CPU.
///
/// Fresh outputs get new storage; view outputs share the input storage;
/// in-place outputs return the input handle after writing into it.
pub fn execute(inv: &OpInvocation, rng: &mut StdRng) -> Result<Vec<RealTensor>, KernelError> {
    let specs = infer_outputs(inv)?;
    ensure_host_operands(inv, &specs)?;

    let mut fresh_values = ops::compute_fresh(inv, &specs, rng)?.into_iter();
    let mut outputs = Vec::with_capacity(specs.len());
    for spec in specs {
        let tensor = match spec.origin {
            OutputOrigin::Fresh => {
                let values = fresh_values.next().ok_or(KernelError::Unsupported {
                    op: inv.kind,
                    reason: "kernel produced fewer outputs than inferred",
                })?;
                RealTensor::from_values(values, spec.meta)?
            }
            OutputOrigin::View { input } => real_at(inv, input)?.view_with(spec.meta)?,
            OutputOrigin::InPlace { input } => {
                let target = real_at(inv, input)?;
                if inv.kind.tags().inplace_view {
                    target.restrided(spec.meta)?
                } else {
                    let values = ops::compute_inplace(inv, target)?;
                    target.write_values(&values)?;
                    target.clone()
                }
            }
        };
        outputs.push(tensor);
    }
    Ok(outputs)
}

fn ensure_host_operands(inv: &OpInvocation, specs: &[OutputSpec]) -> Result<(), KernelError> {
    let computes = !inv.kind.tags().view && !inv.kind.tags().create;
    for (index, operand) in inv.args.iter().enumerate() {
        let Operand::Tensor(tensor) = operand else {
            continue;
        };
        let Tensor::Real(real) = tensor else {
            return Err(KernelError::SymbolicOperand { op: inv.kind, index });
        };
        if real.meta().device() != Device::Cpu {
            return Err(KernelError::UnsupportedDevice {
                op: inv.kind,
                device: real.meta().device(),
            });
        }
        if computes && real.meta().is_sparse() {
            return Err(KernelError::UnsupportedLayout { op: inv.kind });
        }
    }
    if let Some(spec) = specs.iter().find(|spec| spec.meta.device() != Device::Cpu) {
        return Err(KernelError::UnsupportedDevice {
            op: inv.kind,
            device: spec.meta.device(),
        });
    }
    Ok(())
}

pub(crate) fn operand_at(inv: &OpInvocation, index: usize) -> Result<&Operand, KernelError> {
    inv.args.get(index).ok_or(KernelError::MissingOperand {
        op: inv.kind,
        index,
    })
}

pub(crate) fn tensor_at(inv: &OpInvocation, index: usize) -> Result<&Tensor, KernelError> {
    operand_at(inv, index)?
        .as_tensor()
        .ok_or(KernelError::InvalidOperand {
            op: inv.kind,
            index,
            expected: "a tensor",
        })
}

pub(crate) fn optional_tensor_at(
    inv: &OpInvocation,
    index: usize,
) -> Result<Option<&Tensor>, KernelError> {
    match inv.args.get(index) {
        None | Some(Operand::None) => Ok(None),
        Some(Operand::Tensor(tensor)) => Ok(Some(tensor)),
        Some(_) => Err(KernelError::InvalidOperand {
            op: inv.kind,
            index,
            expected: "a tensor or none",
        }),
    }
}

pub(crate) fn real_at(inv: &OpInvocation, index: usize) -> Result<&RealTensor, KernelError> {
    tensor_at(inv, index)?
        .as_real()
        .ok_or(KernelError::SymbolicOperand { op: inv.kind, index })
}

pub(crate) fn int_at(inv: &OpInvocation, index: usize) -> Result<i64, KernelError> {
    match operand_at(inv, index)? {
        Operand::Int(value) => Ok(*value),
        _ => Err(KernelError::InvalidOperand {
            op: inv.kind,
            index,
            expected: "an integer",
        }),
    }
}

pub(crate) fn optional_int_at(inv: &OpInvocation, index: usize) -> Result<Option<i64>, KernelError> {
    match inv.args.get(index) {
        None | Some(Operand::None) => Ok(None),
        Some(_) => int_at(inv, index).map(Some),
    }
}

pub(crate) fn ints_at(inv: &OpInvocation, index: usize) -> Result<&[i64], KernelError> {
    match operand_at(inv, index)? {
        Operand::Ints(values) => Ok(values),
        _ => Err(KernelError::InvalidOperand {
            op: inv.kind,
            index,
            expected: "an integer list",
        }),
    }
}

pub(crate) fn bool_at(inv: &OpInvocation, index: usize) -> Result<bool, KernelError> {
    match operand_at(inv, index)? {
        Operand::Bool(value) => Ok(*value),
        _ => Err(KernelError::InvalidOperand {
            op: inv.kind,
            index,
            expected: "a boolean",
        }),
    }
}

pub(crate) fn scalar_at(inv: &OpInvocation, index: usize) -> Result<f64, KernelError> {
    match operand_at(inv, index)? {
        Operand::Scalar(value) => Ok(*value),
        Operand::Int(value) => Ok(*value as f64),
        _ => Err(KernelError::InvalidOperand {
            op: inv.kind,
            index,
            expected: "a scalar",
        }),
    }
}

pub(crate) fn bool_kwarg(inv: &OpInvocation, name: &str, default: bool) -> Result<bool, KernelError> {
    match inv.kwarg(name) {
        None | Some(Operand::None) => Ok(default),
        Some(Operand::Bool(value)) => Ok(*value),
        Some(_) => Err(KernelError::InvalidArgument {
            op: inv.kind,
            reason: format!("keyword '{name}' must be a boolean"),
        }),
    }
}

pub(crate) fn dtype_kwarg(inv: &OpInvocation, default: DType) -> Result<DType, KernelError> {
    match inv.kwarg("dtype") {
        None | Some(Operand::None) => Ok(default),
        Some(Operand::DType(dtype)) => Ok(*dtype),
        Some(_) => Err(KernelError::InvalidArgument {
            op: inv.kind,
            reason: "keyword 'dtype' must be a dtype".to_string(),
        }),
    }
}

pub(crate) fn device_kwarg(inv: &OpInvocation) -> Result<Device, KernelError> {
    match inv.kwarg("device") {
        None | Some(Operand::None) => Ok(Device::Cpu),
        Some(Operand::Device(device)) => Ok(*device),
        Some(_) => Err(KernelError::InvalidArgument {
            op: inv.kind,
            reason: "keyword 'device' must be a device".to_string(),
        }),
    }
}

/// Normalize a possibly negative dimension against `rank`.
pub(crate) fn wrap_dim(op: OpKind, dim: i64, rank: usize) -> Result<usize, KernelError> {
    let rank_i = rank as i64;
    let wrapped = if dim < 0 { dim + rank_i } else { dim };
    if wrapped < 0 || wrapped >= rank_i.max(1) {
        return Err(KernelError::InvalidArgument {
            op,
            reason: format!("dimension {dim} out of range for rank {rank}"),
        });
    }
    Ok(wrapped as usize)
}

pub(crate) fn to_sizes(op: OpKind, values: &[i64]) -> Result<Vec<usize>, KernelError> {
    values
        .iter()
        .map(|&value| {
            usize::try_from(value).map_err(|_| KernelError::InvalidArgument {
                op,
                reason: format!("negative size {value}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ft_core::{
        DType, Device, Layout, OpInvocation, OpKind, Operand, RealTensor, SymbolicTensor, Tensor,
        TensorMeta,
    };
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{KernelError, OutputOrigin, broadcast_shapes, execute, infer_outputs};

    fn real(values: Vec<f64>, shape: Vec<usize>) -> Tensor {
        Tensor::Real(
            RealTensor::from_values(values, TensorMeta::from_shape(shape, DType::F32, Device::Cpu))
                .expect("real tensor"),
        )
    }

    fn symbolic(shape: Vec<usize>, dtype: DType) -> Tensor {
        Tensor::Symbolic(
            SymbolicTensor::new(TensorMeta::from_shape(shape, dtype, Device::Cpu), 1)
                .expect("symbolic tensor"),
        )
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn mm_computes_row_major_product() {
        let a = real(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let b = real(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
        let inv = OpInvocation::new(OpKind::Mm, vec![Operand::Tensor(a), Operand::Tensor(b)]);
        let out = execute(&inv, &mut rng()).expect("mm");
        assert_eq!(out[0].meta().shape(), &[2, 2]);
        assert_eq!(out[0].values().expect("values"), vec![4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn mm_rejects_inner_dimension_mismatch() {
        let inv = OpInvocation::new(
            OpKind::Mm,
            vec![
                Operand::Tensor(symbolic(vec![2, 3], DType::F32)),
                Operand::Tensor(symbolic(vec![4, 2], DType::F32)),
            ],
        );
        let err = infer_outputs(&inv).expect_err("inner mismatch must fail");
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn transpose_is_a_view_over_input_storage() {
        let x = real(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let inv = OpInvocation::new(OpKind::T, vec![Operand::Tensor(x.clone())]);
        let out = execute(&inv, &mut rng()).expect("t");
        assert_eq!(out[0].storage_id(), x.storage_id());
        assert_ne!(out[0].id(), x.id());
        assert_eq!(out[0].values().expect("values"), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn reshape_of_non_contiguous_input_copies() {
        let x = symbolic(vec![2, 3], DType::F32);
        let transposed = infer_outputs(&OpInvocation::new(OpKind::T, vec![Operand::Tensor(x)]))
            .expect("t")
            .remove(0);
        let view = SymbolicTensor::new(TensorMeta::from_shape(vec![2, 3], DType::F32, Device::Cpu), 1)
            .expect("base")
            .view_with(transposed.meta)
            .expect("view");
        let inv = OpInvocation::new(
            OpKind::Reshape,
            vec![Operand::Tensor(Tensor::Symbolic(view)), Operand::Ints(vec![-1])],
        );
        let spec = infer_outputs(&inv).expect("reshape").remove(0);
        assert_eq!(spec.origin, OutputOrigin::Fresh);
        assert_eq!(spec.meta.shape(), &[6]);
    }

    #[test]
    fn add_in_place_writes_input_and_returns_same_handle() {
        let x = real(vec![1.0, 2.0], vec![2]);
        let inv = OpInvocation::new(
            OpKind::AddInPlace,
            vec![Operand::Tensor(x.clone()), Operand::Scalar(10.0)],
        );
        let out = execute(&inv, &mut rng()).expect("add_");
        assert_eq!(out[0].id(), x.id());
        assert_eq!(
            x.as_real().expect("real").values().expect("values"),
            vec![11.0, 12.0]
        );
    }

    #[test]
    fn unsqueeze_in_place_keeps_handle_and_rewrites_shape() {
        let x = symbolic(vec![3, 4], DType::F32);
        let inv = OpInvocation::new(
            OpKind::UnsqueezeInPlace,
            vec![Operand::Tensor(x), Operand::Int(0)],
        );
        let spec = infer_outputs(&inv).expect("unsqueeze_").remove(0);
        assert_eq!(spec.origin, OutputOrigin::InPlace { input: 0 });
        assert_eq!(spec.meta.shape(), &[1, 3, 4]);
    }

    #[test]
    fn alias_shares_storage_with_input() {
        let x = real(vec![1.0, 2.0], vec![2]);
        let inv = OpInvocation::new(OpKind::Alias, vec![Operand::Tensor(x.clone())]);
        let out = execute(&inv, &mut rng()).expect("alias");
        assert_eq!(out[0].storage_id(), x.storage_id());
        assert_ne!(out[0].id(), x.id());
    }

    #[test]
    fn broadcast_add_expands_row_vector() {
        let a = real(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = real(vec![10.0, 20.0], vec![2]);
        let inv = OpInvocation::new(OpKind::Add, vec![Operand::Tensor(a), Operand::Tensor(b)]);
        let out = execute(&inv, &mut rng()).expect("add");
        assert_eq!(out[0].values().expect("values"), vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn sum_over_dim_reduces_rank() {
        let x = real(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let inv = OpInvocation::new(OpKind::Sum, vec![Operand::Tensor(x), Operand::Ints(vec![0])]);
        let out = execute(&inv, &mut rng()).expect("sum");
        assert_eq!(out[0].meta().shape(), &[3]);
        assert_eq!(out[0].values().expect("values"), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = real(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0], vec![2, 3]);
        let inv = OpInvocation::new(OpKind::Softmax, vec![Operand::Tensor(x), Operand::Int(-1)]);
        let out = execute(&inv, &mut rng()).expect("softmax");
        let values = out[0].values().expect("values");
        let first: f64 = values[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-12);
        assert!((values[3] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn conv2d_identity_kernel_copies_input() {
        let x = real((0..9).map(f64::from).collect(), vec![1, 1, 3, 3]);
        let w = real(vec![1.0], vec![1, 1, 1, 1]);
        let inv = OpInvocation::new(
            OpKind::Convolution,
            vec![
                Operand::Tensor(x),
                Operand::Tensor(w),
                Operand::None,
                Operand::Ints(vec![1, 1]),
                Operand::Ints(vec![0, 0]),
                Operand::Ints(vec![1, 1]),
                Operand::Bool(false),
                Operand::Ints(vec![0, 0]),
                Operand::Int(1),
            ],
        );
        let out = execute(&inv, &mut rng()).expect("conv");
        assert_eq!(out[0].meta().shape(), &[1, 1, 3, 3]);
        assert_eq!(
            out[0].values().expect("values"),
            (0..9).map(f64::from).collect::<Vec<_>>()
        );
    }

    #[test]
    fn attention_emits_output_and_logsumexp() {
        let q = symbolic(vec![2, 4, 16, 8], DType::F16);
        let k = symbolic(vec![2, 4, 32, 8], DType::F16);
        let v = symbolic(vec![2, 4, 32, 12], DType::F16);
        let inv = OpInvocation::new(
            OpKind::SdpaFlash,
            vec![Operand::Tensor(q), Operand::Tensor(k), Operand::Tensor(v)],
        );
        let specs = infer_outputs(&inv).expect("sdpa");
        assert_eq!(specs[0].meta.shape(), &[2, 4, 16, 12]);
        assert_eq!(specs[0].meta.dtype(), DType::F16);
        assert_eq!(specs[1].meta.shape(), &[2, 4, 16]);
        assert_eq!(specs[1].meta.dtype(), DType::F32);
    }

    #[test]
    fn attention_uniform_scores_average_values() {
        let q = real(vec![0.0; 2], vec![1, 1, 1, 2]);
        let k = real(vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 2, 2]);
        let v = real(vec![2.0, 4.0], vec![1, 1, 2, 1]);
        let inv = OpInvocation::new(
            OpKind::SdpaEfficient,
            vec![Operand::Tensor(q), Operand::Tensor(k), Operand::Tensor(v)],
        );
        let out = execute(&inv, &mut rng()).expect("sdpa");
        assert!((out[0].values().expect("values")[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn sparse_operands_have_no_host_kernel() {
        let meta = TensorMeta::from_shape(vec![2], DType::F32, Device::Cpu)
            .with_layout(Layout::Sparse { coalesced: false });
        let x = Tensor::Real(RealTensor::from_values(vec![1.0, 2.0], meta).expect("sparse"));
        let inv = OpInvocation::new(OpKind::Relu, vec![Operand::Tensor(x)]);
        let err = execute(&inv, &mut rng()).expect_err("sparse relu must fail");
        assert!(matches!(err, KernelError::UnsupportedLayout { .. }));
    }

    #[test]
    fn symbolic_operand_cannot_feed_real_kernel() {
        let inv = OpInvocation::new(
            OpKind::Relu,
            vec![Operand::Tensor(symbolic(vec![2], DType::F32))],
        );
        let err = execute(&inv, &mut rng()).expect_err("symbolic operand must fail");
        assert!(matches!(err, KernelError::SymbolicOperand { index: 0, .. }));
    }

    #[test]
    fn backward_attention_has_no_host_kernel() {
        let t = |shape: Vec<usize>| Operand::Tensor(real(vec![0.0; shape.iter().product()], shape));
        let inv = OpInvocation::new(
            OpKind::SdpaFlashBackward,
            vec![
                t(vec![1, 1, 2, 2]),
                t(vec![1, 1, 2, 2]),
                t(vec![1, 1, 2, 2]),
                t(vec![1, 1, 2, 2]),
                t(vec![1, 1, 2, 2]),
                t(vec![1, 1, 2]),
            ],
        );
        let err = execute(&inv, &mut rng()).expect_err("no backward kernel");
        assert!(matches!(err, KernelError::Unsupported { .. }));
    }

    proptest! {
        #[test]
        fn prop_broadcast_with_self_is_identity(shape in prop::collection::vec(1usize..=5, 0..=4)) {
            prop_assert_eq!(broadcast_shapes(&shape, &shape), Some(shape.clone()));
            prop_assert_eq!(broadcast_shapes(&shape, &[]), Some(shape));
        }

        #[test]
        fn prop_split_views_cover_the_dimension(len in 1usize..=12, split in 1i64..=5) {
            let x = symbolic(vec![len, 3], DType::F32);
            let inv = OpInvocation::new(
                OpKind::Split,
                vec![Operand::Tensor(x), Operand::Int(split), Operand::Int(0)],
            );
            let specs = infer_outputs(&inv).expect("split");
            let covered: usize = specs.iter().map(|spec| spec.meta.shape()[0]).sum();
            prop_assert_eq!(covered, len);
            let view_of_input0 = OutputOrigin::View { input: 0 };
            prop_assert!(specs.iter().all(|spec| spec.origin == view_of_input0));
        }
    }
}
