use ft_core::{DType, OpInvocation, OpKind, Operand, TensorMeta, ensure_compatible};

use crate::{
    KernelError, bool_at, device_kwarg, dtype_kwarg, int_at, ints_at, optional_int_at,
    optional_tensor_at, tensor_at, to_sizes, wrap_dim,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputOrigin {
    /// New storage.
    Fresh,
    /// New handle over the storage of positional operand `input`.
    View { input: usize },
    /// Positional operand `input` itself, possibly with rewritten metadata.
    InPlace { input: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub meta: TensorMeta,
    pub origin: OutputOrigin,
}

impl OutputSpec {
    fn fresh(meta: TensorMeta) -> Self {
        Self {
            meta,
            origin: OutputOrigin::Fresh,
        }
    }

    fn view(meta: TensorMeta, input: usize) -> Self {
        Self {
            meta,
            origin: OutputOrigin::View { input },
        }
    }

    fn in_place(meta: TensorMeta, input: usize) -> Self {
        Self {
            meta,
            origin: OutputOrigin::InPlace { input },
        }
    }
}

/// Numpy-style broadcast of two shapes, `None` when incompatible.
#[must_use]
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0usize; rank];
    for idx in 0..rank {
        let l = lhs
            .len()
            .checked_sub(rank - idx)
            .map_or(1, |pos| lhs[pos]);
        let r = rhs
            .len()
            .checked_sub(rank - idx)
            .map_or(1, |pos| rhs[pos]);
        out[idx] = if l == r || r == 1 {
            l
        } else if l == 1 {
            r
        } else {
            return None;
        };
    }
    Some(out)
}

/// Output metadata and aliasing for `inv` without touching any data.
pub fn infer_outputs(inv: &OpInvocation) -> Result<Vec<OutputSpec>, KernelError> {
    let op = inv.kind;
    match op {
        OpKind::Detach | OpKind::Alias => {
            let x = tensor_at(inv, 0)?.meta();
            Ok(vec![OutputSpec::view(x.clone(), 0)])
        }
        OpKind::View | OpKind::Reshape => {
            let x = tensor_at(inv, 0)?.meta();
            let shape = resolve_shape(op, ints_at(inv, 1)?, x.numel())?;
            if x.is_contiguous() {
                let meta = x
                    .reshaped_contiguous(shape)
                    .with_storage_offset(x.storage_offset());
                Ok(vec![OutputSpec::view(meta, 0)])
            } else if op == OpKind::View {
                Err(KernelError::InvalidArgument {
                    op,
                    reason: "view requires a contiguous input; use reshape".to_string(),
                })
            } else {
                Ok(vec![OutputSpec::fresh(x.reshaped_contiguous(shape))])
            }
        }
        OpKind::T => {
            let x = tensor_at(inv, 0)?.meta();
            if x.rank() > 2 {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: format!("t expects rank <= 2, got {}", x.rank()),
                });
            }
            let meta = if x.rank() == 2 {
                transposed(x, 0, 1)?
            } else {
                x.clone()
            };
            Ok(vec![OutputSpec::view(meta, 0)])
        }
        OpKind::Transpose | OpKind::TransposeInPlace => {
            let x = ranked_input(inv)?;
            let d0 = wrap_dim(op, int_at(inv, 1)?, x.rank())?;
            let d1 = wrap_dim(op, int_at(inv, 2)?, x.rank())?;
            let meta = transposed(x, d0, d1)?;
            Ok(vec![alias_or_in_place(op, meta)])
        }
        OpKind::Permute => {
            let x = tensor_at(inv, 0)?.meta();
            let dims = ints_at(inv, 1)?;
            if dims.len() != x.rank() {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: format!("permute expects {} dims, got {}", x.rank(), dims.len()),
                });
            }
            let mut seen = vec![false; x.rank()];
            let mut shape = Vec::with_capacity(x.rank());
            let mut strides = Vec::with_capacity(x.rank());
            for &dim in dims {
                let dim = wrap_dim(op, dim, x.rank())?;
                if std::mem::replace(&mut seen[dim], true) {
                    return Err(KernelError::InvalidArgument {
                        op,
                        reason: format!("permute repeats dimension {dim}"),
                    });
                }
                shape.push(x.shape()[dim]);
                strides.push(x.strides()[dim]);
            }
            let meta = strided(x, shape, strides, x.storage_offset())?;
            Ok(vec![OutputSpec::view(meta, 0)])
        }
        OpKind::Expand => {
            let x = tensor_at(inv, 0)?.meta();
            let sizes = ints_at(inv, 1)?;
            if sizes.len() < x.rank() {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: "expand cannot drop dimensions".to_string(),
                });
            }
            let lead = sizes.len() - x.rank();
            let mut shape = Vec::with_capacity(sizes.len());
            let mut strides = Vec::with_capacity(sizes.len());
            for (idx, &size) in sizes.iter().enumerate() {
                if idx < lead {
                    let size = to_sizes(op, &[size])?[0];
                    shape.push(size);
                    strides.push(0);
                    continue;
                }
                let src_size = x.shape()[idx - lead];
                let src_stride = x.strides()[idx - lead];
                if size == -1 || usize::try_from(size).ok() == Some(src_size) {
                    shape.push(src_size);
                    strides.push(src_stride);
                } else if src_size == 1 {
                    shape.push(to_sizes(op, &[size])?[0]);
                    strides.push(0);
                } else {
                    return Err(KernelError::ShapeMismatch {
                        op,
                        lhs: x.shape().to_vec(),
                        rhs: sizes.iter().map(|&size| size.max(0) as usize).collect(),
                    });
                }
            }
            let meta = strided(x, shape, strides, x.storage_offset())?;
            Ok(vec![OutputSpec::view(meta, 0)])
        }
        OpKind::Squeeze | OpKind::SqueezeInPlace => {
            let x = tensor_at(inv, 0)?.meta();
            let only = optional_int_at(inv, 1)?
                .map(|dim| wrap_dim(op, dim, x.rank()))
                .transpose()?;
            let mut shape = Vec::new();
            let mut strides = Vec::new();
            for (dim, (&size, &stride)) in x.shape().iter().zip(x.strides()).enumerate() {
                let drop = size == 1 && only.is_none_or(|target| target == dim);
                if !drop {
                    shape.push(size);
                    strides.push(stride);
                }
            }
            let meta = strided(x, shape, strides, x.storage_offset())?;
            Ok(vec![alias_or_in_place(op, meta)])
        }
        OpKind::Unsqueeze | OpKind::UnsqueezeInPlace => {
            let x = tensor_at(inv, 0)?.meta();
            let dim = wrap_dim(op, int_at(inv, 1)?, x.rank() + 1)?;
            let stride = if dim < x.rank() {
                x.shape()[dim] * x.strides()[dim]
            } else {
                1
            };
            let mut shape = x.shape().to_vec();
            let mut strides = x.strides().to_vec();
            shape.insert(dim, 1);
            strides.insert(dim, stride);
            let meta = strided(x, shape, strides, x.storage_offset())?;
            Ok(vec![alias_or_in_place(op, meta)])
        }
        OpKind::Select => {
            let x = ranked_input(inv)?;
            let dim = wrap_dim(op, int_at(inv, 1)?, x.rank())?;
            let size = x.shape()[dim] as i64;
            let raw = int_at(inv, 2)?;
            let index = if raw < 0 { raw + size } else { raw };
            if index < 0 || index >= size {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: format!("index {raw} out of range for size {size}"),
                });
            }
            let offset = x.storage_offset() + index as usize * x.strides()[dim];
            let mut shape = x.shape().to_vec();
            let mut strides = x.strides().to_vec();
            shape.remove(dim);
            strides.remove(dim);
            let meta = strided(x, shape, strides, offset)?;
            Ok(vec![OutputSpec::view(meta, 0)])
        }
        OpKind::Split | OpKind::Chunk => {
            let x = ranked_input(inv)?;
            let dim = wrap_dim(op, optional_int_at(inv, 2)?.unwrap_or(0), x.rank())?;
            let len = x.shape()[dim];
            let count = to_sizes(op, &[int_at(inv, 1)?])?[0];
            if count == 0 {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: "split size and chunk count must be positive".to_string(),
                });
            }
            let piece = if op == OpKind::Chunk {
                len.div_ceil(count).max(1)
            } else {
                count
            };
            let mut out = Vec::new();
            let mut start = 0usize;
            while start < len || (len == 0 && out.is_empty()) {
                let size = piece.min(len - start);
                let mut shape = x.shape().to_vec();
                shape[dim] = size;
                let offset = x.storage_offset() + start * x.strides()[dim];
                out.push(OutputSpec::view(
                    strided(x, shape, x.strides().to_vec(), offset)?,
                    0,
                ));
                start += piece;
            }
            Ok(out)
        }
        OpKind::AsStrided | OpKind::AsStridedInPlace => {
            let x = tensor_at(inv, 0)?.meta();
            let shape = to_sizes(op, ints_at(inv, 1)?)?;
            let strides = to_sizes(op, ints_at(inv, 2)?)?;
            let offset = match optional_int_at(inv, 3)? {
                Some(offset) => to_sizes(op, &[offset])?[0],
                None => x.storage_offset(),
            };
            let meta = strided(x, shape, strides, offset)?;
            Ok(vec![alias_or_in_place(op, meta)])
        }
        OpKind::Zeros | OpKind::Ones | OpKind::Rand | OpKind::Randn => {
            let shape = to_sizes(op, ints_at(inv, 0)?)?;
            let dtype = dtype_kwarg(inv, DType::F32)?;
            let device = device_kwarg(inv)?;
            Ok(vec![OutputSpec::fresh(TensorMeta::from_shape(
                shape, dtype, device,
            ))])
        }
        OpKind::Arange => {
            let end = to_sizes(op, &[int_at(inv, 0)?])?[0];
            let dtype = dtype_kwarg(inv, DType::I64)?;
            let device = device_kwarg(inv)?;
            Ok(vec![OutputSpec::fresh(TensorMeta::from_shape(
                vec![end],
                dtype,
                device,
            ))])
        }
        OpKind::ZerosLike
        | OpKind::OnesLike
        | OpKind::RandLike
        | OpKind::RandnLike
        | OpKind::Clone => {
            let x = tensor_at(inv, 0)?.meta();
            Ok(vec![OutputSpec::fresh(
                x.reshaped_contiguous(x.shape().to_vec()),
            )])
        }
        OpKind::Mm => {
            let meta = matmul_meta(inv, 0, 1)?;
            Ok(vec![OutputSpec::fresh(meta)])
        }
        OpKind::Bmm => {
            let meta = batched_matmul_meta(inv, 0, 1)?;
            Ok(vec![OutputSpec::fresh(meta)])
        }
        OpKind::Addmm | OpKind::Baddbmm => {
            let meta = if op == OpKind::Addmm {
                matmul_meta(inv, 1, 2)?
            } else {
                batched_matmul_meta(inv, 1, 2)?
            };
            let bias = tensor_at(inv, 0)?.meta();
            ensure_broadcasts_into(op, bias.shape(), meta.shape())?;
            Ok(vec![OutputSpec::fresh(meta)])
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let a = tensor_at(inv, 0)?.meta();
            let shape = match crate::operand_at(inv, 1)? {
                Operand::Tensor(other) => {
                    let b = other.meta();
                    if b.rank() > 0 || a.dtype() == b.dtype() {
                        ensure_compatible(a, b)?;
                    }
                    broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
                        KernelError::ShapeMismatch {
                            op,
                            lhs: a.shape().to_vec(),
                            rhs: b.shape().to_vec(),
                        }
                    })?
                }
                Operand::Scalar(_) | Operand::Int(_) => a.shape().to_vec(),
                _ => {
                    return Err(KernelError::InvalidOperand {
                        op,
                        index: 1,
                        expected: "a tensor or scalar",
                    });
                }
            };
            Ok(vec![OutputSpec::fresh(a.reshaped_contiguous(shape))])
        }
        OpKind::Relu | OpKind::Softmax => {
            let x = tensor_at(inv, 0)?.meta();
            if op == OpKind::Softmax {
                wrap_dim(op, int_at(inv, 1)?, x.rank())?;
            }
            Ok(vec![OutputSpec::fresh(
                x.reshaped_contiguous(x.shape().to_vec()),
            )])
        }
        OpKind::ThresholdBackward => {
            let grad = tensor_at(inv, 0)?.meta();
            let x = tensor_at(inv, 1)?.meta();
            if grad.shape() != x.shape() {
                return Err(KernelError::ShapeMismatch {
                    op,
                    lhs: grad.shape().to_vec(),
                    rhs: x.shape().to_vec(),
                });
            }
            Ok(vec![OutputSpec::fresh(
                grad.reshaped_contiguous(grad.shape().to_vec()),
            )])
        }
        OpKind::Sum => {
            let x = tensor_at(inv, 0)?.meta();
            let reduced = reduced_dims(inv, x)?;
            let shape = x
                .shape()
                .iter()
                .enumerate()
                .filter(|(dim, _)| !reduced.contains(dim))
                .map(|(_, &size)| size)
                .collect::<Vec<_>>();
            let dtype = if x.dtype().is_floating() {
                x.dtype()
            } else {
                DType::I64
            };
            Ok(vec![OutputSpec::fresh(
                x.reshaped_contiguous(shape).with_dtype(dtype),
            )])
        }
        OpKind::Convolution => convolution_meta(inv).map(|meta| vec![OutputSpec::fresh(meta)]),
        OpKind::ConvolutionBackward => {
            let grad = tensor_at(inv, 0)?.meta();
            let x = tensor_at(inv, 1)?.meta();
            let w = tensor_at(inv, 2)?.meta();
            let mask = ints_at(inv, 10)?;
            if mask.len() != 3 {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: "output mask needs three entries".to_string(),
                });
            }
            let channels = *grad.shape().get(1).ok_or(KernelError::InvalidArgument {
                op,
                reason: "grad_output needs a channel dimension".to_string(),
            })?;
            let mut out = Vec::new();
            if mask[0] != 0 {
                out.push(OutputSpec::fresh(x.reshaped_contiguous(x.shape().to_vec())));
            }
            if mask[1] != 0 {
                out.push(OutputSpec::fresh(w.reshaped_contiguous(w.shape().to_vec())));
            }
            if mask[2] != 0 {
                out.push(OutputSpec::fresh(grad.reshaped_contiguous(vec![channels])));
            }
            Ok(out)
        }
        OpKind::SdpaEfficient | OpKind::SdpaFlash => {
            let (q, _, v) = attention_operands(inv, 0)?;
            let (b, h, s_q) = (q.shape()[0], q.shape()[1], q.shape()[2]);
            let out = q.reshaped_contiguous(vec![b, h, s_q, v.shape()[3]]);
            let logsumexp = q.reshaped_contiguous(vec![b, h, s_q]).with_dtype(DType::F32);
            Ok(vec![OutputSpec::fresh(out), OutputSpec::fresh(logsumexp)])
        }
        OpKind::SdpaEfficientBackward | OpKind::SdpaFlashBackward => {
            let grad = tensor_at(inv, 0)?.meta();
            let (q, k, v) = attention_operands(inv, 1)?;
            let expected = [q.shape()[0], q.shape()[1], q.shape()[2], v.shape()[3]];
            if grad.shape() != expected {
                return Err(KernelError::ShapeMismatch {
                    op,
                    lhs: grad.shape().to_vec(),
                    rhs: expected.to_vec(),
                });
            }
            Ok([q, k, v]
                .into_iter()
                .map(|meta| OutputSpec::fresh(meta.reshaped_contiguous(meta.shape().to_vec())))
                .collect())
        }
        OpKind::AddInPlace | OpKind::MulInPlace | OpKind::Copy => {
            let x = tensor_at(inv, 0)?.meta();
            match crate::operand_at(inv, 1)? {
                Operand::Tensor(other) => {
                    ensure_broadcasts_into(op, other.meta().shape(), x.shape())?;
                }
                Operand::Scalar(_) | Operand::Int(_) if op != OpKind::Copy => {}
                _ => {
                    return Err(KernelError::InvalidOperand {
                        op,
                        index: 1,
                        expected: "a tensor or scalar",
                    });
                }
            }
            Ok(vec![OutputSpec::in_place(x.clone(), 0)])
        }
        OpKind::Fill | OpKind::Zero => {
            let x = tensor_at(inv, 0)?.meta();
            if op == OpKind::Fill {
                crate::scalar_at(inv, 1)?;
            }
            Ok(vec![OutputSpec::in_place(x.clone(), 0)])
        }
    }
}

/// First operand's metadata, rejecting zero-dim tensors.
fn ranked_input(inv: &OpInvocation) -> Result<&TensorMeta, KernelError> {
    let x = tensor_at(inv, 0)?.meta();
    if x.rank() == 0 {
        return Err(KernelError::InvalidArgument {
            op: inv.kind,
            reason: "expected a tensor with at least one dimension".to_string(),
        });
    }
    Ok(x)
}

fn alias_or_in_place(op: OpKind, meta: TensorMeta) -> OutputSpec {
    if op.tags().inplace_view {
        OutputSpec::in_place(meta, 0)
    } else {
        OutputSpec::view(meta, 0)
    }
}

fn strided(
    base: &TensorMeta,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
) -> Result<TensorMeta, KernelError> {
    Ok(
        TensorMeta::from_shape_and_strides(shape, strides, offset, base.dtype(), base.device())?
            .with_layout(base.layout()),
    )
}

fn transposed(x: &TensorMeta, d0: usize, d1: usize) -> Result<TensorMeta, KernelError> {
    let mut shape = x.shape().to_vec();
    let mut strides = x.strides().to_vec();
    shape.swap(d0, d1);
    strides.swap(d0, d1);
    strided(x, shape, strides, x.storage_offset())
}

fn resolve_shape(op: OpKind, requested: &[i64], numel: usize) -> Result<Vec<usize>, KernelError> {
    let inferred = requested.iter().filter(|&&size| size == -1).count();
    if inferred > 1 {
        return Err(KernelError::InvalidArgument {
            op,
            reason: "only one dimension can be inferred".to_string(),
        });
    }
    let known = to_sizes(
        op,
        &requested
            .iter()
            .copied()
            .filter(|&size| size != -1)
            .collect::<Vec<_>>(),
    )?;
    let known_numel: usize = known.iter().product();
    let fill = if inferred == 1 {
        if known_numel == 0 || numel % known_numel != 0 {
            return Err(KernelError::InvalidArgument {
                op,
                reason: format!("cannot infer dimension for {numel} elements"),
            });
        }
        numel / known_numel
    } else {
        0
    };
    let shape = requested
        .iter()
        .map(|&size| if size == -1 { fill } else { size as usize })
        .collect::<Vec<_>>();
    let total: usize = shape.iter().product();
    if total != numel {
        return Err(KernelError::InvalidArgument {
            op,
            reason: format!("shape {shape:?} is invalid for {numel} elements"),
        });
    }
    Ok(shape)
}

fn ensure_broadcasts_into(op: OpKind, src: &[usize], dst: &[usize]) -> Result<(), KernelError> {
    match broadcast_shapes(src, dst) {
        Some(shape) if shape == dst => Ok(()),
        _ => Err(KernelError::ShapeMismatch {
            op,
            lhs: src.to_vec(),
            rhs: dst.to_vec(),
        }),
    }
}

fn matmul_meta(inv: &OpInvocation, lhs: usize, rhs: usize) -> Result<TensorMeta, KernelError> {
    let op = inv.kind;
    let a = tensor_at(inv, lhs)?.meta();
    let b = tensor_at(inv, rhs)?.meta();
    ensure_compatible(a, b)?;
    match (a.shape(), b.shape()) {
        ([m, k], [k2, n]) if k == k2 => Ok(a.reshaped_contiguous(vec![*m, *n])),
        _ => Err(KernelError::ShapeMismatch {
            op,
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        }),
    }
}

fn batched_matmul_meta(
    inv: &OpInvocation,
    lhs: usize,
    rhs: usize,
) -> Result<TensorMeta, KernelError> {
    let op = inv.kind;
    let a = tensor_at(inv, lhs)?.meta();
    let b = tensor_at(inv, rhs)?.meta();
    ensure_compatible(a, b)?;
    match (a.shape(), b.shape()) {
        ([batch, m, k], [batch2, k2, n]) if batch == batch2 && k == k2 => {
            Ok(a.reshaped_contiguous(vec![*batch, *m, *n]))
        }
        _ => Err(KernelError::ShapeMismatch {
            op,
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        }),
    }
}

pub(crate) fn reduced_dims(inv: &OpInvocation, x: &TensorMeta) -> Result<Vec<usize>, KernelError> {
    match inv.args.get(1) {
        None | Some(Operand::None) => Ok((0..x.rank()).collect()),
        Some(_) => {
            let mut dims = ints_at(inv, 1)?
                .iter()
                .map(|&dim| wrap_dim(inv.kind, dim, x.rank()))
                .collect::<Result<Vec<_>, _>>()?;
            dims.sort_unstable();
            dims.dedup();
            Ok(dims)
        }
    }
}

/// Convolution operands: `(input, weight, bias?, stride, padding, dilation,
/// transposed, output_padding, groups)`.
pub(crate) struct ConvParams {
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
    pub transposed: bool,
    pub output_padding: Vec<usize>,
    pub groups: usize,
}

pub(crate) fn conv_params(
    inv: &OpInvocation,
    first: usize,
    spatial: usize,
) -> Result<ConvParams, KernelError> {
    let op = inv.kind;
    let expand = |values: Vec<usize>| -> Result<Vec<usize>, KernelError> {
        match values.len() {
            1 => Ok(vec![values[0]; spatial]),
            len if len == spatial => Ok(values),
            len => Err(KernelError::InvalidArgument {
                op,
                reason: format!("expected {spatial} spatial parameters, got {len}"),
            }),
        }
    };
    let groups = to_sizes(op, &[int_at(inv, first + 5)?])?[0];
    if groups == 0 {
        return Err(KernelError::InvalidArgument {
            op,
            reason: "groups must be positive".to_string(),
        });
    }
    Ok(ConvParams {
        stride: expand(to_sizes(op, ints_at(inv, first)?)?)?,
        padding: expand(to_sizes(op, ints_at(inv, first + 1)?)?)?,
        dilation: expand(to_sizes(op, ints_at(inv, first + 2)?)?)?,
        transposed: bool_at(inv, first + 3)?,
        output_padding: expand(to_sizes(op, ints_at(inv, first + 4)?)?)?,
        groups,
    })
}

fn convolution_meta(inv: &OpInvocation) -> Result<TensorMeta, KernelError> {
    let op = inv.kind;
    let x = tensor_at(inv, 0)?.meta();
    let w = tensor_at(inv, 1)?.meta();
    ensure_compatible(x, w)?;
    if x.rank() < 3 || x.rank() != w.rank() {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: x.shape().to_vec(),
            rhs: w.shape().to_vec(),
        });
    }
    let spatial = x.rank() - 2;
    let params = conv_params(inv, 3, spatial)?;
    let in_channels = if params.transposed {
        w.shape()[0]
    } else {
        w.shape()[1] * params.groups
    };
    if in_channels != x.shape()[1] {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: x.shape().to_vec(),
            rhs: w.shape().to_vec(),
        });
    }
    let out_channels = if params.transposed {
        w.shape()[1] * params.groups
    } else {
        w.shape()[0]
    };
    if let Some(bias) = optional_tensor_at(inv, 2)? {
        if bias.meta().shape() != [out_channels] {
            return Err(KernelError::ShapeMismatch {
                op,
                lhs: bias.meta().shape().to_vec(),
                rhs: vec![out_channels],
            });
        }
    }
    let mut shape = vec![x.shape()[0], out_channels];
    for dim in 0..spatial {
        let input = x.shape()[dim + 2] as i64;
        let kernel = w.shape()[dim + 2] as i64;
        let stride = params.stride[dim] as i64;
        let padding = params.padding[dim] as i64;
        let dilation = params.dilation[dim] as i64;
        let size = if params.transposed {
            (input - 1) * stride - 2 * padding
                + dilation * (kernel - 1)
                + params.output_padding[dim] as i64
                + 1
        } else {
            if stride == 0 {
                return Err(KernelError::InvalidArgument {
                    op,
                    reason: "stride must be positive".to_string(),
                });
            }
            (input + 2 * padding - dilation * (kernel - 1) - 1) / stride + 1
        };
        if size <= 0 {
            return Err(KernelError::InvalidArgument {
                op,
                reason: format!("computed output size {size} along spatial dim {dim}"),
            });
        }
        shape.push(size as usize);
    }
    Ok(x.reshaped_contiguous(shape))
}

fn attention_operands(
    inv: &OpInvocation,
    first: usize,
) -> Result<(&TensorMeta, &TensorMeta, &TensorMeta), KernelError> {
    let op = inv.kind;
    let q = tensor_at(inv, first)?.meta();
    let k = tensor_at(inv, first + 1)?.meta();
    let v = tensor_at(inv, first + 2)?.meta();
    ensure_compatible(q, k)?;
    ensure_compatible(q, v)?;
    match (q.shape(), k.shape(), v.shape()) {
        ([b, h, _, d_qk], [b2, h2, s_kv, d_k], [b3, h3, s_v, _])
            if b == b2 && b == b3 && h == h2 && h == h3 && d_qk == d_k && s_kv == s_v =>
        {
            Ok((q, k, v))
        }
        _ => Err(KernelError::ShapeMismatch {
            op,
            lhs: q.shape().to_vec(),
            rhs: k.shape().to_vec(),
        }),
    }
}
