use ft_core::{OpInvocation, OpKind, Operand, RealTensor, TensorMeta};
use rand::Rng;
use rand::rngs::StdRng;

use crate::meta::{conv_params, reduced_dims};
use crate::{
    KernelError, OutputOrigin, OutputSpec, bool_kwarg, int_at, operand_at, optional_tensor_at,
    real_at, scalar_at, wrap_dim,
};

/// Values for every fresh output of `inv`, in output order.
pub(crate) fn compute_fresh(
    inv: &OpInvocation,
    specs: &[OutputSpec],
    rng: &mut StdRng,
) -> Result<Vec<Vec<f64>>, KernelError> {
    let op = inv.kind;
    let fresh = specs
        .iter()
        .filter(|spec| spec.origin == OutputOrigin::Fresh)
        .collect::<Vec<_>>();
    let Some(first) = fresh.first() else {
        return Ok(Vec::new());
    };
    let numel = first.meta.numel();

    let values = match op {
        OpKind::Reshape => real_at(inv, 0)?.values()?,
        OpKind::Zeros | OpKind::ZerosLike => vec![0.0; numel],
        OpKind::Ones | OpKind::OnesLike => vec![1.0; numel],
        OpKind::Rand | OpKind::RandLike => (0..numel).map(|_| rng.random::<f64>()).collect(),
        OpKind::Randn | OpKind::RandnLike => (0..numel).map(|_| standard_normal(rng)).collect(),
        OpKind::Arange => (0..numel).map(|idx| idx as f64).collect(),
        OpKind::Clone => real_at(inv, 0)?.values()?,
        OpKind::Mm | OpKind::Bmm => {
            let a = real_at(inv, 0)?;
            let b = real_at(inv, 1)?;
            batched_matmul(a, b)?
        }
        OpKind::Addmm | OpKind::Baddbmm => {
            let bias = real_at(inv, 0)?;
            let product = batched_matmul(real_at(inv, 1)?, real_at(inv, 2)?)?;
            let bias = broadcast_to(&bias.values()?, bias.meta().shape(), first.meta.shape());
            product
                .into_iter()
                .zip(bias)
                .map(|(lhs, rhs)| lhs + rhs)
                .collect()
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let a = real_at(inv, 0)?;
            let lhs = broadcast_to(&a.values()?, a.meta().shape(), first.meta.shape());
            let rhs = other_values(inv, first.meta.shape())?;
            lhs.into_iter()
                .zip(rhs)
                .map(|(lhs, rhs)| binary(op, lhs, rhs))
                .collect()
        }
        OpKind::Relu => real_at(inv, 0)?
            .values()?
            .into_iter()
            .map(|value| value.max(0.0))
            .collect(),
        OpKind::ThresholdBackward => {
            let grad = real_at(inv, 0)?.values()?;
            let x = real_at(inv, 1)?.values()?;
            let threshold = scalar_at(inv, 2)?;
            grad.into_iter()
                .zip(x)
                .map(|(grad, x)| if x > threshold { grad } else { 0.0 })
                .collect()
        }
        OpKind::Sum => {
            let x = real_at(inv, 0)?;
            let dims = reduced_dims(inv, x.meta())?;
            sum_over(&x.values()?, x.meta().shape(), &dims)
        }
        OpKind::Softmax => {
            let x = real_at(inv, 0)?;
            let dim = wrap_dim(op, int_at(inv, 1)?, x.meta().rank())?;
            softmax(&x.values()?, x.meta().shape(), dim)
        }
        OpKind::Convolution => return conv2d(inv, &first.meta).map(|values| vec![values]),
        OpKind::SdpaEfficient | OpKind::SdpaFlash => return attention(inv),
        OpKind::ConvolutionBackward => {
            return Err(KernelError::Unsupported {
                op,
                reason: "convolution backward has no host kernel",
            });
        }
        OpKind::SdpaEfficientBackward | OpKind::SdpaFlashBackward => {
            return Err(KernelError::Unsupported {
                op,
                reason: "attention backward has no host kernel",
            });
        }
        _ => {
            return Err(KernelError::Unsupported {
                op,
                reason: "no fresh output kernel",
            });
        }
    };
    Ok(vec![values])
}

/// New row-major values of the in-place target.
pub(crate) fn compute_inplace(
    inv: &OpInvocation,
    target: &RealTensor,
) -> Result<Vec<f64>, KernelError> {
    let op = inv.kind;
    let shape = target.meta().shape();
    match op {
        OpKind::AddInPlace | OpKind::MulInPlace => {
            let rhs = other_values(inv, shape)?;
            let binary_op = if op == OpKind::AddInPlace {
                OpKind::Add
            } else {
                OpKind::Mul
            };
            Ok(target
                .values()?
                .into_iter()
                .zip(rhs)
                .map(|(lhs, rhs)| binary(binary_op, lhs, rhs))
                .collect())
        }
        OpKind::Copy => other_values(inv, shape),
        OpKind::Fill => Ok(vec![scalar_at(inv, 1)?; target.meta().numel()]),
        OpKind::Zero => Ok(vec![0.0; target.meta().numel()]),
        _ => Err(KernelError::Unsupported {
            op,
            reason: "no in-place kernel",
        }),
    }
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = 1.0 - rng.random::<f64>();
    let u2 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn binary(op: OpKind, lhs: f64, rhs: f64) -> f64 {
    match op {
        OpKind::Sub => lhs - rhs,
        OpKind::Mul => lhs * rhs,
        OpKind::Div => lhs / rhs,
        _ => lhs + rhs,
    }
}

/// Second operand broadcast to `shape`, tensor or scalar.
fn other_values(inv: &OpInvocation, shape: &[usize]) -> Result<Vec<f64>, KernelError> {
    match operand_at(inv, 1)? {
        Operand::Tensor(_) => {
            let other = real_at(inv, 1)?;
            Ok(broadcast_to(&other.values()?, other.meta().shape(), shape))
        }
        _ => Ok(vec![scalar_at(inv, 1)?; shape.iter().product()]),
    }
}

/// Expand row-major `values` of shape `from` to the broadcast shape `to`.
fn broadcast_to(values: &[f64], from: &[usize], to: &[usize]) -> Vec<f64> {
    if from == to {
        return values.to_vec();
    }
    let lead = to.len() - from.len();
    let src_strides = ft_core::contiguous_strides(from);
    let total: usize = to.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0usize; to.len()];
    for _ in 0..total {
        let mut src = 0usize;
        for (dim, &size) in from.iter().enumerate() {
            if size != 1 {
                src += index[dim + lead] * src_strides[dim];
            }
        }
        out.push(values[src]);
        for dim in (0..to.len()).rev() {
            index[dim] += 1;
            if index[dim] < to[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    out
}

fn batched_matmul(a: &RealTensor, b: &RealTensor) -> Result<Vec<f64>, KernelError> {
    let (batch, m, k) = match *a.meta().shape() {
        [m, k] => (1, m, k),
        [batch, m, k] => (batch, m, k),
        _ => matmul_rank_error(a.meta())?,
    };
    let n = b.meta().shape()[b.meta().rank() - 1];
    let lhs = a.values()?;
    let rhs = b.values()?;
    let mut out = vec![0.0; batch * m * n];
    for bi in 0..batch {
        let lhs = &lhs[bi * m * k..(bi + 1) * m * k];
        let rhs = &rhs[bi * k * n..(bi + 1) * k * n];
        let out = &mut out[bi * m * n..(bi + 1) * m * n];
        for row in 0..m {
            for inner in 0..k {
                let scale = lhs[row * k + inner];
                for col in 0..n {
                    out[row * n + col] += scale * rhs[inner * n + col];
                }
            }
        }
    }
    Ok(out)
}

fn matmul_rank_error(meta: &TensorMeta) -> Result<(usize, usize, usize), KernelError> {
    Err(KernelError::InvalidArgument {
        op: OpKind::Mm,
        reason: format!("matmul operand has rank {}", meta.rank()),
    })
}

fn sum_over(values: &[f64], shape: &[usize], dims: &[usize]) -> Vec<f64> {
    let out_shape = shape
        .iter()
        .enumerate()
        .filter(|(dim, _)| !dims.contains(dim))
        .map(|(_, &size)| size)
        .collect::<Vec<_>>();
    let out_strides = ft_core::contiguous_strides(&out_shape);
    let mut out = vec![0.0; out_shape.iter().product()];
    let mut index = vec![0usize; shape.len()];
    for &value in values {
        let mut dst = 0usize;
        let mut kept = 0usize;
        for (dim, &idx) in index.iter().enumerate() {
            if !dims.contains(&dim) {
                dst += idx * out_strides[kept];
                kept += 1;
            }
        }
        out[dst] += value;
        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    out
}

fn softmax(values: &[f64], shape: &[usize], dim: usize) -> Vec<f64> {
    if shape.is_empty() {
        return vec![1.0; values.len()];
    }
    let len = shape[dim];
    let inner: usize = shape[dim + 1..].iter().product();
    let outer: usize = shape[..dim].iter().product();
    let mut out = vec![0.0; values.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| (o * len + j) * inner + i;
            let max = (0..len)
                .map(|j| values[at(j)])
                .fold(f64::NEG_INFINITY, f64::max);
            let total: f64 = (0..len).map(|j| (values[at(j)] - max).exp()).sum();
            for j in 0..len {
                out[at(j)] = (values[at(j)] - max).exp() / total;
            }
        }
    }
    out
}

fn conv2d(inv: &OpInvocation, out_meta: &TensorMeta) -> Result<Vec<f64>, KernelError> {
    let op = inv.kind;
    let x = real_at(inv, 0)?;
    let w = real_at(inv, 1)?;
    if x.meta().rank() != 4 {
        return Err(KernelError::Unsupported {
            op,
            reason: "host convolution supports two spatial dimensions only",
        });
    }
    let params = conv_params(inv, 3, 2)?;
    if params.transposed {
        return Err(KernelError::Unsupported {
            op,
            reason: "transposed convolution has no host kernel",
        });
    }
    let bias = match optional_tensor_at(inv, 2)? {
        Some(_) => Some(real_at(inv, 2)?.values()?),
        None => None,
    };

    let [batch, in_channels, in_h, in_w] = dims4(x.meta())?;
    let [out_channels, group_in, k_h, k_w] = dims4(w.meta())?;
    let [_, _, out_h, out_w] = dims4(out_meta)?;
    let group_out = out_channels / params.groups;
    let input = x.values()?;
    let weight = w.values()?;

    let mut out = vec![0.0; batch * out_channels * out_h * out_w];
    for n in 0..batch {
        for oc in 0..out_channels {
            let group = oc / group_out;
            let base = bias.as_ref().map_or(0.0, |bias| bias[oc]);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = base;
                    for ic in 0..group_in {
                        let channel = group * group_in + ic;
                        for ky in 0..k_h {
                            let iy = (oy * params.stride[0] + ky * params.dilation[0]) as i64
                                - params.padding[0] as i64;
                            if iy < 0 || iy >= in_h as i64 {
                                continue;
                            }
                            for kx in 0..k_w {
                                let ix = (ox * params.stride[1] + kx * params.dilation[1]) as i64
                                    - params.padding[1] as i64;
                                if ix < 0 || ix >= in_w as i64 {
                                    continue;
                                }
                                let src = ((n * in_channels + channel) * in_h + iy as usize)
                                    * in_w
                                    + ix as usize;
                                let kernel = ((oc * group_in + ic) * k_h + ky) * k_w + kx;
                                acc += input[src] * weight[kernel];
                            }
                        }
                    }
                    out[((n * out_channels + oc) * out_h + oy) * out_w + ox] = acc;
                }
            }
        }
    }
    Ok(out)
}

fn dims4(meta: &TensorMeta) -> Result<[usize; 4], KernelError> {
    <[usize; 4]>::try_from(meta.shape()).map_err(|_| KernelError::InvalidArgument {
        op: OpKind::Convolution,
        reason: format!("expected rank 4, got {}", meta.rank()),
    })
}

/// Attention output and per-row logsumexp.
fn attention(inv: &OpInvocation) -> Result<Vec<Vec<f64>>, KernelError> {
    let q = real_at(inv, 0)?;
    let k = real_at(inv, 1)?;
    let v = real_at(inv, 2)?;
    let is_causal = bool_kwarg(inv, "is_causal", false)?;
    let [batch, heads, s_q, d_qk] = dims4(q.meta())?;
    let s_kv = k.meta().shape()[2];
    let d_v = v.meta().shape()[3];
    let scale = match inv.kwarg("scale") {
        Some(Operand::Scalar(scale)) => *scale,
        _ => 1.0 / (d_qk as f64).sqrt(),
    };
    let qv = q.values()?;
    let kv = k.values()?;
    let vv = v.values()?;

    let mut out = vec![0.0; batch * heads * s_q * d_v];
    let mut logsumexp = vec![0.0; batch * heads * s_q];
    let mut scores = vec![0.0; s_kv];
    for bh in 0..batch * heads {
        for i in 0..s_q {
            let row = &qv[(bh * s_q + i) * d_qk..(bh * s_q + i + 1) * d_qk];
            for (j, score) in scores.iter_mut().enumerate() {
                *score = if is_causal && j > i {
                    f64::NEG_INFINITY
                } else {
                    let key = &kv[(bh * s_kv + j) * d_qk..(bh * s_kv + j + 1) * d_qk];
                    row.iter().zip(key).map(|(a, b)| a * b).sum::<f64>() * scale
                };
            }
            let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let total: f64 = scores.iter().map(|score| (score - max).exp()).sum();
            logsumexp[bh * s_q + i] = max + total.ln();
            let dst = &mut out[(bh * s_q + i) * d_v..(bh * s_q + i + 1) * d_v];
            for (j, score) in scores.iter().enumerate() {
                let weight = (score - max).exp() / total;
                if weight == 0.0 {
                    continue;
                }
                let value = &vv[(bh * s_kv + j) * d_v..(bh * s_kv + j + 1) * d_v];
                for (acc, value) in dst.iter_mut().zip(value) {
                    *acc += weight * value;
                }
            }
        }
    }
    Ok(vec![out, logsumexp])
}

#[cfg(test)]
mod tests {
    use super::{broadcast_to, softmax, sum_over};

    #[test]
    fn broadcast_column_vector_repeats_across_columns() {
        let out = broadcast_to(&[1.0, 2.0], &[2, 1], &[2, 3]);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn sum_over_last_dim_of_rank_three() {
        let values = (0..8).map(f64::from).collect::<Vec<_>>();
        let out = sum_over(&values, &[2, 2, 2], &[2]);
        assert_eq!(out, vec![1.0, 5.0, 9.0, 13.0]);
    }

    #[test]
    fn softmax_along_leading_dim() {
        let out = softmax(&[0.0, 1.0, 0.0, 1.0], &[2, 2], 0);
        assert!(out.iter().all(|value| (value - 0.5).abs() < 1e-12));
    }
}
