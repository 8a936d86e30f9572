//! Analytical operation counts. Every formula counts two FLOPs per
//! multiply-accumulate.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use ft_core::{OpInvocation, OpKind, Operand, TensorMeta};

use crate::error::EstimateError;

/// `(invocation, output metadata) -> FLOPs`.
pub type FlopFormula = Rc<dyn Fn(&OpInvocation, &[TensorMeta]) -> Result<f64, EstimateError>>;

#[derive(Clone, Default)]
pub struct FlopRegistry {
    formulas: BTreeMap<OpKind, FlopFormula>,
}

impl fmt::Debug for FlopRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlopRegistry")
            .field("kinds", &self.formulas.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FlopRegistry {
    /// Registry with no formulas; every kind counts as zero compute.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Formulas for matrix products, convolution and attention.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut formulas: BTreeMap<OpKind, FlopFormula> = BTreeMap::new();
        formulas.insert(OpKind::Mm, formula(|inv, _| mm_flops(inv, 0)));
        formulas.insert(OpKind::Addmm, formula(|inv, _| mm_flops(inv, 1)));
        formulas.insert(OpKind::Bmm, formula(|inv, _| bmm_flops(inv, 0)));
        formulas.insert(OpKind::Baddbmm, formula(|inv, _| bmm_flops(inv, 1)));
        formulas.insert(OpKind::Convolution, formula(convolution_flops));
        formulas.insert(
            OpKind::ConvolutionBackward,
            formula(convolution_backward_flops),
        );
        for kind in [OpKind::SdpaEfficient, OpKind::SdpaFlash] {
            formulas.insert(kind, formula(|inv, _| attention_flops(inv)));
        }
        for kind in [OpKind::SdpaEfficientBackward, OpKind::SdpaFlashBackward] {
            formulas.insert(kind, formula(|inv, _| attention_backward_flops(inv)));
        }
        Self { formulas }
    }

    /// Register `formula` for `kind`. A kind holds at most one formula.
    pub fn register(
        &mut self,
        kind: OpKind,
        formula: impl Fn(&OpInvocation, &[TensorMeta]) -> Result<f64, EstimateError> + 'static,
    ) -> Result<(), EstimateError> {
        if self.formulas.contains_key(&kind) {
            return Err(EstimateError::DuplicateFormula { op: kind });
        }
        self.formulas.insert(kind, Rc::new(formula));
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, kind: OpKind) -> bool {
        self.formulas.contains_key(&kind)
    }

    #[must_use]
    pub fn lookup(&self, kind: OpKind) -> Option<&FlopFormula> {
        self.formulas.get(&kind)
    }

    /// FLOPs of `inv`, or `None` when no formula is registered for its kind.
    pub fn count(
        &self,
        inv: &OpInvocation,
        outputs: &[TensorMeta],
    ) -> Result<Option<f64>, EstimateError> {
        self.lookup(inv.kind)
            .map(|formula| formula(inv, outputs))
            .transpose()
    }
}

fn formula(
    count: impl Fn(&OpInvocation, &[TensorMeta]) -> Result<f64, EstimateError> + 'static,
) -> FlopFormula {
    Rc::new(count)
}

pub(crate) fn shape_at(inv: &OpInvocation, index: usize) -> Result<&[usize], EstimateError> {
    inv.args
        .get(index)
        .and_then(Operand::as_tensor)
        .map(|tensor| tensor.meta().shape())
        .ok_or_else(|| EstimateError::InvalidOperands {
            op: inv.kind,
            reason: format!("operand {index} is not a tensor"),
        })
}

fn shape_error(inv: &OpInvocation, lhs: &[usize], rhs: &[usize]) -> EstimateError {
    EstimateError::InvalidOperands {
        op: inv.kind,
        reason: format!("incompatible operand shapes {lhs:?} and {rhs:?}"),
    }
}

/// `[m, k] @ [k, n]` with the operands starting at `first`.
pub(crate) fn matmul_dims(
    inv: &OpInvocation,
    first: usize,
) -> Result<(usize, usize, usize), EstimateError> {
    let lhs = shape_at(inv, first)?;
    let rhs = shape_at(inv, first + 1)?;
    match (lhs, rhs) {
        ([m, k], [k2, n]) if k == k2 => Ok((*m, *k, *n)),
        _ => Err(shape_error(inv, lhs, rhs)),
    }
}

/// `[b, m, k] @ [b, k, n]` with the operands starting at `first`.
pub(crate) fn batched_matmul_dims(
    inv: &OpInvocation,
    first: usize,
) -> Result<(usize, usize, usize, usize), EstimateError> {
    let lhs = shape_at(inv, first)?;
    let rhs = shape_at(inv, first + 1)?;
    match (lhs, rhs) {
        ([b, m, k], [b2, k2, n]) if b == b2 && k == k2 => Ok((*b, *m, *k, *n)),
        _ => Err(shape_error(inv, lhs, rhs)),
    }
}

/// `(b, h, s_q, s_kv, d_qk, d_v)` of attention operands starting at `first`.
pub(crate) fn attention_dims(
    inv: &OpInvocation,
    first: usize,
) -> Result<[usize; 6], EstimateError> {
    let q = shape_at(inv, first)?;
    let k = shape_at(inv, first + 1)?;
    let v = shape_at(inv, first + 2)?;
    match (q, k, v) {
        ([b, h, s_q, d_qk], [b2, h2, s_kv, d_k], [b3, h3, s_v, d_v])
            if b == b2 && b == b3 && h == h2 && h == h3 && d_qk == d_k && s_kv == s_v =>
        {
            Ok([*b, *h, *s_q, *s_kv, *d_qk, *d_v])
        }
        _ => Err(shape_error(inv, q, k)),
    }
}

fn mm_flops(inv: &OpInvocation, first: usize) -> Result<f64, EstimateError> {
    let (m, k, n) = matmul_dims(inv, first)?;
    Ok(2.0 * m as f64 * k as f64 * n as f64)
}

fn bmm_flops(inv: &OpInvocation, first: usize) -> Result<f64, EstimateError> {
    let (b, m, k, n) = batched_matmul_dims(inv, first)?;
    Ok(2.0 * b as f64 * m as f64 * k as f64 * n as f64)
}

fn product(dims: &[usize]) -> f64 {
    dims.iter().map(|&dim| dim as f64).product()
}

/// Every output position sees every filter tap of every input channel.
fn conv_flop_count(x: &[usize], w: &[usize], out: &[usize], transposed: bool) -> f64 {
    let batch = x.first().copied().unwrap_or(0) as f64;
    let conv_shape = if transposed { x } else { out };
    let (c_out, c_in) = match w {
        [c_out, c_in, ..] => (*c_out as f64, *c_in as f64),
        _ => (0.0, 0.0),
    };
    let filter = w.get(2..).map_or(0.0, product);
    let positions = conv_shape.get(2..).map_or(0.0, product);
    2.0 * batch * c_out * c_in * filter * positions
}

fn bool_arg(inv: &OpInvocation, index: usize) -> Result<bool, EstimateError> {
    match inv.args.get(index) {
        Some(Operand::Bool(value)) => Ok(*value),
        _ => Err(EstimateError::InvalidOperands {
            op: inv.kind,
            reason: format!("operand {index} is not a bool"),
        }),
    }
}

fn convolution_flops(inv: &OpInvocation, outputs: &[TensorMeta]) -> Result<f64, EstimateError> {
    let x = shape_at(inv, 0)?;
    let w = shape_at(inv, 1)?;
    let out = outputs
        .first()
        .ok_or_else(|| EstimateError::InvalidOperands {
            op: inv.kind,
            reason: "convolution produced no output".to_string(),
        })?;
    Ok(conv_flop_count(x, w, out.shape(), bool_arg(inv, 6)?))
}

fn swap_channels(shape: &[usize]) -> Vec<usize> {
    let mut out = shape.to_vec();
    if out.len() >= 2 {
        out.swap(0, 1);
    }
    out
}

/// Operands: `(grad_output, input, weight, bias_sizes, stride, padding,
/// dilation, transposed, output_padding, groups, output_mask)`.
fn convolution_backward_flops(
    inv: &OpInvocation,
    outputs: &[TensorMeta],
) -> Result<f64, EstimateError> {
    let grad = shape_at(inv, 0)?;
    let x = shape_at(inv, 1)?;
    let w = shape_at(inv, 2)?;
    let transposed = bool_arg(inv, 7)?;
    let mask = match inv.args.get(10) {
        Some(Operand::Ints(mask)) if mask.len() == 3 => mask,
        _ => {
            return Err(EstimateError::InvalidOperands {
                op: inv.kind,
                reason: "output mask needs three entries".to_string(),
            });
        }
    };
    let mut outputs = outputs.iter();
    let mut flops = 0.0;
    if mask[0] != 0 {
        if let Some(grad_input) = outputs.next() {
            flops += conv_flop_count(grad, w, grad_input.shape(), !transposed);
        }
    }
    if mask[1] != 0 {
        if let Some(grad_weight) = outputs.next() {
            let grad_weight = swap_channels(grad_weight.shape());
            flops += if transposed {
                conv_flop_count(&swap_channels(grad), &swap_channels(x), &grad_weight, false)
            } else {
                conv_flop_count(&swap_channels(x), &swap_channels(grad), &grad_weight, false)
            };
        }
    }
    Ok(flops)
}

/// `q @ k^T` followed by `scores @ v`.
fn attention_flops(inv: &OpInvocation) -> Result<f64, EstimateError> {
    let [b, h, s_q, s_kv, d_qk, d_v] = attention_dims(inv, 0)?.map(|dim| dim as f64);
    let batch = b * h;
    Ok(2.0 * batch * s_q * s_kv * d_qk + 2.0 * batch * s_q * s_kv * d_v)
}

/// Operands: `(grad_output, q, k, v, ...)`. Four products: grad of v, grad of
/// the scores, grad of q and grad of k.
fn attention_backward_flops(inv: &OpInvocation) -> Result<f64, EstimateError> {
    let [b, h, s_q, s_kv, d_qk, d_v] = attention_dims(inv, 1)?.map(|dim| dim as f64);
    let batch = b * h;
    let grad_value = 2.0 * batch * s_kv * s_q * d_v;
    let grad_scores = 2.0 * batch * s_q * d_v * s_kv;
    let grad_query = 2.0 * batch * s_q * s_kv * d_qk;
    let grad_key = 2.0 * batch * s_kv * s_q * d_qk;
    Ok(grad_value + grad_scores + grad_query + grad_key)
}

#[cfg(test)]
mod tests {
    use ft_core::{
        DType, Device, OpInvocation, OpKind, Operand, SymbolicTensor, Tensor, TensorMeta,
    };

    use super::FlopRegistry;
    use crate::error::EstimateError;

    fn placeholder(shape: &[usize]) -> Operand {
        let meta = TensorMeta::from_shape(shape.to_vec(), DType::F32, Device::Cpu);
        Operand::Tensor(Tensor::Symbolic(
            SymbolicTensor::new(meta, 0).expect("placeholder"),
        ))
    }

    fn out(shape: &[usize]) -> TensorMeta {
        TensorMeta::from_shape(shape.to_vec(), DType::F32, Device::Cpu)
    }

    #[test]
    fn matrix_products_count_two_flops_per_mac() {
        let registry = FlopRegistry::with_defaults();
        let mm = OpInvocation::new(OpKind::Mm, vec![placeholder(&[128, 64]), placeholder(&[64, 32])]);
        let flops = registry.count(&mm, &[out(&[128, 32])]).expect("mm");
        assert_eq!(flops, Some(2.0 * 128.0 * 64.0 * 32.0));

        let addmm = OpInvocation::new(
            OpKind::Addmm,
            vec![placeholder(&[32]), placeholder(&[8, 4]), placeholder(&[4, 32])],
        );
        assert_eq!(
            registry.count(&addmm, &[out(&[8, 32])]).expect("addmm"),
            Some(2.0 * 8.0 * 4.0 * 32.0)
        );

        let bmm = OpInvocation::new(
            OpKind::Bmm,
            vec![placeholder(&[3, 8, 4]), placeholder(&[3, 4, 2])],
        );
        assert_eq!(
            registry.count(&bmm, &[out(&[3, 8, 2])]).expect("bmm"),
            Some(2.0 * 3.0 * 8.0 * 4.0 * 2.0)
        );
    }

    #[test]
    fn kinds_without_formula_count_as_none() {
        let registry = FlopRegistry::with_defaults();
        let relu = OpInvocation::new(OpKind::Relu, vec![placeholder(&[4])]);
        assert_eq!(registry.count(&relu, &[out(&[4])]).expect("relu"), None);
    }

    #[test]
    fn convolution_counts_every_filter_tap() {
        let registry = FlopRegistry::with_defaults();
        let inv = OpInvocation::new(
            OpKind::Convolution,
            vec![
                placeholder(&[2, 3, 8, 8]),
                placeholder(&[4, 3, 3, 3]),
                Operand::None,
                Operand::Ints(vec![1, 1]),
                Operand::Ints(vec![0, 0]),
                Operand::Ints(vec![1, 1]),
                Operand::Bool(false),
                Operand::Ints(vec![0, 0]),
                Operand::Int(1),
            ],
        );
        let flops = registry.count(&inv, &[out(&[2, 4, 6, 6])]).expect("conv");
        assert_eq!(flops, Some(2.0 * 2.0 * 4.0 * 3.0 * 9.0 * 36.0));
    }

    #[test]
    fn attention_counts_scores_and_weighted_sum() {
        let registry = FlopRegistry::with_defaults();
        let inv = OpInvocation::new(
            OpKind::SdpaFlash,
            vec![
                placeholder(&[2, 4, 16, 8]),
                placeholder(&[2, 4, 32, 8]),
                placeholder(&[2, 4, 32, 8]),
            ],
        );
        let flops = registry.count(&inv, &[]).expect("sdpa").expect("formula");
        assert_eq!(flops, 2.0 * 2.0 * (8.0 * 16.0 * 32.0 * 8.0));
    }

    #[test]
    fn mismatched_inner_dims_are_rejected() {
        let registry = FlopRegistry::with_defaults();
        let inv = OpInvocation::new(OpKind::Mm, vec![placeholder(&[2, 3]), placeholder(&[4, 5])]);
        assert!(matches!(
            registry.count(&inv, &[]),
            Err(EstimateError::InvalidOperands { .. })
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = FlopRegistry::empty();
        registry.register(OpKind::Mm, |_, _| Ok(1.0)).expect("first");
        assert!(matches!(
            registry.register(OpKind::Mm, |_, _| Ok(2.0)),
            Err(EstimateError::DuplicateFormula { op: OpKind::Mm })
        ));
        assert!(registry.contains(OpKind::Mm));
        assert!(!registry.contains(OpKind::Bmm));
    }
}
