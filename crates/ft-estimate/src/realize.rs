//! Fallback kernel realizer.
//!
//! Symbolic operands are replaced by real tensors of the same metadata, the
//! host kernel is run and timed, and the real outputs are mapped back to
//! placeholders. An output that is one of the realized operands maps back to
//! the operand's placeholder. An output sharing an operand's storage under a
//! new handle cannot be mapped, so the realization is abandoned.

use std::collections::{BTreeMap, BTreeSet};

use ft_core::{
    OpInvocation, OpKind, Operand, RealTensor, StorageId, SymbolicTensor, Tensor, TensorId,
};
use ft_device::{DeviceGuard, ExecutionStream};
use ft_dispatch::{DispatchEnv, SymbolicContext, redispatch};
use rand::Rng;
use rand::rngs::StdRng;

use crate::error::EstimateError;

/// Iteration counts of one timed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkProtocol {
    pub warmup_iters: usize,
    pub timed_iters: usize,
}

impl Default for BenchmarkProtocol {
    fn default() -> Self {
        Self {
            warmup_iters: 2,
            timed_iters: 3,
        }
    }
}

/// Why an operation was executed symbolically instead of benchmarked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The operation rewrites operand metadata in place.
    InplaceView,
    /// An output aliases operand storage under a handle we cannot trace.
    UntracedAlias,
}

impl FallbackReason {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::InplaceView => "inplace_view",
            Self::UntracedAlias => "untraced_alias",
        }
    }
}

#[derive(Debug)]
pub enum Realization {
    Timed {
        outputs: Vec<Tensor>,
        mean_ms: f64,
    },
    Unsupported(FallbackReason),
}

/// Real tensors standing in for the symbolic operands of one invocation.
struct RealizedOperands {
    invocation: OpInvocation,
    aliases: BTreeMap<TensorId, SymbolicTensor>,
    storages: BTreeSet<StorageId>,
}

fn realize_operands(
    inv: &OpInvocation,
    context: &SymbolicContext,
    guard: DeviceGuard,
    rng: &mut StdRng,
) -> Result<RealizedOperands, EstimateError> {
    let mut aliases = BTreeMap::new();
    let invocation = inv.try_map_operands(|operand| -> Result<Operand, EstimateError> {
        match operand {
            Operand::Tensor(Tensor::Symbolic(symbolic))
                if symbolic.context() == context.id() =>
            {
                let real = realize(symbolic, guard, rng)?;
                aliases.insert(real.id(), symbolic.clone());
                Ok(Operand::Tensor(Tensor::Real(real)))
            }
            _ => Ok(operand.clone()),
        }
    })?;
    let storages = invocation
        .tensors()
        .filter(|tensor| !tensor.meta().is_sparse())
        .map(Tensor::storage_id)
        .collect();
    Ok(RealizedOperands {
        invocation,
        aliases,
        storages,
    })
}

/// Random values for floating dtypes, ones otherwise. The layout, including
/// the sparse coalesced flag, is carried over.
fn realize(
    symbolic: &SymbolicTensor,
    guard: DeviceGuard,
    rng: &mut StdRng,
) -> Result<RealTensor, EstimateError> {
    let meta = symbolic.meta();
    guard.ensure_meta_device(meta)?;
    let contiguous = meta.reshaped_contiguous(meta.shape().to_vec());
    let numel = contiguous.numel();
    let values = if meta.dtype().is_floating() {
        (0..numel).map(|_| rng.random::<f64>()).collect()
    } else {
        vec![1.0; numel]
    };
    Ok(RealTensor::from_values(values, contiguous)?)
}

/// Run `inv` for real once, then time it under `protocol`, and map the
/// baseline outputs back to placeholders of `env`'s symbolic context.
pub fn run_and_benchmark(
    inv: &OpInvocation,
    env: &DispatchEnv<'_>,
    stream: &mut dyn ExecutionStream,
    protocol: BenchmarkProtocol,
    rng: &mut StdRng,
) -> Result<Realization, EstimateError> {
    if inv.kind.tags().inplace_view {
        return Ok(Realization::Unsupported(FallbackReason::InplaceView));
    }
    let context = env.symbolic.ok_or(EstimateError::NoSymbolicContext)?;
    let realized = realize_operands(inv, context, DeviceGuard::new(stream.device()), rng)?;
    let real_env = env.without_symbolic();
    let run = |rng: &mut StdRng| redispatch(&realized.invocation, &real_env, rng);

    let baseline = run(rng)?;
    for _ in 0..protocol.warmup_iters {
        run(rng)?;
    }
    let start = stream.record();
    for _ in 0..protocol.timed_iters {
        run(rng)?;
    }
    let end = stream.record();
    stream.synchronize();
    let mean_ms = stream.elapsed_ms(&start, &end) / protocol.timed_iters.max(1) as f64;

    let mut outputs = Vec::with_capacity(baseline.len());
    for output in baseline {
        match map_output(inv.kind, output, &realized, context)? {
            Some(tensor) => outputs.push(tensor),
            None => return Ok(Realization::Unsupported(FallbackReason::UntracedAlias)),
        }
    }
    Ok(Realization::Timed { outputs, mean_ms })
}

fn map_output(
    op: OpKind,
    output: Tensor,
    realized: &RealizedOperands,
    context: &SymbolicContext,
) -> Result<Option<Tensor>, EstimateError> {
    if let Some(symbolic) = realized.aliases.get(&output.id()) {
        return Ok(Some(Tensor::Symbolic(symbolic.clone())));
    }
    if !output.meta().is_sparse() && realized.storages.contains(&output.storage_id()) {
        return Ok(None);
    }
    match output {
        Tensor::Real(real) => Ok(Some(Tensor::Symbolic(context.from_real(&real)?))),
        Tensor::Symbolic(_) => Err(EstimateError::InvalidOperands {
            op,
            reason: "host kernel returned a placeholder".to_string(),
        }),
    }
}
