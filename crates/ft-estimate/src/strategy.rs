use ft_core::{OpInvocation, Tensor};
use ft_device::HostStream;
use ft_dispatch::DispatchEnv;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::{EstimateMode, EstimatorConfig};
use crate::error::EstimateError;
use crate::flops::FlopRegistry;
use crate::learned::{self, PredictorGroup, PredictorStore};
use crate::realize::{BenchmarkProtocol, FallbackReason, Realization, run_and_benchmark};
use crate::registry;
use crate::roofline::{self, output_metas, output_precision};

/// Outputs of one intercepted operation and its estimated runtime.
#[derive(Debug)]
pub struct Estimate {
    pub outputs: Vec<Tensor>,
    pub elapsed_ms: f64,
    /// Set when benchmarking was abandoned for symbolic execution.
    pub fallback: Option<FallbackReason>,
}

impl Estimate {
    fn free(outputs: Vec<Tensor>) -> Self {
        Self {
            outputs,
            elapsed_ms: 0.0,
            fallback: None,
        }
    }
}

pub trait EstimationStrategy {
    fn mode(&self) -> EstimateMode;

    /// Produce the symbolic outputs of `inv` and its runtime in milliseconds.
    fn estimate(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<Estimate, EstimateError>;
}

fn symbolic_outputs(inv: &OpInvocation, env: &DispatchEnv<'_>) -> Result<Vec<Tensor>, EstimateError> {
    let context = env.symbolic.ok_or(EstimateError::NoSymbolicContext)?;
    Ok(context.execute(inv)?)
}

/// Times the host kernel on realized operands.
#[derive(Debug)]
pub struct BenchmarkStrategy {
    protocol: BenchmarkProtocol,
    stream: HostStream,
    rng: StdRng,
}

impl BenchmarkStrategy {
    #[must_use]
    pub fn new(protocol: BenchmarkProtocol, seed: u64) -> Self {
        Self {
            protocol,
            stream: HostStream::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl EstimationStrategy for BenchmarkStrategy {
    fn mode(&self) -> EstimateMode {
        EstimateMode::Benchmark
    }

    fn estimate(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<Estimate, EstimateError> {
        if inv.kind.is_cost_free() {
            return Ok(Estimate::free(symbolic_outputs(inv, env)?));
        }
        match run_and_benchmark(inv, env, &mut self.stream, self.protocol, &mut self.rng)? {
            Realization::Timed { outputs, mean_ms } => Ok(Estimate {
                outputs,
                elapsed_ms: mean_ms,
                fallback: None,
            }),
            Realization::Unsupported(reason) => {
                registry::record_unsupported(inv.kind);
                Ok(Estimate {
                    fallback: Some(reason),
                    ..Estimate::free(symbolic_outputs(inv, env)?)
                })
            }
        }
    }
}

/// Analytical roofline model.
#[derive(Debug, Clone)]
pub struct RooflineStrategy {
    flops: FlopRegistry,
    efficiency: f64,
}

impl RooflineStrategy {
    #[must_use]
    pub fn new(flops: FlopRegistry, efficiency: f64) -> Self {
        Self { flops, efficiency }
    }
}

impl EstimationStrategy for RooflineStrategy {
    fn mode(&self) -> EstimateMode {
        EstimateMode::CostModel
    }

    fn estimate(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<Estimate, EstimateError> {
        let device = registry::capabilities()?;
        let outputs = symbolic_outputs(inv, env)?;
        let bound = roofline::estimate(inv, &outputs, device.as_ref(), &self.flops, self.efficiency)?;
        Ok(Estimate {
            elapsed_ms: bound.total_ms(),
            ..Estimate::free(outputs)
        })
    }
}

/// Roofline memory bound with a learned compute-time predictor.
#[derive(Debug, Clone)]
pub struct LearnedStrategy {
    flops: FlopRegistry,
    store: PredictorStore,
}

impl LearnedStrategy {
    #[must_use]
    pub fn new(flops: FlopRegistry, store: PredictorStore) -> Self {
        Self { flops, store }
    }

    /// Predicted compute milliseconds; zero for kinds without a predictor.
    fn compute_ms(&self, inv: &OpInvocation, outputs: &[Tensor]) -> Result<f64, EstimateError> {
        let Some(group) = PredictorGroup::for_op(inv.kind) else {
            return Ok(0.0);
        };
        let dtype = output_precision(inv.kind, outputs)?;
        let flops = self.flops.count(inv, &output_metas(outputs))?.unwrap_or(0.0);
        let features = learned::features(inv, dtype, flops / 1e9)?;
        let predictor = registry::cached_predictor(&self.store, group)?;
        Ok(predictor.predict(&features)?)
    }
}

impl EstimationStrategy for LearnedStrategy {
    fn mode(&self) -> EstimateMode {
        EstimateMode::LearnedModel
    }

    fn estimate(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<Estimate, EstimateError> {
        let device = registry::capabilities()?;
        let outputs = symbolic_outputs(inv, env)?;
        if inv.kind.is_cost_free() {
            return Ok(Estimate::free(outputs));
        }
        let transfer_ms = roofline::memory_bound_ms(inv, &outputs, device.as_ref())?;
        let compute_ms = self.compute_ms(inv, &outputs)?;
        Ok(Estimate {
            elapsed_ms: transfer_ms.max(compute_ms),
            ..Estimate::free(outputs)
        })
    }
}

/// The strategy `config` selects.
#[must_use]
pub fn strategy_for(config: &EstimatorConfig, flops: FlopRegistry) -> Box<dyn EstimationStrategy> {
    match config.mode {
        EstimateMode::Benchmark => Box::new(BenchmarkStrategy::new(
            BenchmarkProtocol {
                warmup_iters: config.warmup_iters,
                timed_iters: config.timed_iters,
            },
            config.benchmark_seed,
        )),
        EstimateMode::CostModel => Box::new(RooflineStrategy::new(flops, config.efficiency_factor)),
        EstimateMode::LearnedModel => Box::new(LearnedStrategy::new(
            flops,
            PredictorStore::new(config.predictor_root.clone()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use ft_core::{DType, Device, OpInvocation, OpKind, Operand, Phase, Tensor};
    use ft_device::{DeviceCapabilities, DeviceProfile, UnavailableDevice};
    use ft_dispatch::{DispatchEnv, SymbolicContext};

    use super::{BenchmarkStrategy, EstimationStrategy, strategy_for};
    use crate::config::{EstimateMode, EstimatorConfig};
    use crate::error::EstimateError;
    use crate::flops::FlopRegistry;
    use crate::realize::BenchmarkProtocol;
    use crate::registry;

    fn placeholder(context: &SymbolicContext, shape: &[i64]) -> Tensor {
        let inv = OpInvocation::new(OpKind::Ones, vec![Operand::Ints(shape.to_vec())])
            .with_kwarg("dtype", Operand::DType(DType::F32))
            .with_kwarg("device", Operand::Device(Device::Cpu));
        context.execute(&inv).expect("ones").remove(0)
    }

    #[test]
    fn config_selects_matching_strategy() {
        for mode in EstimateMode::all() {
            let strategy = strategy_for(&EstimatorConfig::new(*mode), FlopRegistry::empty());
            assert_eq!(strategy.mode(), *mode);
        }
    }

    #[test]
    fn benchmark_skips_views() {
        let context = SymbolicContext::new();
        let x = placeholder(&context, &[4, 6]);
        let env = DispatchEnv {
            symbolic: Some(&context),
            open_scopes: &[],
            phase: Phase::Forward,
        };
        let inv = OpInvocation::new(
            OpKind::Reshape,
            vec![Operand::Tensor(x.clone()), Operand::Ints(vec![24])],
        );
        let mut strategy = BenchmarkStrategy::new(BenchmarkProtocol::default(), 0);
        let estimate = strategy.estimate(&inv, &env).expect("reshape");
        assert_eq!(estimate.elapsed_ms, 0.0);
        assert_eq!(estimate.outputs[0].storage_id(), x.storage_id());
        assert_eq!(estimate.outputs[0].meta().shape(), &[24]);
    }

    /// A valid invocation of the view or creation kind `kind` over `x`,
    /// a 2x3 placeholder.
    fn cost_free_invocation(kind: OpKind, x: &Tensor) -> OpInvocation {
        let x = Operand::Tensor(x.clone());
        let args = match kind {
            OpKind::Detach
            | OpKind::T
            | OpKind::Squeeze
            | OpKind::ZerosLike
            | OpKind::OnesLike
            | OpKind::RandLike
            | OpKind::RandnLike => vec![x],
            OpKind::View | OpKind::Reshape => vec![x, Operand::Ints(vec![6])],
            OpKind::Transpose | OpKind::Select => vec![x, Operand::Int(0), Operand::Int(1)],
            OpKind::Permute => vec![x, Operand::Ints(vec![1, 0])],
            OpKind::Expand => vec![x, Operand::Ints(vec![4, 2, 3])],
            OpKind::Unsqueeze => vec![x, Operand::Int(0)],
            OpKind::Split | OpKind::Chunk => vec![x, Operand::Int(1)],
            OpKind::AsStrided => vec![x, Operand::Ints(vec![3]), Operand::Ints(vec![1])],
            OpKind::Zeros | OpKind::Ones | OpKind::Rand | OpKind::Randn => {
                vec![Operand::Ints(vec![2, 3])]
            }
            OpKind::Arange => vec![Operand::Int(4)],
            other => panic!("{other} carries a modeled cost"),
        };
        OpInvocation::new(kind, args)
    }

    #[test]
    fn views_and_creation_are_free_in_every_mode() {
        let _serial = registry::exclusive();
        let context = SymbolicContext::new();
        let x = placeholder(&context, &[2, 3]);
        let env = DispatchEnv {
            symbolic: Some(&context),
            open_scopes: &[],
            phase: Phase::Forward,
        };
        let device = DeviceProfile::a100();
        let missing_predictors = std::env::temp_dir().join("ft-estimate-no-predictors");
        let cost_free = OpKind::all()
            .iter()
            .copied()
            .filter(|kind| kind.is_cost_free())
            .collect::<Vec<_>>();
        assert!(cost_free.len() > 20);

        registry::acquire(Rc::new(device.clone())).expect("acquire");
        for mode in EstimateMode::all() {
            let config = EstimatorConfig::new(*mode)
                .with_device(device.clone())
                .with_predictor_root(&missing_predictors);
            let mut strategy = strategy_for(&config, FlopRegistry::with_defaults());
            for kind in &cost_free {
                let estimate = strategy
                    .estimate(&cost_free_invocation(*kind, &x), &env)
                    .unwrap_or_else(|error| panic!("{mode} {kind}: {error}"));
                assert_eq!(estimate.elapsed_ms, 0.0, "{mode} {kind}");
                assert!(estimate.fallback.is_none());
            }
        }
        registry::release();
    }

    #[test]
    fn modeled_strategies_require_a_configured_device() {
        let _serial = registry::exclusive();
        let context = SymbolicContext::new();
        let x = placeholder(&context, &[2, 3]);
        let env = DispatchEnv {
            symbolic: Some(&context),
            open_scopes: &[],
            phase: Phase::Forward,
        };
        let unavailable: Rc<dyn DeviceCapabilities> = Rc::new(UnavailableDevice);
        registry::acquire(unavailable).expect("acquire");
        let mut outcomes = Vec::new();
        for mode in EstimateMode::all() {
            let mut strategy = strategy_for(&EstimatorConfig::new(*mode), FlopRegistry::empty());
            let view = cost_free_invocation(OpKind::Reshape, &x);
            let creation = cost_free_invocation(OpKind::Zeros, &x);
            outcomes.push((
                *mode,
                strategy.estimate(&view, &env).map(|estimate| estimate.elapsed_ms),
                strategy.estimate(&creation, &env).map(|estimate| estimate.elapsed_ms),
            ));
        }
        registry::release();

        for (mode, view, creation) in outcomes {
            if mode == EstimateMode::Benchmark {
                assert_eq!(view.expect("benchmark needs no device"), 0.0);
                assert_eq!(creation.expect("benchmark needs no device"), 0.0);
            } else {
                assert!(matches!(view, Err(EstimateError::Device(_))), "{mode}");
                assert!(matches!(creation, Err(EstimateError::Device(_))), "{mode}");
            }
        }
    }
}
