#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ft_core::{
    DType, OpInvocation, OpKind, Phase, RealTensor, SymbolicTensor, Tensor, TensorMetaError,
};
use ft_kernel_cpu::{KernelError, OutputOrigin, infer_outputs};
use rand::SeedableRng;
use rand::rngs::StdRng;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata-only execution context. Tensors it creates carry its id, so a
/// placeholder from another context is never mistaken for one of ours.
#[derive(Debug, PartialEq, Eq)]
pub struct SymbolicContext {
    id: u64,
}

impl Default for SymbolicContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolicContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_symbolic(&self, tensor: &Tensor) -> bool {
        tensor
            .as_symbolic()
            .is_some_and(|symbolic| symbolic.context() == self.id)
    }

    #[must_use]
    pub fn is_floating(&self, dtype: DType) -> bool {
        dtype.is_floating()
    }

    /// Fresh placeholder mirroring `real`'s metadata and storage size.
    pub fn from_real(&self, real: &RealTensor) -> Result<SymbolicTensor, DispatchError> {
        Ok(SymbolicTensor::with_storage_len(
            real.meta().clone(),
            real.storage().len(),
            self.id,
        )?)
    }

    /// Run `inv` on placeholders only: views share the input storage handle,
    /// in-place ops hand back their input handle.
    pub fn execute(&self, inv: &OpInvocation) -> Result<Vec<Tensor>, DispatchError> {
        let specs = infer_outputs(inv)?;
        let mut outputs = Vec::with_capacity(specs.len());
        for spec in specs {
            let tensor = match spec.origin {
                OutputOrigin::Fresh => SymbolicTensor::new(spec.meta, self.id)?,
                OutputOrigin::View { input } => {
                    self.symbolic_input(inv, input)?.view_with(spec.meta)?
                }
                OutputOrigin::InPlace { input } => {
                    let target = self.symbolic_input(inv, input)?;
                    if inv.kind.tags().inplace_view {
                        target.restrided(spec.meta)?
                    } else {
                        target.clone()
                    }
                }
            };
            outputs.push(Tensor::Symbolic(tensor));
        }
        Ok(outputs)
    }

    fn symbolic_input<'a>(
        &self,
        inv: &'a OpInvocation,
        index: usize,
    ) -> Result<&'a SymbolicTensor, DispatchError> {
        inv.args
            .get(index)
            .and_then(|operand| operand.as_tensor())
            .and_then(Tensor::as_symbolic)
            .filter(|tensor| tensor.context() == self.id)
            .ok_or(DispatchError::Key(DispatchKeyError::IncompatibleSet {
                reason: "symbolic execution needs symbolic operands from the active context",
            }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    BackendSelect = 1,
    CPU = 2,
    Symbolic = 3,
    Interceptor = 4,
}

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &[
            DispatchKey::BackendSelect,
            DispatchKey::CPU,
            DispatchKey::Symbolic,
            DispatchKey::Interceptor,
        ]
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

const TYPE_PRIORITY: [DispatchKey; 4] = [
    DispatchKey::Interceptor,
    DispatchKey::Symbolic,
    DispatchKey::CPU,
    DispatchKey::BackendSelect,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    pub fn highest_priority_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        TYPE_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoTypeKey)
    }

    /// The route taken once the interceptor, if any, hands the call back.
    pub fn below_interceptor(self) -> Result<DispatchKey, DispatchKeyError> {
        let mut rest = self;
        rest.remove(DispatchKey::Interceptor);
        rest.highest_priority_type_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    NoTypeKey,
    MixedOperands { symbolic: usize, real: usize },
    MissingSymbolicContext,
    ForeignSymbolic { index: usize },
    IncompatibleSet { reason: &'static str },
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::NoTypeKey => write!(f, "dispatch keyset has no resolvable type key"),
            Self::MixedOperands { symbolic, real } => write!(
                f,
                "cannot mix {symbolic} symbolic and {real} real tensor operands"
            ),
            Self::MissingSymbolicContext => {
                write!(f, "symbolic operands require an active symbolic context")
            }
            Self::ForeignSymbolic { index } => write!(
                f,
                "tensor operand {index} belongs to a different symbolic context"
            ),
            Self::IncompatibleSet { reason } => {
                write!(f, "incompatible dispatch keyset: {reason}")
            }
        }
    }
}

impl std::error::Error for DispatchKeyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: OpKind,
    pub kernel: &'static str,
    pub selected_key: DispatchKey,
    pub keyset_bits: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub outputs: Vec<Tensor>,
    pub decision: DispatchDecision,
}

#[derive(Debug)]
pub enum DispatchError {
    Kernel(KernelError),
    Key(DispatchKeyError),
    Meta(TensorMetaError),
    InterceptorInstalled,
    Interceptor {
        op: OpKind,
        source: Box<dyn std::error::Error + 'static>,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
            Self::Meta(error) => write!(f, "symbolic output failure: {error}"),
            Self::InterceptorInstalled => write!(f, "an interceptor is already installed"),
            Self::Interceptor { op, source } => {
                write!(f, "interceptor failed on {op}: {source}")
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Interceptor { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

impl From<TensorMetaError> for DispatchError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

/// Ambient state an invocation is dispatched under.
#[derive(Debug, Clone, Copy)]
pub struct DispatchEnv<'a> {
    /// Active symbolic context; `None` means real execution.
    pub symbolic: Option<&'a SymbolicContext>,
    /// Qualified names of every open scope, outermost first.
    pub open_scopes: &'a [String],
    pub phase: Phase,
}

impl<'a> DispatchEnv<'a> {
    #[must_use]
    pub fn real() -> Self {
        Self {
            symbolic: None,
            open_scopes: &[],
            phase: Phase::Forward,
        }
    }

    /// Same scopes and phase with symbolic mode switched off.
    #[must_use]
    pub fn without_symbolic(self) -> Self {
        Self {
            symbolic: None,
            ..self
        }
    }
}

/// Observes every invocation routed through a [`Dispatcher`]. Implementors
/// produce the outputs themselves, typically by calling [`redispatch`].
pub trait OpInterceptor {
    fn intercept(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<Vec<Tensor>, DispatchError>;
}

pub fn dispatch_keyset_for_invocation(
    inv: &OpInvocation,
    symbolic: Option<&SymbolicContext>,
    intercepted: bool,
) -> Result<DispatchKeySet, DispatchKeyError> {
    let mut symbolic_count = 0usize;
    let mut real_count = 0usize;
    for (index, tensor) in inv.tensors().enumerate() {
        match tensor {
            Tensor::Symbolic(placeholder) => {
                let context = symbolic.ok_or(DispatchKeyError::MissingSymbolicContext)?;
                if placeholder.context() != context.id() {
                    return Err(DispatchKeyError::ForeignSymbolic { index });
                }
                symbolic_count += 1;
            }
            Tensor::Real(_) => real_count += 1,
        }
    }
    if real_count > 0 && (symbolic_count > 0 || symbolic.is_some()) {
        return Err(DispatchKeyError::MixedOperands {
            symbolic: symbolic_count,
            real: real_count,
        });
    }

    let mut keyset = DispatchKeySet::empty();
    keyset.add(DispatchKey::BackendSelect);
    if symbolic.is_some() {
        keyset.add(DispatchKey::Symbolic);
    } else {
        keyset.add(DispatchKey::CPU);
    }
    if intercepted {
        keyset.add(DispatchKey::Interceptor);
    }
    Ok(keyset)
}

/// Execute `inv` on the default route, bypassing any interceptor.
pub fn redispatch(
    inv: &OpInvocation,
    env: &DispatchEnv<'_>,
    rng: &mut StdRng,
) -> Result<Vec<Tensor>, DispatchError> {
    let keyset = dispatch_keyset_for_invocation(inv, env.symbolic, false)?;
    let (outputs, _) = run_default(inv, env, keyset, rng)?;
    Ok(outputs)
}

fn run_default(
    inv: &OpInvocation,
    env: &DispatchEnv<'_>,
    keyset: DispatchKeySet,
    rng: &mut StdRng,
) -> Result<(Vec<Tensor>, &'static str), DispatchError> {
    match keyset.below_interceptor()? {
        DispatchKey::Symbolic => {
            let context = env
                .symbolic
                .ok_or(DispatchKeyError::MissingSymbolicContext)?;
            Ok((context.execute(inv)?, "symbolic::infer"))
        }
        DispatchKey::CPU => {
            let outputs = ft_kernel_cpu::execute(inv, rng)?;
            Ok((
                outputs.into_iter().map(Tensor::Real).collect(),
                "cpu::host",
            ))
        }
        _ => Err(DispatchKeyError::IncompatibleSet {
            reason: "resolved dispatch key has no kernel",
        }
        .into()),
    }
}

/// Single entry point every operation is routed through.
pub struct Dispatcher {
    interceptor: Option<Box<dyn OpInterceptor>>,
    rng: StdRng,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("intercepted", &self.interceptor.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            interceptor: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn install_interceptor(
        &mut self,
        interceptor: Box<dyn OpInterceptor>,
    ) -> Result<(), DispatchError> {
        if self.interceptor.is_some() {
            return Err(DispatchError::InterceptorInstalled);
        }
        self.interceptor = Some(interceptor);
        Ok(())
    }

    pub fn uninstall_interceptor(&mut self) -> Option<Box<dyn OpInterceptor>> {
        self.interceptor.take()
    }

    #[must_use]
    pub fn is_intercepted(&self) -> bool {
        self.interceptor.is_some()
    }

    pub fn dispatch(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let keyset =
            dispatch_keyset_for_invocation(inv, env.symbolic, self.interceptor.is_some())?;
        let selected_key = keyset.highest_priority_type_id()?;
        let (outputs, kernel) = match (selected_key, self.interceptor.as_mut()) {
            (DispatchKey::Interceptor, Some(interceptor)) => {
                (interceptor.intercept(inv, env)?, "interceptor")
            }
            _ => run_default(inv, env, keyset, &mut self.rng)?,
        };
        Ok(DispatchOutcome {
            outputs,
            decision: DispatchDecision {
                op: inv.kind,
                kernel,
                selected_key,
                keyset_bits: keyset.bits(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use ft_core::{
        DType, Device, OpInvocation, OpKind, Operand, Phase, RealTensor, SymbolicTensor, Tensor,
        TensorMeta,
    };
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{
        DispatchEnv, DispatchError, DispatchKey, DispatchKeyError, DispatchKeySet, Dispatcher,
        OpInterceptor, SymbolicContext, TYPE_PRIORITY, dispatch_keyset_for_invocation, redispatch,
    };

    fn meta(shape: Vec<usize>) -> TensorMeta {
        TensorMeta::from_shape(shape, DType::F32, Device::Cpu)
    }

    fn placeholder(context: &SymbolicContext, shape: Vec<usize>) -> Tensor {
        Tensor::Symbolic(SymbolicTensor::new(meta(shape), context.id()).expect("placeholder"))
    }

    fn symbolic_env<'a>(context: &'a SymbolicContext, scopes: &'a [String]) -> DispatchEnv<'a> {
        DispatchEnv {
            symbolic: Some(context),
            open_scopes: scopes,
            phase: Phase::Forward,
        }
    }

    #[test]
    fn priority_resolution_prefers_interceptor() {
        let keys = DispatchKeySet::from_keys(&[
            DispatchKey::BackendSelect,
            DispatchKey::Symbolic,
            DispatchKey::Interceptor,
        ]);
        assert_eq!(
            keys.highest_priority_type_id().expect("priority"),
            DispatchKey::Interceptor
        );
        assert_eq!(
            keys.below_interceptor().expect("default route"),
            DispatchKey::Symbolic
        );
    }

    #[test]
    fn mixed_symbolic_and_real_operands_are_rejected() {
        let context = SymbolicContext::new();
        let real = RealTensor::from_values(vec![1.0, 2.0], meta(vec![2])).expect("real");
        let inv = OpInvocation::new(
            OpKind::Add,
            vec![
                Operand::Tensor(placeholder(&context, vec![2])),
                Operand::Tensor(Tensor::Real(real)),
            ],
        );
        let err = dispatch_keyset_for_invocation(&inv, Some(&context), false)
            .expect_err("mixed operands must fail");
        assert_eq!(
            err,
            DispatchKeyError::MixedOperands {
                symbolic: 1,
                real: 1
            }
        );
    }

    #[test]
    fn symbolic_operand_without_context_is_rejected() {
        let context = SymbolicContext::new();
        let inv = OpInvocation::new(
            OpKind::Relu,
            vec![Operand::Tensor(placeholder(&context, vec![2]))],
        );
        let err = dispatch_keyset_for_invocation(&inv, None, false)
            .expect_err("missing context must fail");
        assert_eq!(err, DispatchKeyError::MissingSymbolicContext);
    }

    #[test]
    fn foreign_placeholders_are_not_symbolic_for_this_context() {
        let ours = SymbolicContext::new();
        let theirs = SymbolicContext::new();
        let tensor = placeholder(&theirs, vec![3]);
        assert!(!ours.is_symbolic(&tensor));
        assert!(theirs.is_symbolic(&tensor));
        let inv = OpInvocation::new(OpKind::Relu, vec![Operand::Tensor(tensor)]);
        let err = dispatch_keyset_for_invocation(&inv, Some(&ours), false)
            .expect_err("foreign placeholder must fail");
        assert_eq!(err, DispatchKeyError::ForeignSymbolic { index: 0 });
    }

    #[test]
    fn from_real_keeps_metadata_and_storage_size() {
        let context = SymbolicContext::new();
        let base = RealTensor::from_values(vec![0.0; 6], meta(vec![2, 3])).expect("base");
        let row = base
            .view_with(meta(vec![3]).with_storage_offset(3))
            .expect("row view");
        let symbolic = context.from_real(&row).expect("from_real");
        assert_eq!(symbolic.meta(), row.meta());
        assert_eq!(symbolic.storage_len(), 6);
        assert!(context.is_symbolic(&Tensor::Symbolic(symbolic)));
    }

    #[test]
    fn symbolic_execution_preserves_in_place_identity() {
        let context = SymbolicContext::new();
        let x = placeholder(&context, vec![2, 2]);
        let inv = OpInvocation::new(
            OpKind::MulInPlace,
            vec![Operand::Tensor(x.clone()), Operand::Scalar(2.0)],
        );
        let out = context.execute(&inv).expect("mul_");
        assert_eq!(out[0].id(), x.id());

        let view = context
            .execute(&OpInvocation::new(OpKind::T, vec![Operand::Tensor(x.clone())]))
            .expect("t");
        assert_eq!(view[0].storage_id(), x.storage_id());
        assert_ne!(view[0].id(), x.id());
    }

    #[test]
    fn dispatcher_routes_real_operands_to_host_kernels() {
        let mut dispatcher = Dispatcher::new(0);
        let x = RealTensor::from_values(vec![-1.0, 2.0], meta(vec![2])).expect("real");
        let inv = OpInvocation::new(OpKind::Relu, vec![Operand::Tensor(Tensor::Real(x))]);
        let outcome = dispatcher
            .dispatch(&inv, &DispatchEnv::real())
            .expect("relu");
        assert_eq!(outcome.decision.selected_key, DispatchKey::CPU);
        assert_eq!(outcome.decision.kernel, "cpu::host");
        let values = outcome.outputs[0]
            .as_real()
            .expect("real output")
            .values()
            .expect("values");
        assert_eq!(values, vec![0.0, 2.0]);
    }

    struct Recorder {
        seen: Rc<RefCell<Vec<(OpKind, Vec<String>)>>>,
        rng: StdRng,
    }

    impl OpInterceptor for Recorder {
        fn intercept(
            &mut self,
            inv: &OpInvocation,
            env: &DispatchEnv<'_>,
        ) -> Result<Vec<Tensor>, DispatchError> {
            self.seen
                .borrow_mut()
                .push((inv.kind, env.open_scopes.to_vec()));
            redispatch(inv, env, &mut self.rng)
        }
    }

    #[test]
    fn interceptor_observes_and_redispatches() {
        let context = SymbolicContext::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(0);
        dispatcher
            .install_interceptor(Box::new(Recorder {
                seen: Rc::clone(&seen),
                rng: StdRng::seed_from_u64(1),
            }))
            .expect("install");
        let err = dispatcher
            .install_interceptor(Box::new(Recorder {
                seen: Rc::clone(&seen),
                rng: StdRng::seed_from_u64(1),
            }))
            .expect_err("second install must fail");
        assert!(matches!(err, DispatchError::InterceptorInstalled));

        let scopes = vec!["Global".to_string(), "Global.fc".to_string()];
        let inv = OpInvocation::new(
            OpKind::Mm,
            vec![
                Operand::Tensor(placeholder(&context, vec![4, 8])),
                Operand::Tensor(placeholder(&context, vec![8, 2])),
            ],
        );
        let outcome = dispatcher
            .dispatch(&inv, &symbolic_env(&context, &scopes))
            .expect("intercepted mm");
        assert_eq!(outcome.decision.selected_key, DispatchKey::Interceptor);
        assert_eq!(outcome.outputs[0].meta().shape(), &[4, 2]);
        assert_eq!(seen.borrow().as_slice(), &[(OpKind::Mm, scopes.clone())]);

        assert!(dispatcher.uninstall_interceptor().is_some());
        let outcome = dispatcher
            .dispatch(&inv, &symbolic_env(&context, &scopes))
            .expect("symbolic mm");
        assert_eq!(outcome.decision.selected_key, DispatchKey::Symbolic);
        assert_eq!(seen.borrow().len(), 1);
    }

    proptest! {
        #[test]
        fn prop_priority_follows_table(bits in 0u64..32) {
            let keys = DispatchKey::all()
                .iter()
                .copied()
                .filter(|key| bits & key.bit() != 0)
                .collect::<Vec<_>>();
            let keyset = DispatchKeySet::from_keys(&keys);
            match keyset.highest_priority_type_id() {
                Ok(key) => {
                    let first = TYPE_PRIORITY.iter().copied().find(|key| keyset.has(*key));
                    prop_assert_eq!(Some(key), first);
                }
                Err(err) => prop_assert_eq!(err, DispatchKeyError::EmptySet),
            }
        }
    }
}
