#![forbid(unsafe_code)]

use std::fmt;

use ft_core::{DType, Device, ExecutionMode, OpInvocation, OpKind, Operand, Phase, Tensor};
use ft_dispatch::{DispatchEnv, DispatchError, Dispatcher, SymbolicContext};
use ft_runtime::{
    EvidenceEntry, EvidenceKind, EvidenceLedger, RuntimeContext, ScopeError, ScopeTracker,
};

#[derive(Debug)]
pub enum SessionError {
    Dispatch(DispatchError),
    Scope(ScopeError),
    NoOutput { op: OpKind },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch(error) => write!(f, "{error}"),
            Self::Scope(error) => write!(f, "scope failure: {error}"),
            Self::NoOutput { op } => write!(f, "{op} produced no output"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(error) => Some(error),
            Self::Scope(error) => Some(error),
            Self::NoOutput { .. } => None,
        }
    }
}

impl From<DispatchError> for SessionError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<ScopeError> for SessionError {
    fn from(value: ScopeError) -> Self {
        Self::Scope(value)
    }
}

/// User-facing façade. Every operation goes through [`FrankenTorchSession::dispatch`],
/// which is where an installed interceptor observes it.
#[derive(Debug)]
pub struct FrankenTorchSession {
    runtime: RuntimeContext,
    symbolic: Option<SymbolicContext>,
    tracker: ScopeTracker,
    dispatcher: Dispatcher,
}

impl FrankenTorchSession {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_seed(mode, 0)
    }

    /// `seed` drives random fills of real tensors.
    #[must_use]
    pub fn with_seed(mode: ExecutionMode, seed: u64) -> Self {
        Self {
            runtime: RuntimeContext::new(mode),
            symbolic: (mode == ExecutionMode::Symbolic).then(SymbolicContext::new),
            tracker: ScopeTracker::new(),
            dispatcher: Dispatcher::new(seed),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    /// Switching into symbolic mode opens a fresh symbolic context; leaving
    /// it drops the context and invalidates its placeholders.
    pub fn set_mode(&mut self, mode: ExecutionMode) {
        if mode == self.mode() {
            return;
        }
        self.symbolic = (mode == ExecutionMode::Symbolic).then(SymbolicContext::new);
        self.runtime.set_mode(mode);
    }

    pub fn enter_symbolic(&mut self) {
        self.set_mode(ExecutionMode::Symbolic);
    }

    pub fn exit_symbolic(&mut self) {
        self.set_mode(ExecutionMode::Real);
    }

    #[must_use]
    pub fn symbolic_context(&self) -> Option<&SymbolicContext> {
        self.symbolic.as_ref()
    }

    #[must_use]
    pub fn tracker(&self) -> &ScopeTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ScopeTracker {
        &mut self.tracker
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        self.runtime.ledger()
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        self.runtime.ledger_mut()
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    /// Route one invocation and return all of its outputs.
    pub fn dispatch(&mut self, inv: OpInvocation) -> Result<Vec<Tensor>, SessionError> {
        let env = DispatchEnv {
            symbolic: self.symbolic.as_ref(),
            open_scopes: self.tracker.parents(),
            phase: self.tracker.phase(),
        };
        let outcome = self.dispatcher.dispatch(&inv, &env)?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Dispatch,
            format!(
                "op={} kernel={} key={:?} keyset=0x{:016x} outputs={}",
                outcome.decision.op,
                outcome.decision.kernel,
                outcome.decision.selected_key,
                outcome.decision.keyset_bits,
                outcome.outputs.len()
            ),
        );
        Ok(outcome.outputs)
    }

    fn dispatch_one(&mut self, inv: OpInvocation) -> Result<Tensor, SessionError> {
        let op = inv.kind;
        self.dispatch(inv)?
            .into_iter()
            .next()
            .ok_or(SessionError::NoOutput { op })
    }

    /// Run `body` inside a forward scope named `name`. The scope is closed
    /// even when `body` fails.
    pub fn forward_scope<T, E>(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<SessionError>,
    {
        self.scoped(name, Phase::Forward, body)
    }

    /// Backward counterpart of [`FrankenTorchSession::forward_scope`].
    pub fn backward_scope<T, E>(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<SessionError>,
    {
        self.scoped(name, Phase::Backward, body)
    }

    fn scoped<T, E>(
        &mut self,
        name: &str,
        phase: Phase,
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<SessionError>,
    {
        self.tracker
            .enter(name, phase)
            .map_err(|error| E::from(SessionError::from(error)))?;
        let result = body(self);
        let exited = self.tracker.exit(phase);
        let value = result?;
        exited.map_err(|error| E::from(SessionError::from(error)))?;
        Ok(value)
    }

    pub fn zeros(&mut self, shape: Vec<usize>, dtype: DType) -> Result<Tensor, SessionError> {
        self.create(OpKind::Zeros, shape, dtype)
    }

    pub fn ones(&mut self, shape: Vec<usize>, dtype: DType) -> Result<Tensor, SessionError> {
        self.create(OpKind::Ones, shape, dtype)
    }

    /// Uniform samples in `[0, 1)`.
    pub fn rand(&mut self, shape: Vec<usize>, dtype: DType) -> Result<Tensor, SessionError> {
        self.create(OpKind::Rand, shape, dtype)
    }

    pub fn randn(&mut self, shape: Vec<usize>, dtype: DType) -> Result<Tensor, SessionError> {
        self.create(OpKind::Randn, shape, dtype)
    }

    fn create(
        &mut self,
        kind: OpKind,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<Tensor, SessionError> {
        let inv = OpInvocation::new(kind, vec![ints(&shape)])
            .with_kwarg("dtype", Operand::DType(dtype))
            .with_kwarg("device", Operand::Device(Device::Cpu));
        self.dispatch_one(inv)
    }

    pub fn mm(&mut self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Mm, vec![tensor(lhs), tensor(rhs)])
    }

    pub fn addmm(
        &mut self,
        bias: &Tensor,
        lhs: &Tensor,
        rhs: &Tensor,
    ) -> Result<Tensor, SessionError> {
        self.call(OpKind::Addmm, vec![tensor(bias), tensor(lhs), tensor(rhs)])
    }

    pub fn bmm(&mut self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Bmm, vec![tensor(lhs), tensor(rhs)])
    }

    pub fn add(&mut self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Add, vec![tensor(lhs), tensor(rhs)])
    }

    pub fn sub(&mut self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Sub, vec![tensor(lhs), tensor(rhs)])
    }

    pub fn mul(&mut self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Mul, vec![tensor(lhs), tensor(rhs)])
    }

    pub fn mul_scalar(&mut self, lhs: &Tensor, rhs: f64) -> Result<Tensor, SessionError> {
        self.call(OpKind::Mul, vec![tensor(lhs), Operand::Scalar(rhs)])
    }

    pub fn sub_scalar(&mut self, lhs: &Tensor, rhs: f64) -> Result<Tensor, SessionError> {
        self.call(OpKind::Sub, vec![tensor(lhs), Operand::Scalar(rhs)])
    }

    /// In-place `lhs += rhs`; returns the `lhs` handle.
    pub fn add_(&mut self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::AddInPlace, vec![tensor(lhs), tensor(rhs)])
    }

    pub fn relu(&mut self, input: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Relu, vec![tensor(input)])
    }

    pub fn threshold_backward(
        &mut self,
        grad: &Tensor,
        input: &Tensor,
        threshold: f64,
    ) -> Result<Tensor, SessionError> {
        self.call(
            OpKind::ThresholdBackward,
            vec![tensor(grad), tensor(input), Operand::Scalar(threshold)],
        )
    }

    pub fn sum(&mut self, input: &Tensor, dims: &[i64]) -> Result<Tensor, SessionError> {
        self.call(OpKind::Sum, vec![tensor(input), Operand::Ints(dims.to_vec())])
    }

    pub fn softmax(&mut self, input: &Tensor, dim: i64) -> Result<Tensor, SessionError> {
        self.call(OpKind::Softmax, vec![tensor(input), Operand::Int(dim)])
    }

    pub fn t(&mut self, input: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::T, vec![tensor(input)])
    }

    pub fn transpose(&mut self, input: &Tensor, d0: i64, d1: i64) -> Result<Tensor, SessionError> {
        self.call(
            OpKind::Transpose,
            vec![tensor(input), Operand::Int(d0), Operand::Int(d1)],
        )
    }

    pub fn reshape(&mut self, input: &Tensor, shape: &[i64]) -> Result<Tensor, SessionError> {
        self.call(
            OpKind::Reshape,
            vec![tensor(input), Operand::Ints(shape.to_vec())],
        )
    }

    pub fn clone_tensor(&mut self, input: &Tensor) -> Result<Tensor, SessionError> {
        self.call(OpKind::Clone, vec![tensor(input)])
    }

    /// Non-transposed convolution with symmetric parameters per spatial dim.
    pub fn conv(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: &[i64],
        padding: &[i64],
    ) -> Result<Tensor, SessionError> {
        let spatial = input.meta().rank().saturating_sub(2);
        self.call(
            OpKind::Convolution,
            vec![
                tensor(input),
                tensor(weight),
                bias.map_or(Operand::None, tensor),
                Operand::Ints(stride.to_vec()),
                Operand::Ints(padding.to_vec()),
                Operand::Ints(vec![1; spatial]),
                Operand::Bool(false),
                Operand::Ints(vec![0; spatial]),
                Operand::Int(1),
            ],
        )
    }

    /// Fused attention; returns `(output, logsumexp)`.
    pub fn scaled_dot_product_attention(
        &mut self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        flash: bool,
        is_causal: bool,
    ) -> Result<(Tensor, Tensor), SessionError> {
        let kind = if flash {
            OpKind::SdpaFlash
        } else {
            OpKind::SdpaEfficient
        };
        let inv = OpInvocation::new(kind, vec![tensor(query), tensor(key), tensor(value)])
            .with_kwarg("is_causal", Operand::Bool(is_causal));
        let mut outputs = self.dispatch(inv)?.into_iter();
        match (outputs.next(), outputs.next()) {
            (Some(out), Some(logsumexp)) => Ok((out, logsumexp)),
            _ => Err(SessionError::NoOutput { op: kind }),
        }
    }

    fn call(&mut self, kind: OpKind, args: Vec<Operand>) -> Result<Tensor, SessionError> {
        self.dispatch_one(OpInvocation::new(kind, args))
    }
}

fn tensor(value: &Tensor) -> Operand {
    Operand::Tensor(value.clone())
}

fn ints(values: &[usize]) -> Operand {
    Operand::Ints(values.iter().map(|&value| value as i64).collect())
}
