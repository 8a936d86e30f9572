//! Runtime estimator orchestration.
//!
//! Activation installs an interceptor on the session's dispatcher and four
//! order hooks on its scope tracker. Every intercepted operation is estimated
//! by the configured strategy and its time is added to every scope open at
//! that moment, so parent scopes hold supersets of their children's time.
//! Deactivation always removes both, even when an operation failed.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use ft_api::FrankenTorchSession;
use ft_core::{OpInvocation, OpKind, Phase, Tensor};
use ft_device::{DeviceCapabilities, UnavailableDevice};
use ft_dispatch::{DispatchEnv, DispatchError, OpInterceptor};
use ft_runtime::{EvidenceKind, ScopeHook, ScopeHooks};
use serde::Serialize;

use crate::config::{EstimateMode, EstimatorConfig};
use crate::error::EstimateError;
use crate::flops::FlopRegistry;
use crate::realize::FallbackReason;
use crate::registry;
use crate::report::{EstimateReport, OrderLogs, ScopeRuntimes, Transition};
use crate::strategy::{EstimationStrategy, strategy_for};

/// Accumulators of the current activation.
#[derive(Debug, Default)]
struct LiveState {
    total_ms: f64,
    intercepted: usize,
    runtimes: ScopeRuntimes,
    order: OrderLogs,
    fallbacks: Vec<(OpKind, FallbackReason)>,
}

impl LiveState {
    fn attribute(&mut self, open_scopes: &[String], phase: Phase, elapsed_ms: f64) {
        for scope in open_scopes {
            self.runtimes.add(scope, phase, elapsed_ms);
        }
        self.total_ms += elapsed_ms;
        self.intercepted += 1;
    }
}

type SharedState = Rc<RefCell<LiveState>>;

struct EstimatorInterceptor {
    strategy: Box<dyn EstimationStrategy>,
    state: SharedState,
}

impl OpInterceptor for EstimatorInterceptor {
    fn intercept(
        &mut self,
        inv: &OpInvocation,
        env: &DispatchEnv<'_>,
    ) -> Result<Vec<Tensor>, DispatchError> {
        let estimate =
            self.strategy
                .estimate(inv, env)
                .map_err(|error| DispatchError::Interceptor {
                    op: inv.kind,
                    source: Box::new(error),
                })?;
        let mut state = self.state.borrow_mut();
        state.attribute(env.open_scopes, env.phase, estimate.elapsed_ms);
        if let Some(reason) = estimate.fallback {
            state.fallbacks.push((inv.kind, reason));
        }
        Ok(estimate.outputs)
    }
}

fn order_hook(state: &SharedState, transition: Transition) -> ScopeHook {
    let state = Rc::clone(state);
    Box::new(move |scope: &str| state.borrow_mut().order.record(transition, scope))
}

fn order_hooks(state: &SharedState) -> ScopeHooks {
    ScopeHooks {
        pre_forward: order_hook(state, Transition::PreForward),
        pre_backward: order_hook(state, Transition::PreBackward),
        post_forward: order_hook(state, Transition::PostForward),
        post_backward: order_hook(state, Transition::PostBackward),
    }
}

/// Outcome of one activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationSummary {
    pub mode: EstimateMode,
    pub total_ms: f64,
    pub intercepted_ops: usize,
    pub unsupported: Vec<String>,
}

impl fmt::Display for EstimationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Estimated ({}) total_time: {:.3} ms", self.mode, self.total_ms)?;
        if !self.unsupported.is_empty() {
            write!(f, "\nno_fallback_kernel: {:?}", self.unsupported)?;
        }
        Ok(())
    }
}

/// Estimates per-operation runtime of everything dispatched while active.
#[derive(Debug)]
pub struct RuntimeEstimator {
    config: EstimatorConfig,
    flops: FlopRegistry,
    state: SharedState,
    report: Option<EstimateReport>,
    summary: Option<EstimationSummary>,
}

impl RuntimeEstimator {
    pub fn new(config: EstimatorConfig) -> Result<Self, EstimateError> {
        config.validate()?;
        Ok(Self {
            config,
            flops: FlopRegistry::with_defaults(),
            state: SharedState::default(),
            report: None,
            summary: None,
        })
    }

    /// Estimator with default settings for the mode named `name`.
    pub fn from_mode_name(name: &str) -> Result<Self, EstimateError> {
        Self::new(EstimatorConfig::new(name.parse()?))
    }

    /// Replace the analytical flop formulas.
    #[must_use]
    pub fn with_flop_registry(mut self, flops: FlopRegistry) -> Self {
        self.flops = flops;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    #[must_use]
    pub fn mode(&self) -> EstimateMode {
        self.config.mode
    }

    /// Results of the most recent activation.
    #[must_use]
    pub fn report(&self) -> Option<&EstimateReport> {
        self.report.as_ref()
    }

    #[must_use]
    pub fn last_summary(&self) -> Option<&EstimationSummary> {
        self.summary.as_ref()
    }

    /// Start estimating every operation `session` dispatches. The session
    /// must be in symbolic mode. Estimation stops when the returned guard is
    /// finished or dropped.
    pub fn activate<'a>(
        &'a mut self,
        session: &'a mut FrankenTorchSession,
    ) -> Result<ActiveEstimation<'a>, EstimateError> {
        if session.symbolic_context().is_none() {
            return Err(EstimateError::NoSymbolicContext);
        }
        let capabilities: Rc<dyn DeviceCapabilities> = match &self.config.device {
            Some(profile) => Rc::new(profile.clone()),
            None => Rc::new(UnavailableDevice),
        };
        registry::acquire(capabilities)?;
        if let Err(error) = self.install(session) {
            registry::release();
            return Err(error);
        }
        let device = self
            .config
            .device
            .as_ref()
            .map_or("unavailable", |profile| profile.name.as_str());
        session.ledger_mut().record(
            EvidenceKind::Estimate,
            format!("estimator activated mode={} device={device}", self.config.mode),
        );
        Ok(ActiveEstimation {
            estimator: self,
            session,
            finished: false,
        })
    }

    fn install(&mut self, session: &mut FrankenTorchSession) -> Result<(), EstimateError> {
        *self.state.borrow_mut() = LiveState::default();
        session
            .tracker_mut()
            .register_hooks(order_hooks(&self.state))
            .map_err(|error| EstimateError::Session(error.into()))?;
        let interceptor = EstimatorInterceptor {
            strategy: strategy_for(&self.config, self.flops.clone()),
            state: Rc::clone(&self.state),
        };
        if let Err(error) = session
            .dispatcher_mut()
            .install_interceptor(Box::new(interceptor))
        {
            session.tracker_mut().clear_hooks();
            return Err(error.into());
        }
        Ok(())
    }

    fn deactivate(&mut self, session: &mut FrankenTorchSession) -> EstimationSummary {
        session.dispatcher_mut().uninstall_interceptor();
        session.tracker_mut().clear_hooks();
        registry::release();

        let live = self.state.take();
        let unsupported = registry::unsupported_fallbacks()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let ledger = session.ledger_mut();
        for (op, reason) in &live.fallbacks {
            ledger.record(
                EvidenceKind::Fallback,
                format!("op={op} reason={} estimated=0ms", reason.label()),
            );
        }
        let summary = EstimationSummary {
            mode: self.config.mode,
            total_ms: live.total_ms,
            intercepted_ops: live.intercepted,
            unsupported: unsupported.clone(),
        };
        ledger.record(
            EvidenceKind::Estimate,
            format!(
                "estimator deactivated mode={} total_ms={:.3} intercepted={} unsupported={:?}",
                summary.mode, summary.total_ms, summary.intercepted_ops, summary.unsupported
            ),
        );
        self.report = Some(EstimateReport {
            mode: self.config.mode,
            total_ms: live.total_ms,
            order: live.order,
            scopes: live.runtimes.into_records(),
            unsupported,
        });
        self.summary = Some(summary.clone());
        summary
    }

    /// Run `body` with estimation active and return its value together with
    /// the summary. Estimation is torn down whether `body` succeeds or not.
    pub fn run<T>(
        &mut self,
        session: &mut FrankenTorchSession,
        body: impl FnOnce(&mut FrankenTorchSession) -> Result<T, EstimateError>,
    ) -> Result<(T, EstimationSummary), EstimateError> {
        let mut active = self.activate(session)?;
        let result = body(&mut *active);
        let summary = active.finish();
        Ok((result?, summary))
    }
}

/// Guard over an active estimation. Derefs to the session being estimated.
#[derive(Debug)]
pub struct ActiveEstimation<'a> {
    estimator: &'a mut RuntimeEstimator,
    session: &'a mut FrankenTorchSession,
    finished: bool,
}

impl ActiveEstimation<'_> {
    /// Runtime accumulated so far.
    #[must_use]
    pub fn total_ms(&self) -> f64 {
        self.estimator.state.borrow().total_ms
    }

    #[must_use]
    pub fn intercepted_ops(&self) -> usize {
        self.estimator.state.borrow().intercepted
    }

    pub fn finish(mut self) -> EstimationSummary {
        self.finished = true;
        self.estimator.deactivate(&mut *self.session)
    }
}

impl Deref for ActiveEstimation<'_> {
    type Target = FrankenTorchSession;

    fn deref(&self) -> &Self::Target {
        &*self.session
    }
}

impl DerefMut for ActiveEstimation<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.session
    }
}

impl Drop for ActiveEstimation<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.estimator.deactivate(&mut *self.session);
        }
    }
}
