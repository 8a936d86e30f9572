use std::fmt;

use ft_api::SessionError;
use ft_core::{DType, OpKind, TensorMetaError};
use ft_device::DeviceError;
use ft_dispatch::DispatchError;

use crate::learned::PredictorError;

#[derive(Debug)]
pub enum EstimateError {
    UnsupportedMode { name: String },
    InvalidConfig { reason: String },
    NoSymbolicContext,
    AlreadyActive,
    AmbiguousPrecision { op: OpKind, dtypes: Vec<DType> },
    InplaceView { op: OpKind },
    IncompleteFeatures { op: OpKind },
    InvalidOperands { op: OpKind, reason: String },
    DuplicateFormula { op: OpKind },
    Dispatch(DispatchError),
    Device(DeviceError),
    Meta(TensorMetaError),
    Predictor(PredictorError),
    Session(SessionError),
}

impl fmt::Display for EstimateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMode { name } => {
                write!(f, "estimate mode '{name}' not supported")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid estimator config: {reason}"),
            Self::NoSymbolicContext => write!(
                f,
                "no symbolic context found; runtime estimation runs under symbolic execution"
            ),
            Self::AlreadyActive => write!(f, "another runtime estimator is already active"),
            Self::AmbiguousPrecision { op, dtypes } => {
                let names = dtypes.iter().map(|dtype| dtype.name()).collect::<Vec<_>>();
                write!(f, "{op}: only a single output dtype is supported, got {names:?}")
            }
            Self::InplaceView { op } => {
                write!(f, "{op}: rewrites operand metadata in place and cannot be realized")
            }
            Self::IncompleteFeatures { op } => {
                write!(f, "{op}: learned model has no feature vector for this operation yet")
            }
            Self::InvalidOperands { op, reason } => write!(f, "{op}: {reason}"),
            Self::DuplicateFormula { op } => write!(f, "duplicate flop formula for {op}"),
            Self::Dispatch(error) => write!(f, "{error}"),
            Self::Device(error) => write!(f, "{error}"),
            Self::Meta(error) => write!(f, "{error}"),
            Self::Predictor(error) => write!(f, "{error}"),
            Self::Session(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for EstimateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(error) => Some(error),
            Self::Device(error) => Some(error),
            Self::Meta(error) => Some(error),
            Self::Predictor(error) => Some(error),
            Self::Session(error) => Some(error),
            _ => None,
        }
    }
}

impl From<DispatchError> for EstimateError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<DeviceError> for EstimateError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<TensorMetaError> for EstimateError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

impl From<PredictorError> for EstimateError {
    fn from(value: PredictorError) -> Self {
        Self::Predictor(value)
    }
}

impl From<SessionError> for EstimateError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

/// The estimator failure carried by a session error, if the operation was
/// rejected by an active estimator.
#[must_use]
pub fn estimate_failure(error: &SessionError) -> Option<&EstimateError> {
    match error {
        SessionError::Dispatch(DispatchError::Interceptor { source, .. }) => {
            source.downcast_ref::<EstimateError>()
        }
        _ => None,
    }
}
