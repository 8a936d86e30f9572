#![forbid(unsafe_code)]

//! Per-operation runtime estimation under symbolic execution.
//!
//! A [`RuntimeEstimator`] intercepts every operation a session dispatches,
//! estimates its device time with one of three strategies and attributes it
//! to the scopes open at that moment.

pub mod config;
pub mod error;
pub mod estimator;
pub mod flops;
pub mod learned;
pub mod realize;
pub mod registry;
pub mod report;
pub mod roofline;
pub mod strategy;
pub mod transfer;

pub use config::{EstimateMode, EstimatorConfig, NO_CACHING_ENV};
pub use error::{EstimateError, estimate_failure};
pub use estimator::{ActiveEstimation, EstimationSummary, RuntimeEstimator};
pub use flops::{FlopFormula, FlopRegistry};
pub use learned::{Predictor, PredictorError, PredictorGroup, PredictorStore, TreeNode};
pub use realize::{BenchmarkProtocol, FallbackReason, Realization, run_and_benchmark};
pub use report::{EstimateReport, OrderLogs, ScopeRecord, ScopeRuntimes, Transition};
pub use roofline::RooflineEstimate;
pub use strategy::{
    BenchmarkStrategy, Estimate, EstimationStrategy, LearnedStrategy, RooflineStrategy,
    strategy_for,
};
