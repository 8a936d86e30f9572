//! Learned compute-time predictors.
//!
//! One regression model per operation group, persisted as JSON under
//! `<root>/<group>/predictor.json`. Models predict milliseconds from a feature
//! vector of operand dimensions, GFLOPs and one-hot encodings.
//!
//! Convolution, convolution backward and attention backward have no feature
//! layout yet and report [`EstimateError::IncompleteFeatures`].

use std::fmt;
use std::path::{Path, PathBuf};

use ft_core::{DType, OpInvocation, OpKind, Operand};
use serde::{Deserialize, Serialize};

use crate::error::EstimateError;
use crate::flops::{attention_dims, batched_matmul_dims, matmul_dims};

pub const PREDICTOR_FILE: &str = "predictor.json";

/// Dtypes the predictors were trained on, in one-hot order.
pub const SUPPORTED_DTYPES: [DType; 3] = [DType::F16, DType::F32, DType::BF16];

#[derive(Debug, Clone, PartialEq)]
pub enum PredictorError {
    Io { path: PathBuf, reason: String },
    Parse { path: PathBuf, reason: String },
    FeatureCount { expected: usize, actual: usize },
    EmptyForest,
}

impl fmt::Display for PredictorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, reason } => {
                write!(f, "cannot read predictor {}: {reason}", path.display())
            }
            Self::Parse { path, reason } => {
                write!(f, "malformed predictor {}: {reason}", path.display())
            }
            Self::FeatureCount { expected, actual } => {
                write!(f, "predictor expects {expected} features, got {actual}")
            }
            Self::EmptyForest => write!(f, "forest predictor has no trees"),
        }
    }
}

impl std::error::Error for PredictorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PredictorGroup {
    Mm,
    Bmm,
    Sdpa,
    SdpaBackward,
    Conv,
    ConvBackward,
}

impl PredictorGroup {
    #[must_use]
    pub fn for_op(op: OpKind) -> Option<Self> {
        match op {
            OpKind::Mm | OpKind::Addmm => Some(Self::Mm),
            OpKind::Bmm | OpKind::Baddbmm => Some(Self::Bmm),
            OpKind::SdpaEfficient | OpKind::SdpaFlash => Some(Self::Sdpa),
            OpKind::SdpaEfficientBackward | OpKind::SdpaFlashBackward => Some(Self::SdpaBackward),
            OpKind::Convolution => Some(Self::Conv),
            OpKind::ConvolutionBackward => Some(Self::ConvBackward),
            _ => None,
        }
    }

    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Mm => "mm",
            Self::Bmm => "bmm",
            Self::Sdpa => "sdpa",
            Self::SdpaBackward => "sdpa_backward",
            Self::Conv => "conv",
            Self::ConvBackward => "conv_backward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    /// `features[feature] <= threshold` goes left.
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn predict(&self, features: &[f64]) -> Result<f64, PredictorError> {
        let mut node = self;
        loop {
            match node {
                Self::Leaf { value } => return Ok(*value),
                Self::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = features.get(*feature).ok_or(PredictorError::FeatureCount {
                        expected: feature + 1,
                        actual: features.len(),
                    })?;
                    node = if *value <= *threshold {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predictor {
    Linear { weights: Vec<f64>, intercept: f64 },
    /// Mean of the trees' predictions.
    Forest { trees: Vec<TreeNode> },
}

impl Predictor {
    /// Predicted milliseconds for `features`.
    pub fn predict(&self, features: &[f64]) -> Result<f64, PredictorError> {
        match self {
            Self::Linear { weights, intercept } => {
                if weights.len() != features.len() {
                    return Err(PredictorError::FeatureCount {
                        expected: weights.len(),
                        actual: features.len(),
                    });
                }
                Ok(weights
                    .iter()
                    .zip(features)
                    .map(|(weight, feature)| weight * feature)
                    .sum::<f64>()
                    + intercept)
            }
            Self::Forest { trees } => {
                if trees.is_empty() {
                    return Err(PredictorError::EmptyForest);
                }
                let mut total = 0.0;
                for tree in trees {
                    total += tree.predict(features)?;
                }
                Ok(total / trees.len() as f64)
            }
        }
    }
}

/// Directory of persisted predictors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictorStore {
    root: PathBuf,
}

impl PredictorStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, group: PredictorGroup) -> PathBuf {
        self.root.join(group.dir_name()).join(PREDICTOR_FILE)
    }

    pub fn load(&self, group: PredictorGroup) -> Result<Predictor, PredictorError> {
        let path = self.path_for(group);
        let payload = std::fs::read_to_string(&path).map_err(|error| PredictorError::Io {
            path: path.clone(),
            reason: error.to_string(),
        })?;
        serde_json::from_str(&payload).map_err(|error| PredictorError::Parse {
            path,
            reason: error.to_string(),
        })
    }

    pub fn save(&self, group: PredictorGroup, predictor: &Predictor) -> Result<(), PredictorError> {
        let path = self.path_for(group);
        let io_error = |error: std::io::Error| PredictorError::Io {
            path: path.clone(),
            reason: error.to_string(),
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_error)?;
        }
        let payload =
            serde_json::to_string_pretty(predictor).map_err(|error| PredictorError::Parse {
                path: path.clone(),
                reason: error.to_string(),
            })?;
        std::fs::write(&path, payload).map_err(io_error)
    }
}

/// One-hot encoding of `dtype` over [`SUPPORTED_DTYPES`].
#[must_use]
pub fn dtype_one_hot(dtype: DType) -> [f64; 3] {
    SUPPORTED_DTYPES.map(|supported| if supported == dtype { 1.0 } else { 0.0 })
}

fn dims(values: &[usize]) -> impl Iterator<Item = f64> + '_ {
    values.iter().map(|&value| value as f64)
}

/// Feature vector of `inv` for its group's predictor.
pub fn features(inv: &OpInvocation, dtype: DType, gflops: f64) -> Result<Vec<f64>, EstimateError> {
    let mut out = Vec::new();
    match inv.kind {
        OpKind::Mm | OpKind::Addmm => {
            let first = usize::from(inv.kind == OpKind::Addmm);
            let (m, n, p) = matmul_dims(inv, first)?;
            out.extend(dims(&[m, n, p]));
        }
        OpKind::Bmm | OpKind::Baddbmm => {
            let first = usize::from(inv.kind == OpKind::Baddbmm);
            let (b, m, n, p) = batched_matmul_dims(inv, first)?;
            out.extend(dims(&[b, m, n, p]));
        }
        OpKind::SdpaEfficient | OpKind::SdpaFlash => {
            out.extend(dims(&attention_dims(inv, 0)?));
            out.push(gflops);
            out.extend(dtype_one_hot(dtype));
            let backend = if inv.kind == OpKind::SdpaFlash {
                [0.0, 1.0]
            } else {
                [1.0, 0.0]
            };
            out.extend(backend);
            let causal = matches!(inv.kwarg("is_causal"), Some(Operand::Bool(true)));
            out.extend(if causal { [1.0, 0.0] } else { [0.0, 1.0] });
            return Ok(out);
        }
        op => return Err(EstimateError::IncompleteFeatures { op }),
    }
    out.push(gflops);
    out.extend(dtype_one_hot(dtype));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, Device, OpInvocation, OpKind, Operand, SymbolicTensor, Tensor, TensorMeta};

    use super::{
        Predictor, PredictorError, PredictorGroup, PredictorStore, TreeNode, dtype_one_hot,
        features,
    };
    use crate::error::EstimateError;

    fn placeholder(shape: &[usize]) -> Operand {
        let meta = TensorMeta::from_shape(shape.to_vec(), DType::F16, Device::Cpu);
        Operand::Tensor(Tensor::Symbolic(
            SymbolicTensor::new(meta, 0).expect("placeholder"),
        ))
    }

    #[test]
    fn dtype_one_hot_order_is_f16_f32_bf16() {
        assert_eq!(dtype_one_hot(DType::F16), [1.0, 0.0, 0.0]);
        assert_eq!(dtype_one_hot(DType::F32), [0.0, 1.0, 0.0]);
        assert_eq!(dtype_one_hot(DType::BF16), [0.0, 0.0, 1.0]);
        assert_eq!(dtype_one_hot(DType::F64), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn matmul_features_skip_the_bias_operand() {
        let inv = OpInvocation::new(
            OpKind::Addmm,
            vec![placeholder(&[32]), placeholder(&[8, 4]), placeholder(&[4, 32])],
        );
        let got = features(&inv, DType::BF16, 0.5).expect("features");
        assert_eq!(got, vec![8.0, 4.0, 32.0, 0.5, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn attention_features_encode_backend_and_causality() {
        let q = placeholder(&[2, 4, 16, 8]);
        let kv = placeholder(&[2, 4, 32, 8]);
        let inv = OpInvocation::new(OpKind::SdpaFlash, vec![q, kv.clone(), kv])
            .with_kwarg("is_causal", Operand::Bool(true));
        let got = features(&inv, DType::F16, 1.0).expect("features");
        assert_eq!(
            got,
            vec![2.0, 4.0, 16.0, 32.0, 8.0, 8.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0]
        );
    }

    #[test]
    fn convolution_features_are_incomplete() {
        let inv = OpInvocation::new(OpKind::Convolution, vec![]);
        assert!(matches!(
            features(&inv, DType::F16, 1.0),
            Err(EstimateError::IncompleteFeatures {
                op: OpKind::Convolution
            })
        ));
    }

    #[test]
    fn forest_averages_its_trees() {
        let stump = |threshold: f64, low: f64, high: f64| TreeNode::Split {
            feature: 0,
            threshold,
            left: Box::new(TreeNode::Leaf { value: low }),
            right: Box::new(TreeNode::Leaf { value: high }),
        };
        let forest = Predictor::Forest {
            trees: vec![stump(10.0, 1.0, 3.0), stump(20.0, 2.0, 4.0)],
        };
        assert_eq!(forest.predict(&[15.0]).expect("predict"), 2.5);
        assert_eq!(
            forest.predict(&[]),
            Err(PredictorError::FeatureCount {
                expected: 1,
                actual: 0
            })
        );
        assert_eq!(
            Predictor::Forest { trees: vec![] }.predict(&[1.0]),
            Err(PredictorError::EmptyForest)
        );
    }

    #[test]
    fn linear_predictor_checks_feature_count() {
        let linear = Predictor::Linear {
            weights: vec![1.0, 2.0],
            intercept: 0.5,
        };
        assert_eq!(linear.predict(&[3.0, 4.0]).expect("predict"), 11.5);
        assert!(linear.predict(&[1.0]).is_err());
    }

    #[test]
    fn store_reads_from_conventional_path() {
        let root = std::env::temp_dir().join(format!("ft-estimate-store-{}", std::process::id()));
        let store = PredictorStore::new(&root);
        let linear = Predictor::Linear {
            weights: vec![0.25],
            intercept: 1.0,
        };
        store.save(PredictorGroup::Bmm, &linear).expect("save");
        assert!(root.join("bmm").join("predictor.json").is_file());
        assert_eq!(store.load(PredictorGroup::Bmm).expect("load"), linear);
        assert!(matches!(
            store.load(PredictorGroup::Mm),
            Err(PredictorError::Io { .. })
        ));
        std::fs::remove_dir_all(&root).expect("cleanup");
    }
}
