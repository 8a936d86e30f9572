#![forbid(unsafe_code)]

use std::cell::RefCell;

use ft_api::{FrankenTorchSession, SessionError};
use ft_core::{DType, Tensor};
use ft_dispatch::{DispatchError, DispatchKeyError};

/// Trait for neural network modules.
///
/// `forward` and `backward` run inside a scope named after the module, so
/// every operation they issue is attributed to it.
pub trait Module {
    /// Scope name of this module, unique among its siblings.
    fn name(&self) -> &str;

    fn forward_inner(
        &self,
        session: &mut FrankenTorchSession,
        input: &Tensor,
    ) -> Result<Tensor, SessionError>;

    /// Gradient w.r.t. the input of the most recent forward call.
    fn backward_inner(
        &self,
        session: &mut FrankenTorchSession,
        grad_output: &Tensor,
    ) -> Result<Tensor, SessionError>;

    fn parameters(&self) -> Vec<Tensor>;

    fn forward(
        &self,
        session: &mut FrankenTorchSession,
        input: &Tensor,
    ) -> Result<Tensor, SessionError> {
        session.forward_scope(self.name(), |s| self.forward_inner(s, input))
    }

    fn backward(
        &self,
        session: &mut FrankenTorchSession,
        grad_output: &Tensor,
    ) -> Result<Tensor, SessionError> {
        session.backward_scope(self.name(), |s| self.backward_inner(s, grad_output))
    }
}

fn module_error(reason: &'static str) -> SessionError {
    SessionError::Dispatch(DispatchError::Key(DispatchKeyError::IncompatibleSet {
        reason,
    }))
}

/// Fully connected layer: `output = input @ weight^T + bias`.
pub struct Linear {
    name: String,
    weight: Tensor,
    bias: Option<Tensor>,
    saved_input: RefCell<Option<Tensor>>,
}

impl Linear {
    /// Weight has shape `[out_features, in_features]`, initialized from
    /// `U(-bound, bound)` with `bound = 1 / sqrt(in_features)`.
    pub fn new(
        session: &mut FrankenTorchSession,
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        dtype: DType,
    ) -> Result<Self, SessionError> {
        if in_features == 0 {
            return Err(module_error("linear layer requires in_features > 0"));
        }
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = uniform(session, vec![out_features, in_features], bound, dtype)?;
        let bias = if use_bias {
            Some(uniform(session, vec![out_features], bound, dtype)?)
        } else {
            None
        };
        Ok(Self {
            name: name.into(),
            weight,
            bias,
            saved_input: RefCell::new(None),
        })
    }

    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

fn uniform(
    session: &mut FrankenTorchSession,
    shape: Vec<usize>,
    bound: f64,
    dtype: DType,
) -> Result<Tensor, SessionError> {
    let unit = session.rand(shape, dtype)?;
    let scaled = session.mul_scalar(&unit, 2.0 * bound)?;
    session.sub_scalar(&scaled, bound)
}

impl Module for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_inner(
        &self,
        session: &mut FrankenTorchSession,
        input: &Tensor,
    ) -> Result<Tensor, SessionError> {
        self.saved_input.replace(Some(input.clone()));
        let weight_t = session.t(&self.weight)?;
        match &self.bias {
            Some(bias) => session.addmm(bias, input, &weight_t),
            None => session.mm(input, &weight_t),
        }
    }

    fn backward_inner(
        &self,
        session: &mut FrankenTorchSession,
        grad_output: &Tensor,
    ) -> Result<Tensor, SessionError> {
        let input = self
            .saved_input
            .borrow()
            .clone()
            .ok_or_else(|| module_error("linear backward before forward"))?;
        // [batch, out] @ [out, in] -> [batch, in]
        let grad_input = session.mm(grad_output, &self.weight)?;
        let grad_t = session.t(grad_output)?;
        let _grad_weight = session.mm(&grad_t, &input)?;
        if self.bias.is_some() {
            let _grad_bias = session.sum(grad_output, &[0])?;
        }
        Ok(grad_input)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }
}

/// ReLU activation module.
pub struct ReLU {
    name: String,
    saved_input: RefCell<Option<Tensor>>,
}

impl ReLU {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            saved_input: RefCell::new(None),
        }
    }
}

impl Module for ReLU {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_inner(
        &self,
        session: &mut FrankenTorchSession,
        input: &Tensor,
    ) -> Result<Tensor, SessionError> {
        self.saved_input.replace(Some(input.clone()));
        session.relu(input)
    }

    fn backward_inner(
        &self,
        session: &mut FrankenTorchSession,
        grad_output: &Tensor,
    ) -> Result<Tensor, SessionError> {
        let input = self
            .saved_input
            .borrow()
            .clone()
            .ok_or_else(|| module_error("relu backward before forward"))?;
        session.threshold_backward(grad_output, &input, 0.0)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Sequential container: chains modules in order and backpropagates in reverse.
pub struct Sequential {
    name: String,
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
        }
    }

    /// Add a module to the end of the chain.
    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_inner(
        &self,
        session: &mut FrankenTorchSession,
        input: &Tensor,
    ) -> Result<Tensor, SessionError> {
        let mut current = input.clone();
        for module in &self.modules {
            current = module.forward(session, &current)?;
        }
        Ok(current)
    }

    fn backward_inner(
        &self,
        session: &mut FrankenTorchSession,
        grad_output: &Tensor,
    ) -> Result<Tensor, SessionError> {
        let mut grad = grad_output.clone();
        for module in self.modules.iter().rev() {
            grad = module.backward(session, &grad)?;
        }
        Ok(grad)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.modules.iter().flat_map(|m| m.parameters()).collect()
    }
}

/// Two-layer perceptron `fc1 -> relu -> fc2` wrapped in a [`Sequential`] named `name`.
pub fn mlp(
    session: &mut FrankenTorchSession,
    name: &str,
    dims: [usize; 3],
    dtype: DType,
) -> Result<Sequential, SessionError> {
    let [input, hidden, output] = dims;
    let mut model = Sequential::new(name);
    model.push(Box::new(Linear::new(
        session, "fc1", input, hidden, true, dtype,
    )?));
    model.push(Box::new(ReLU::new("relu")));
    model.push(Box::new(Linear::new(
        session, "fc2", hidden, output, true, dtype,
    )?));
    Ok(model)
}

#[cfg(test)]
mod tests {
    use ft_api::FrankenTorchSession;
    use ft_core::{DType, ExecutionMode};

    use super::{Linear, Module, ReLU, mlp};

    #[test]
    fn linear_forward_matches_manual_affine_map() {
        let mut session = FrankenTorchSession::with_seed(ExecutionMode::Real, 3);
        let layer = Linear::new(&mut session, "fc", 3, 2, true, DType::F64).expect("linear");
        let x = session.ones(vec![1, 3], DType::F64).expect("input");
        let y = layer.forward(&mut session, &x).expect("forward");

        let weight = layer.weight().as_real().expect("real").values().expect("w");
        let bias = layer
            .bias()
            .expect("bias")
            .as_real()
            .expect("real")
            .values()
            .expect("b");
        let got = y.as_real().expect("real").values().expect("y");
        for (row, value) in got.iter().enumerate() {
            let expected: f64 = weight[row * 3..row * 3 + 3].iter().sum::<f64>() + bias[row];
            assert!((value - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn parameters_lie_within_init_bound() {
        let mut session = FrankenTorchSession::with_seed(ExecutionMode::Real, 11);
        let layer = Linear::new(&mut session, "fc", 4, 8, true, DType::F32).expect("linear");
        let bound = 0.5;
        for param in layer.parameters() {
            let values = param.as_real().expect("real").values().expect("values");
            assert!(values.iter().all(|value| value.abs() <= bound));
        }
    }

    #[test]
    fn relu_backward_masks_negative_inputs() {
        let mut session = FrankenTorchSession::new(ExecutionMode::Real);
        let ones = session.ones(vec![4], DType::F32).expect("ones");
        let x = session.sub_scalar(&ones, 2.0).expect("negative");
        let relu = ReLU::new("act");
        relu.forward(&mut session, &x).expect("forward");
        let grad = relu.backward(&mut session, &ones).expect("backward");
        let values = grad.as_real().expect("real").values().expect("values");
        assert_eq!(values, vec![0.0; 4]);
    }

    #[test]
    fn mlp_scopes_follow_module_nesting() {
        let mut session = FrankenTorchSession::new(ExecutionMode::Symbolic);
        let model = mlp(&mut session, "model", [16, 32, 4], DType::F32).expect("mlp");
        let x = session.randn(vec![8, 16], DType::F32).expect("input");
        let y = model.forward(&mut session, &x).expect("forward");
        assert_eq!(y.meta().shape(), &[8, 4]);
        let grad = model.backward(&mut session, &y).expect("backward");
        assert_eq!(grad.meta().shape(), &[8, 16]);
        assert_eq!(session.tracker().parents().len(), 1);
    }

    #[test]
    fn backward_before_forward_fails() {
        let mut session = FrankenTorchSession::new(ExecutionMode::Symbolic);
        let layer = Linear::new(&mut session, "fc", 2, 2, false, DType::F32).expect("linear");
        let grad = session.zeros(vec![1, 2], DType::F32).expect("grad");
        assert!(layer.backward(&mut session, &grad).is_err());
    }
}
