//! Adam optimizer over named candle `Var`s
//! Keeps full-precision first and second moments keyed by parameter name so
//! the state can be checkpointed and restored alongside the weights.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,

    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,

    step: usize,
}

impl Adam {
    pub fn with_params(learning_rate: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn betas(&self) -> (f64, f64) {
        (self.beta1, self.beta2)
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    /// Apply one update to every parameter that received a gradient.
    /// Parameters absent from `grads` (e.g. normalization running statistics)
    /// are left untouched.
    pub fn step(&mut self, params: &[(String, Var)], grads: &GradStore) -> Result<()> {
        self.step += 1;
        for (name, param) in params {
            if let Some(grad) = grads.get(param.as_tensor()) {
                self.update(name, param, grad)?;
            }
        }
        Ok(())
    }

    fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let grad = grad.to_dtype(DType::F32)?;

        let m = match self.m.get(name) {
            Some(m) => m.clone(),
            None => grad.zeros_like()?,
        };
        let v = match self.v.get(name) {
            Some(v) => v.clone(),
            None => grad.zeros_like()?,
        };

        // Biased first and second moment estimates
        let m_new = ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
        let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

        // Bias correction
        let t = self.step.max(1) as i32;
        let m_hat = (&m_new / (1.0 - self.beta1.powi(t)))?;
        let v_hat = (&v_new / (1.0 - self.beta2.powi(t)))?;

        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
        let update = update.to_dtype(param.dtype())?;
        let new_value = (param.as_tensor() - (update * self.learning_rate)?)?;
        param.set(&new_value)?;

        self.m.insert(name.to_string(), m_new);
        self.v.insert(name.to_string(), v_new);
        Ok(())
    }

    /// Moments as a flat `m.<name>` / `v.<name>` tensor map for saving
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        for (name, m) in &self.m {
            state.insert(format!("m.{}", name), m.clone());
        }
        for (name, v) in &self.v {
            state.insert(format!("v.{}", name), v.clone());
        }
        state
    }

    /// Restore moments saved by `state_tensors` and the step counter
    pub fn load_state_tensors(&mut self, state: HashMap<String, Tensor>, step: usize) {
        self.m.clear();
        self.v.clear();
        for (key, tensor) in state {
            if let Some(name) = key.strip_prefix("m.") {
                self.m.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix("v.") {
                self.v.insert(name.to_string(), tensor);
            }
        }
        self.step = step;
    }
}
