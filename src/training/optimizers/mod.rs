//! Optimizer selection and gradient clipping
//!
//! Parameter updates are delegated to candle's SGD and AdamW; this module only
//! picks one from configuration and rescales gradients before the step.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizerConfig {
    /// Plain stochastic gradient descent
    Sgd {
        /// Learning rate
        learning_rate: f64,
    },
    /// Adam with decoupled weight decay
    Adamw {
        /// Learning rate
        learning_rate: f64,
        /// Weight decay coefficient
        #[serde(default = "default_weight_decay")]
        weight_decay: f64,
        /// First moment decay
        #[serde(default = "default_beta1")]
        beta1: f64,
        /// Second moment decay
        #[serde(default = "default_beta2")]
        beta2: f64,
        /// Numerical stability term
        #[serde(default = "default_eps")]
        eps: f64,
    },
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adamw {
            learning_rate: 1e-3,
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
        }
    }
}

impl OptimizerConfig {
    /// Configured learning rate
    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::Sgd { learning_rate } => *learning_rate,
            OptimizerConfig::Adamw { learning_rate, .. } => *learning_rate,
        }
    }

    /// Validate hyperparameters
    pub fn validate(&self) -> Result<()> {
        let lr = self.learning_rate();
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(Error::config("Learning rate must be a positive finite number"));
        }
        if let OptimizerConfig::Adamw { beta1, beta2, weight_decay, .. } = self {
            if !(0.0..1.0).contains(beta1) || !(0.0..1.0).contains(beta2) {
                return Err(Error::config("Adam betas must be in [0, 1)"));
            }
            if *weight_decay < 0.0 {
                return Err(Error::config("Weight decay must be >= 0"));
            }
        }
        Ok(())
    }
}

/// A configured candle optimizer bound to a model's parameters
pub enum TrainingOptimizer {
    /// SGD
    Sgd(SGD),
    /// AdamW
    AdamW(AdamW),
}

impl TrainingOptimizer {
    /// Build the optimizer over every variable of `var_map`
    pub fn new(config: &OptimizerConfig, var_map: &VarMap) -> Result<Self> {
        config.validate()?;
        let vars = var_map.all_vars();
        debug!("Creating {:?} optimizer over {} variables", config, vars.len());

        let optimizer = match config {
            OptimizerConfig::Sgd { learning_rate } => Self::Sgd(SGD::new(vars, *learning_rate)?),
            OptimizerConfig::Adamw {
                learning_rate,
                weight_decay,
                beta1,
                beta2,
                eps,
            } => {
                let params = ParamsAdamW {
                    lr: *learning_rate,
                    beta1: *beta1,
                    beta2: *beta2,
                    eps: *eps,
                    weight_decay: *weight_decay,
                };
                Self::AdamW(AdamW::new(vars, params)?)
            }
        };
        Ok(optimizer)
    }

    /// Apply one update from `grads`
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            TrainingOptimizer::Sgd(opt) => opt.step(grads)?,
            TrainingOptimizer::AdamW(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainingOptimizer::Sgd(opt) => opt.learning_rate(),
            TrainingOptimizer::AdamW(opt) => opt.learning_rate(),
        }
    }
}

/// Rescale gradients so their global l2 norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    if max_norm <= 0.0 {
        return Err(Error::config("Gradient clipping threshold must be > 0"));
    }

    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = sum_sq.sqrt();

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = grad.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
        debug!("Clipped gradient norm {:.4} to {:.4}", total_norm, max_norm);
    }

    Ok(total_norm)
}
