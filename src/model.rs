//! Classifier interface and a reference multi-head MLP
//!
//! The training drivers only need a forward pass returning logits and access
//! to the candle [`VarMap`] holding the trainable parameters. Multi-task
//! models select their output head from the task id.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// A model producing class logits `[batch, num_classes]`
pub trait Classifier {
    /// Forward pass; `task_id` selects the output head of multi-task models
    fn forward(&self, xs: &Tensor, task_id: Option<usize>) -> candle_core::Result<Tensor>;

    /// Trainable parameters
    fn var_map(&self) -> &VarMap;

    /// Model name used in file names and result rows
    fn name(&self) -> &str;

    /// Number of tasks (output heads) the model serves
    fn num_tasks(&self) -> usize {
        1
    }
}

/// Detached copy of every parameter of a model
#[derive(Debug, Clone)]
pub struct ModelState {
    tensors: HashMap<String, Tensor>,
}

impl ModelState {
    /// Copy the current parameter values out of `var_map`
    pub fn capture(var_map: &VarMap) -> Result<Self> {
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("Parameter map lock poisoned"))?;
        let tensors = vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { tensors })
    }

    /// Write the captured values back into `var_map`
    pub fn restore(&self, var_map: &VarMap) -> Result<()> {
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("Parameter map lock poisoned"))?;
        for (name, var) in vars.iter() {
            let value = self
                .tensors
                .get(name)
                .ok_or_else(|| Error::invalid_input(format!("Snapshot has no parameter '{name}'")))?;
            var.set(value)?;
        }
        debug!("Restored {} parameters from snapshot", vars.len());
        Ok(())
    }

    /// Persist the snapshot as safetensors
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        Ok(())
    }

    /// Read a snapshot written by [`ModelState::save`]
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Ok(Self { tensors })
    }

    /// Snapshotted tensor by parameter name
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Number of parameters tensors in the snapshot
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Shape of a [`MlpClassifier`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Width of the input features
    pub input_dim: usize,
    /// Width of the shared hidden layer
    pub hidden_dim: usize,
    /// Number of classes of each task head
    pub output_dims: Vec<usize>,
}

impl MlpConfig {
    /// Check the dimensions are usable
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.hidden_dim == 0 {
            return Err(Error::config("MLP input and hidden dims must be > 0"));
        }
        if self.output_dims.is_empty() {
            return Err(Error::config("MLP needs at least one output head"));
        }
        if self.output_dims.iter().any(|&d| d < 2) {
            return Err(Error::config("Every output head needs at least two classes"));
        }
        Ok(())
    }
}

/// Shared hidden layer with one linear head per task
pub struct MlpClassifier {
    config: MlpConfig,
    hidden: Linear,
    heads: Vec<Linear>,
    var_map: VarMap,
}

impl MlpClassifier {
    /// Initialise a fresh model on `device`
    pub fn new(config: MlpConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let hidden = candle_nn::linear(config.input_dim, config.hidden_dim, vb.pp("hidden"))?;
        let heads = config
            .output_dims
            .iter()
            .enumerate()
            .map(|(task, &classes)| {
                candle_nn::linear(config.hidden_dim, classes, vb.pp(format!("head_{task}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        debug!(
            "MLP initialised: {} -> {} -> {:?}",
            config.input_dim, config.hidden_dim, config.output_dims
        );

        Ok(Self {
            config,
            hidden,
            heads,
            var_map,
        })
    }

    /// Model shape
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }
}

impl Classifier for MlpClassifier {
    fn forward(&self, xs: &Tensor, task_id: Option<usize>) -> candle_core::Result<Tensor> {
        let task = task_id.unwrap_or(0);
        let head = self.heads.get(task).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "Task {task} out of range for a model with {} heads",
                self.heads.len()
            ))
        })?;
        let hidden = self.hidden.forward(xs)?.relu()?;
        head.forward(&hidden)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn name(&self) -> &str {
        "mlp"
    }

    fn num_tasks(&self) -> usize {
        self.heads.len()
    }
}
