//! Training loop configuration
//!
//! [`TrainingConfig`] drives single-task training; [`MtlConfig`] wraps it with
//! the task sampling and loss weighting settings of multi-task training.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Settings shared by every training driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Maximum number of epochs
    pub epochs: usize,
    /// Examples per batch
    pub batch_size: usize,
    /// Clip gradients to this global l2 norm
    pub clip: Option<f64>,
    /// Epochs without dev improvement before stopping; 0 disables early stopping
    pub patience: usize,
    /// Lower early-stopping scores are better
    ///
    /// Every tracked metric is higher-is-better, so `validate` rejects `true`
    /// while early stopping is enabled.
    pub low_is_good: bool,
    /// Reshuffle the training data every epoch
    pub shuffle: bool,
    /// Where the best model is written during early stopping
    pub save_path: Option<PathBuf>,
    /// Seed for shuffling and task sampling
    pub seed: u64,
    /// Draw progress bars
    pub progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            clip: None,
            patience: 10,
            low_is_good: false,
            shuffle: true,
            save_path: None,
            seed: 42,
            progress: true,
        }
    }
}

impl TrainingConfig {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::config("Number of epochs must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be > 0"));
        }
        if let Some(clip) = self.clip {
            if !(clip > 0.0 && clip.is_finite()) {
                return Err(Error::config("Gradient clipping threshold must be a positive number"));
            }
        }
        if self.low_is_good && self.patience > 0 {
            return Err(Error::config(
                "low_is_good needs a lower-is-better early-stopping metric; every tracked metric is higher-is-better",
            ));
        }
        Ok(())
    }
}

/// Multi-task training settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtlConfig {
    /// Shared loop settings
    pub training: TrainingConfig,
    /// Task whose dev score drives early stopping
    pub dev_task_id: usize,
    /// Optimizer steps per epoch; defaults to the total batch count of all tasks
    pub batches_per_epoch: Option<usize>,
    /// Probability of sampling each task; defaults to the normalised loss weights
    pub dataset_weights: Option<Vec<f64>>,
    /// Relative importance of each task's loss; defaults to ones
    pub loss_weights: Option<Vec<f64>>,
}

impl Default for MtlConfig {
    fn default() -> Self {
        Self {
            training: TrainingConfig {
                epochs: 2,
                ..TrainingConfig::default()
            },
            dev_task_id: 0,
            batches_per_epoch: None,
            dataset_weights: None,
            loss_weights: None,
        }
    }
}

impl MtlConfig {
    /// Validate the settings against the number of tasks
    pub fn validate(&self, num_tasks: usize) -> Result<()> {
        self.training.validate()?;
        if num_tasks == 0 {
            return Err(Error::config("Multi-task training needs at least one task"));
        }
        if self.dev_task_id >= num_tasks {
            return Err(Error::config(format!(
                "dev_task_id {} out of range for {} tasks",
                self.dev_task_id, num_tasks
            )));
        }
        if self.batches_per_epoch == Some(0) {
            return Err(Error::config("batches_per_epoch must be > 0"));
        }
        self.resolve_weights(num_tasks).map(|_| ())
    }

    /// Loss weights and normalised sampling probabilities, one per task
    pub fn resolve_weights(&self, num_tasks: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        let loss_weights = match &self.loss_weights {
            Some(weights) => {
                check_weights("loss_weights", weights, num_tasks)?;
                weights.clone()
            }
            None => vec![1.0; num_tasks],
        };

        let raw = match &self.dataset_weights {
            Some(weights) => {
                check_weights("dataset_weights", weights, num_tasks)?;
                let total: f64 = weights.iter().sum();
                if (total - 1.0).abs() > 1e-6 {
                    warn!("dataset_weights sum to {:.4}, normalising", total);
                }
                weights.clone()
            }
            None => loss_weights.clone(),
        };

        let total: f64 = raw.iter().sum();
        let dataset_weights = raw.iter().map(|w| w / total).collect();
        Ok((loss_weights, dataset_weights))
    }
}

fn check_weights(name: &str, weights: &[f64], num_tasks: usize) -> Result<()> {
    if weights.len() != num_tasks {
        return Err(Error::config(format!(
            "{name} has {} entries but there are {} tasks",
            weights.len(),
            num_tasks
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::config(format!("{name} must be finite and non-negative")));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(Error::config(format!("{name} must have a positive sum")));
    }
    Ok(())
}
