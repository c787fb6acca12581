//! Run configuration for the mlearn command line

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::classical::ClassicalConfig;
use crate::training::config::{MtlConfig, TrainingConfig};
use crate::training::metrics::MetricKind;
use crate::training::optimizers::OptimizerConfig;

/// Complete configuration of one training or evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Main dataset
    pub data: DataConfig,
    /// Which kind of model to train
    #[serde(default)]
    pub library: Library,
    /// Feature extraction: `count` or `tfidf`
    #[serde(default = "default_vectorizer")]
    pub vectorizer: String,
    /// Neural model shape
    #[serde(default)]
    pub model: ModelConfig,
    /// Training loop settings
    #[serde(default)]
    pub training: TrainingConfig,
    /// Optimizer settings
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Classical training regime settings
    #[serde(default)]
    pub classical: ClassicalConfig,
    /// Auxiliary tasks; set to train a multi-task model
    #[serde(default)]
    pub multitask: Option<MultitaskConfig>,
    /// Metrics to record
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Where results, predictions and models go
    pub output: OutputConfig,
}

fn default_vectorizer() -> String {
    "count".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.training.validate()?;
        self.optimizer.validate()?;
        self.metrics.validate()?;

        if self.model.hidden_dim == 0 {
            return Err(Error::config("Hidden dimension must be > 0"));
        }

        if let Some(multitask) = &self.multitask {
            if self.library == Library::Classical {
                return Err(Error::config("Multi-task training requires a neural model"));
            }
            for task in &multitask.aux_tasks {
                task.validate()?;
            }
            self.mtl_config()?.validate(multitask.aux_tasks.len() + 1)?;
        }

        if self.library == Library::Classical {
            MetricKind::parse(&self.classical.scoring)?;
            if let Some(folds) = self.classical.cross_validate {
                if folds < 2 {
                    return Err(Error::config("Cross-validation needs at least 2 folds"));
                }
            }
        }
        Ok(())
    }

    /// Multi-task settings merged with the shared training settings
    pub fn mtl_config(&self) -> Result<MtlConfig> {
        let multitask = self
            .multitask
            .as_ref()
            .ok_or_else(|| Error::config("No multi-task section configured"))?;
        Ok(MtlConfig {
            training: self.training.clone(),
            dev_task_id: multitask.dev_task_id,
            batches_per_epoch: multitask.batches_per_epoch,
            dataset_weights: multitask.dataset_weights.clone(),
            loss_weights: multitask.loss_weights.clone(),
        })
    }

    /// Header names of the [`Config::model_info`] columns
    pub fn model_info_names(&self) -> [&'static str; 4] {
        match self.library {
            Library::Neural => ["library", "vectorizer", "hidden_dim", "learning_rate"],
            Library::Classical => ["library", "vectorizer", "params", "folds"],
        }
    }

    /// Identifying columns added to every output row
    pub fn model_info(&self) -> Vec<String> {
        let mut info = vec![self.library.to_string(), self.vectorizer.clone()];
        match self.library {
            Library::Neural => {
                info.push(self.model.hidden_dim.to_string());
                info.push(format!("{}", self.optimizer.learning_rate()));
            }
            Library::Classical => {
                let params: serde_json::Map<String, serde_json::Value> = self.classical.params.clone().into_iter().collect();
                info.push(serde_json::Value::Object(params).to_string());
                info.push(self.classical.cross_validate.map_or(String::new(), |f| f.to_string()));
            }
        }
        info
    }
}

/// Kind of model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    /// Candle MLP trained by gradient descent
    #[default]
    Neural,
    /// Classical estimator fitted in one pass
    Classical,
}

impl std::fmt::Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Library::Neural => write!(f, "neural"),
            Library::Classical => write!(f, "classical"),
        }
    }
}

/// One dataset on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset name used in result rows
    pub name: String,
    /// Training split
    pub train: PathBuf,
    /// Development split
    #[serde(default)]
    pub dev: Option<PathBuf>,
    /// Test split
    #[serde(default)]
    pub test: Option<PathBuf>,
    /// Dotted path of the document text in each record
    #[serde(default = "default_doc_key")]
    pub doc_key: String,
    /// Dotted path of the label in each record
    #[serde(default = "default_label_key")]
    pub label_key: String,
    /// Other fields to keep, by output name and dotted path
    #[serde(default)]
    pub extra_keys: BTreeMap<String, String>,
}

fn default_doc_key() -> String {
    "text".to_string()
}

fn default_label_key() -> String {
    "label".to_string()
}

impl DataConfig {
    /// Validate the dataset entry
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Dataset name must not be empty"));
        }
        if self.doc_key.is_empty() || self.label_key.is_empty() {
            return Err(Error::config(format!(
                "Dataset '{}' needs both a doc_key and a label_key",
                self.name
            )));
        }
        Ok(())
    }
}

/// Neural model shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of the shared hidden layer
    pub hidden_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { hidden_dim: 128 }
    }
}

/// Auxiliary tasks and their weighting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultitaskConfig {
    /// Datasets trained alongside the main one, as tasks 1, 2, ...
    pub aux_tasks: Vec<DataConfig>,
    /// Task whose dev data drives early stopping (0 is the main dataset)
    #[serde(default)]
    pub dev_task_id: usize,
    /// Optimizer steps per epoch
    #[serde(default)]
    pub batches_per_epoch: Option<usize>,
    /// Sampling probability of each task
    #[serde(default)]
    pub dataset_weights: Option<Vec<f64>>,
    /// Loss weight of each task
    #[serde(default)]
    pub loss_weights: Option<Vec<f64>>,
}

/// Metric selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Metrics to compute
    pub metrics: Vec<String>,
    /// Metric shown in progress output
    pub display_metric: String,
    /// Metric used for early stopping; defaults to the display metric
    pub early_stopping: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            metrics: vec![
                "accuracy".to_string(),
                "precision".to_string(),
                "recall".to_string(),
                "f1".to_string(),
            ],
            display_metric: "f1".to_string(),
            early_stopping: None,
        }
    }
}

impl MetricsConfig {
    /// Validate metric names
    pub fn validate(&self) -> Result<()> {
        let selected = self
            .metrics
            .iter()
            .map(|m| MetricKind::parse(m))
            .collect::<Result<Vec<_>>>()?;
        for name in std::iter::once(&self.display_metric).chain(self.early_stopping.as_ref()) {
            let kind = MetricKind::parse(name)?;
            if !selected.contains(&kind) {
                return Err(Error::config(format!("Metric '{name}' is not among the selected metrics")));
            }
        }
        Ok(())
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// CSV file receiving one row per epoch
    pub results: PathBuf,
    /// CSV file receiving test predictions
    #[serde(default)]
    pub predictions: Option<PathBuf>,
    /// Base path for stored models and feature manifests
    #[serde(default)]
    pub model_base: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"{
            "data": {"name": "toy", "train": "train.json"},
            "output": {"results": "results.csv"}
        }"#
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_json::from_str(minimal()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.library, Library::Neural);
        assert_eq!(config.vectorizer, "count");
        assert_eq!(config.data.doc_key, "text");
        assert_eq!(config.model.hidden_dim, 128);
        assert_eq!(config.metrics.display_metric, "f1");
        assert!(config.multitask.is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, minimal()).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.data.name, "toy");
    }

    #[test]
    fn test_display_metric_must_be_selected() {
        let mut config: Config = serde_json::from_str(minimal()).unwrap();
        config.metrics.display_metric = "auc".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multitask_weights_are_checked() {
        let mut config: Config = serde_json::from_str(minimal()).unwrap();
        config.multitask = Some(MultitaskConfig {
            aux_tasks: vec![config.data.clone()],
            dev_task_id: 0,
            batches_per_epoch: None,
            dataset_weights: Some(vec![1.0]),
            loss_weights: None,
        });
        assert!(config.validate().is_err());

        if let Some(multitask) = config.multitask.as_mut() {
            multitask.dataset_weights = Some(vec![0.7, 0.3]);
        }
        assert!(config.validate().is_ok());
        assert_eq!(config.mtl_config().unwrap().dataset_weights, Some(vec![0.7, 0.3]));
    }

    #[test]
    fn test_classical_model_info_lists_params() {
        let mut config: Config = serde_json::from_str(minimal()).unwrap();
        config.library = Library::Classical;
        config.classical.params.insert("alpha".to_string(), serde_json::json!(0.5));
        config.classical.cross_validate = Some(3);

        let info = config.model_info();
        assert_eq!(info, vec!["classical", "count", r#"{"alpha":0.5}"#, "3"]);
        assert_eq!(info.len(), config.model_info_names().len());
    }

    #[test]
    fn test_classical_multitask_is_rejected() {
        let mut config: Config = serde_json::from_str(minimal()).unwrap();
        config.library = Library::Classical;
        config.multitask = Some(MultitaskConfig {
            aux_tasks: Vec::new(),
            dev_task_id: 0,
            batches_per_epoch: None,
            dataset_weights: None,
            loss_weights: None,
        });
        assert!(config.validate().is_err());
    }
}
