//! Training infrastructure
//!
//! - **Data**: documents, label encoding and batching
//! - **Metrics**: classification scores recorded per epoch
//! - **Early stopping**: patience on a dev score with best-state restore
//! - **Trainer**: single-task loop
//! - **Multitask**: weighted task sampling over per-task batches
//! - **Evaluate**: prediction and scoring helpers
//! - **Classical**: estimators, k-fold and grid search
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mlearn::training::{train_singletask_model, TrainingConfig, TrainingOptimizer};
//!
//! let mut optimizer = TrainingOptimizer::new(&OptimizerConfig::default(), model.var_map())?;
//! let history = train_singletask_model(
//!     &model,
//!     &mut optimizer,
//!     &cross_entropy_loss,
//!     &mut train_batches,
//!     &mut metrics,
//!     Some((&dev_batches, &mut dev_metrics)),
//!     &TrainingConfig::default(),
//!     &ProgressReporter::hidden(),
//! )?;
//! ```

pub mod classical;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod evaluate;
pub mod metrics;
pub mod multitask;
pub mod optimizers;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use classical::{
    select_training_regime, train_classical, train_estimator, train_estimator_cv, train_estimator_gridsearch,
    ClassicalConfig, Estimator, FittedEstimator, KFold, NaiveBayes, ParamGrid, Params, Regime, StratifiedKFold,
};
pub use config::{MtlConfig, TrainingConfig};
pub use data::{process_and_batch, Batch, BatchIterator, Batches, Dataset, Document, LabelIndex};
pub use early_stopping::EarlyStopping;
pub use evaluate::{assign_predictions, eval_estimator, eval_model, predict_estimator, predict_model, Evaluation, Predictions};
pub use metrics::{MetricKind, Metrics, Scores};
pub use multitask::{train_mtl_model, TaskSampler};
pub use optimizers::{clip_grad_norm, OptimizerConfig, TrainingOptimizer};
pub use trainer::{train_singletask_model, TrainingHistory};
