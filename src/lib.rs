//! mlearn - training and evaluation pipelines for text classifiers
//!
//! Documents are read from JSON lines, vectorized into bag-of-words features
//! and fed either to a candle MLP (single-task or multi-task with one output
//! head per task) or to a classical estimator. Every run records per-epoch
//! scores and writes them as CSV rows.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod fileio;
pub mod logging;
pub mod model;
pub mod progress;
pub mod run;
pub mod training;
pub mod vectorize;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use model::{Classifier, MlpClassifier, MlpConfig, ModelState};
pub use progress::ProgressReporter;
pub use run::{run_mtl_model, run_singletask_model};
pub use training::{
    train_mtl_model, train_singletask_model, BatchIterator, Dataset, Document, EarlyStopping, Metrics,
    TrainingHistory,
};
pub use vectorize::{select_vectorizer, TextVectorizer, Vectorizer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
