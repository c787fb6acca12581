//! Score bookkeeping for training and evaluation
//!
//! [`Metrics`] records one value per selected metric every time predictions
//! are scored, plus a loss list, so after `n` epochs every list holds `n`
//! entries. Training drivers read the display metric for progress output and
//! the early-stopping metric for convergence monitoring.

pub mod classification;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Recorded values keyed by metric name
pub type Scores = BTreeMap<String, Vec<f64>>;

/// Loss key used by training metrics
pub const TRAIN_LOSS_KEY: &str = "loss";

/// Loss key used by dev metrics
pub const DEV_LOSS_KEY: &str = "dev_loss";

/// Supported classification metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Fraction of correct predictions
    Accuracy,
    /// Support-weighted precision
    Precision,
    /// Support-weighted recall
    Recall,
    /// Support-weighted one-vs-rest AUC
    Auc,
    /// Support-weighted F1
    F1,
}

impl MetricKind {
    /// Parse a metric from a loose name such as `"Accuracy"` or `"f1_weighted"`
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.to_lowercase();
        if name.contains("accuracy") {
            Ok(MetricKind::Accuracy)
        } else if name.contains("precision") {
            Ok(MetricKind::Precision)
        } else if name.contains("recall") {
            Ok(MetricKind::Recall)
        } else if name.contains("auc") {
            Ok(MetricKind::Auc)
        } else if name.contains("f1") {
            Ok(MetricKind::F1)
        } else if name.contains("confusion") {
            Err(Error::config("Confusion matrices are not scalar metrics and cannot be tracked"))
        } else {
            Err(Error::config(format!("Unknown metric: {name}")))
        }
    }

    /// Canonical key under which scores are stored
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::Precision => "precision",
            MetricKind::Recall => "recall",
            MetricKind::Auc => "auc",
            MetricKind::F1 => "f1-score",
        }
    }

    /// Score predictions against gold labels
    pub fn compute(&self, labels: &[u32], preds: &[u32]) -> Result<f64> {
        match self {
            MetricKind::Accuracy => classification::accuracy(labels, preds),
            MetricKind::Precision => classification::precision(labels, preds),
            MetricKind::Recall => classification::recall(labels, preds),
            MetricKind::Auc => classification::roc_auc(labels, preds),
            MetricKind::F1 => classification::f1_score(labels, preds),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metric selection plus the history of recorded scores and losses
#[derive(Debug, Clone)]
pub struct Metrics {
    metrics: Vec<MetricKind>,
    scores: Scores,
    display_metric: MetricKind,
    early_stop_metric: MetricKind,
    loss_key: String,
}

impl Metrics {
    /// Select metrics by name and choose the one shown in progress output
    ///
    /// The display metric is also the early-stopping metric unless
    /// [`Metrics::with_early_stopping`] picks another.
    pub fn new<S: AsRef<str>>(names: &[S], display_metric: &str) -> Result<Self> {
        let mut metrics = Vec::new();
        for name in names {
            let kind = MetricKind::parse(name.as_ref())?;
            if !metrics.contains(&kind) {
                metrics.push(kind);
            }
        }
        if metrics.is_empty() {
            return Err(Error::config("At least one metric must be selected"));
        }

        let display_metric = MetricKind::parse(display_metric)?;
        if !metrics.contains(&display_metric) {
            return Err(Error::config(format!(
                "Display metric '{display_metric}' is not among the selected metrics"
            )));
        }

        let mut scores: Scores = metrics.iter().map(|m| (m.name().to_string(), Vec::new())).collect();
        scores.insert(TRAIN_LOSS_KEY.to_string(), Vec::new());

        Ok(Self {
            metrics,
            scores,
            display_metric,
            early_stop_metric: display_metric,
            loss_key: TRAIN_LOSS_KEY.to_string(),
        })
    }

    /// Use a different metric to decide early stopping
    pub fn with_early_stopping(mut self, metric: &str) -> Result<Self> {
        let kind = MetricKind::parse(metric)?;
        if !self.metrics.contains(&kind) {
            return Err(Error::config(format!(
                "Early stopping metric '{kind}' is not among the selected metrics"
            )));
        }
        self.early_stop_metric = kind;
        Ok(self)
    }

    /// Record losses under `key`, e.g. [`DEV_LOSS_KEY`] for dev metrics
    pub fn with_loss_key(mut self, key: &str) -> Self {
        let losses = self.scores.remove(&self.loss_key).unwrap_or_default();
        self.loss_key = key.to_string();
        self.scores.insert(self.loss_key.clone(), losses);
        self
    }

    /// A fresh copy with the same selection and no recorded values
    pub fn empty_like(&self) -> Self {
        let mut fresh = self.clone();
        fresh.scores.values_mut().for_each(Vec::clear);
        fresh
    }

    /// Score predictions and append one value per metric
    pub fn compute(&mut self, labels: &[u32], preds: &[u32]) -> Result<&Scores> {
        let computed = self.compute_unrecorded(labels, preds)?;
        for (name, value) in computed {
            self.scores.entry(name).or_default().push(value);
        }
        Ok(&self.scores)
    }

    /// Score predictions without recording them
    pub fn compute_unrecorded(&self, labels: &[u32], preds: &[u32]) -> Result<BTreeMap<String, f64>> {
        self.metrics
            .iter()
            .map(|m| Ok((m.name().to_string(), m.compute(labels, preds)?)))
            .collect()
    }

    /// Record NaN for every metric, keeping the lists aligned with epochs
    pub fn skip(&mut self) {
        for m in &self.metrics {
            self.scores.entry(m.name().to_string()).or_default().push(f64::NAN);
        }
    }

    /// Append a loss value
    pub fn loss(&mut self, value: f64) {
        self.scores.entry(self.loss_key.clone()).or_default().push(value);
    }

    /// Recorded losses
    pub fn losses(&self) -> &[f64] {
        self.scores.get(&self.loss_key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Key under which losses are stored
    pub fn loss_key(&self) -> &str {
        &self.loss_key
    }

    /// Display metric name and its latest value
    pub fn display(&self) -> (&'static str, Option<f64>) {
        (self.display_metric.name(), self.last(self.display_metric.name()))
    }

    /// Display metric formatted for progress output
    pub fn postfix(&self) -> String {
        match self.display() {
            (name, Some(value)) => format!("{name}={value:.4}"),
            (name, None) => format!("{name}=n/a"),
        }
    }

    /// Display metric
    pub fn display_metric(&self) -> MetricKind {
        self.display_metric
    }

    /// Latest value of the early-stopping metric
    pub fn early_stopping(&self) -> Option<f64> {
        self.last(self.early_stop_metric.name())
    }

    /// Selected metric names in selection order
    pub fn list(&self) -> Vec<&'static str> {
        self.metrics.iter().map(MetricKind::name).collect()
    }

    /// All values recorded for a metric
    pub fn get(&self, metric: &str) -> Option<&[f64]> {
        self.scores.get(metric).map(Vec::as_slice)
    }

    /// Latest value recorded for a metric
    pub fn last(&self, metric: &str) -> Option<f64> {
        self.scores.get(metric).and_then(|v| v.last().copied())
    }

    /// Every recorded list, including losses
    pub fn scores(&self) -> &Scores {
        &self.scores
    }
}
