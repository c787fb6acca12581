//! Classical (non-neural) estimators and their training regimes
//!
//! An [`Estimator`] is fitted on dense vectorized documents. Three regimes are
//! supported: a plain fit, k-fold cross-validation and grid search over a
//! parameter grid. Every regime finishes with an estimator fitted on the whole
//! training split and scored on the dev split when one exists.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::training::data::Dataset;
use crate::training::evaluate::eval_estimator;
use crate::training::metrics::{MetricKind, Metrics};
use crate::vectorize::Vectorizer;

/// Hyperparameters of one estimator
pub type Params = BTreeMap<String, Value>;

/// A model fitted on dense feature rows
pub trait Estimator {
    /// Fit from scratch, discarding any previous state
    fn fit(&mut self, features: &[Vec<f32>], labels: &[u32]) -> Result<()>;

    /// Predict one class id per row
    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<u32>>;

    /// Name used in logs and result rows
    fn name(&self) -> &str;
}

/// Multinomial naive Bayes over count or tf-idf features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayes {
    alpha: f64,
    class_log_prior: Vec<f64>,
    feature_log_prob: Vec<Vec<f64>>,
}

impl NaiveBayes {
    /// Additive smoothing `alpha`
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha.is_finite()) {
            return Err(Error::config("Naive Bayes alpha must be a positive number"));
        }
        Ok(Self {
            alpha,
            class_log_prior: Vec::new(),
            feature_log_prob: Vec::new(),
        })
    }

    /// Build from a parameter set; recognises `alpha` (default 1.0)
    pub fn from_params(params: &Params) -> Result<Self> {
        let mut alpha = 1.0;
        for (key, value) in params {
            match key.as_str() {
                "alpha" => {
                    alpha = value
                        .as_f64()
                        .ok_or_else(|| Error::config(format!("alpha must be a number, got {value}")))?;
                }
                other => return Err(Error::config(format!("Unknown naive Bayes parameter '{other}'"))),
            }
        }
        Self::new(alpha)
    }

    /// Smoothing parameter
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Estimator for NaiveBayes {
    fn fit(&mut self, features: &[Vec<f32>], labels: &[u32]) -> Result<()> {
        if features.len() != labels.len() {
            return Err(Error::invalid_input(format!(
                "Got {} rows and {} labels",
                features.len(),
                labels.len()
            )));
        }
        if features.is_empty() {
            return Err(Error::data("Cannot fit on an empty training set"));
        }

        let dim = features[0].len();
        let num_classes = labels.iter().max().map_or(0, |&m| m as usize + 1);
        let mut class_counts = vec![0usize; num_classes];
        let mut feature_counts = vec![vec![0f64; dim]; num_classes];

        for (row, &label) in features.iter().zip(labels) {
            if row.len() != dim {
                return Err(Error::invalid_input("Feature rows have different lengths"));
            }
            class_counts[label as usize] += 1;
            for (acc, &x) in feature_counts[label as usize].iter_mut().zip(row) {
                *acc += x as f64;
            }
        }

        let n = features.len() as f64;
        // Unseen class ids get the lowest finite prior so they are never predicted.
        self.class_log_prior = class_counts
            .iter()
            .map(|&c| if c == 0 { f64::MIN } else { (c as f64 / n).ln() })
            .collect();
        self.feature_log_prob = feature_counts
            .iter()
            .map(|counts| {
                let total: f64 = counts.iter().sum::<f64>() + self.alpha * dim as f64;
                counts.iter().map(|c| ((c + self.alpha) / total).ln()).collect()
            })
            .collect();
        Ok(())
    }

    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<u32>> {
        if self.class_log_prior.is_empty() {
            return Err(Error::training("Naive Bayes must be fitted before predicting"));
        }
        features
            .iter()
            .map(|row| {
                let mut best = (0u32, f64::NEG_INFINITY);
                for (class, (prior, log_prob)) in self.class_log_prior.iter().zip(&self.feature_log_prob).enumerate() {
                    if log_prob.len() != row.len() {
                        return Err(Error::invalid_input(format!(
                            "Expected {} features, got {}",
                            log_prob.len(),
                            row.len()
                        )));
                    }
                    let score = prior + row.iter().zip(log_prob).map(|(&x, lp)| x as f64 * lp).sum::<f64>();
                    if score > best.1 {
                        best = (class as u32, score);
                    }
                }
                Ok(best.0)
            })
            .collect()
    }

    fn name(&self) -> &str {
        "naive-bayes"
    }
}

/// K-fold splitter with optional seeded shuffling
#[derive(Debug, Clone)]
pub struct KFold {
    n_splits: usize,
    shuffle: bool,
    seed: u64,
}

impl KFold {
    /// `n_splits` folds, shuffled with seed 42
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            shuffle: true,
            seed: 42,
        }
    }

    /// Set the shuffling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Keep the input order
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    /// Train and test indices for each fold
    pub fn split(&self, n_samples: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        check_splits(self.n_splits, n_samples)?;
        let mut indices: Vec<usize> = (0..n_samples).collect();
        if self.shuffle {
            indices.shuffle(&mut StdRng::seed_from_u64(self.seed));
        }

        let fold_size = n_samples / self.n_splits;
        let remainder = n_samples % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;

        for i in 0..self.n_splits {
            let end = start + fold_size + usize::from(i < remainder);
            let test = indices[start..end].to_vec();
            let train = indices[..start].iter().chain(&indices[end..]).copied().collect();
            folds.push((train, test));
            start = end;
        }
        Ok(folds)
    }
}

/// K-fold splitter that keeps class proportions similar across folds
#[derive(Debug, Clone)]
pub struct StratifiedKFold {
    n_splits: usize,
    seed: u64,
}

impl StratifiedKFold {
    /// `n_splits` folds, shuffled with seed 42
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits, seed: 42 }
    }

    /// Set the shuffling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Train and test indices for each fold
    pub fn split(&self, labels: &[u32]) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        check_splits(self.n_splits, labels.len())?;
        let mut by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            by_class.entry(label).or_default().push(i);
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut assignment = vec![0usize; labels.len()];
        let mut next = 0;
        // Deal each class round-robin, continuing where the previous class stopped.
        for indices in by_class.values_mut() {
            if indices.len() < self.n_splits {
                warn!(
                    "Class with {} members is smaller than the number of folds ({})",
                    indices.len(),
                    self.n_splits
                );
            }
            indices.shuffle(&mut rng);
            for &i in indices.iter() {
                assignment[i] = next % self.n_splits;
                next += 1;
            }
        }

        Ok((0..self.n_splits)
            .map(|fold| {
                let (test, train): (Vec<usize>, Vec<usize>) =
                    (0..labels.len()).partition(|&i| assignment[i] == fold);
                (train, test)
            })
            .collect())
    }
}

fn check_splits(n_splits: usize, n_samples: usize) -> Result<()> {
    if n_splits < 2 {
        return Err(Error::config("Cross-validation needs at least 2 folds"));
    }
    if n_samples < n_splits {
        return Err(Error::data(format!(
            "Cannot split {n_samples} examples into {n_splits} folds"
        )));
    }
    Ok(())
}

fn fold_indices(
    labels: &[u32],
    folds: usize,
    stratified: bool,
    seed: u64,
) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if stratified {
        StratifiedKFold::new(folds).with_seed(seed).split(labels)
    } else {
        KFold::new(folds).with_seed(seed).split(labels.len())
    }
}

fn select<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| items[i].clone()).collect()
}

/// Values to try for each hyperparameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamGrid(pub BTreeMap<String, Vec<Value>>);

impl ParamGrid {
    /// Every combination of the grid's values, in key order
    pub fn expand(&self) -> Result<Vec<Params>> {
        let mut candidates = vec![Params::new()];
        for (key, values) in &self.0 {
            if values.is_empty() {
                return Err(Error::config(format!("Parameter grid entry '{key}' has no values")));
            }
            candidates = candidates
                .into_iter()
                .flat_map(|params| {
                    values.iter().map(move |value| {
                        let mut next = params.clone();
                        next.insert(key.clone(), value.clone());
                        next
                    })
                })
                .collect();
        }
        Ok(candidates)
    }
}

/// Settings that choose and drive a classical training regime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassicalConfig {
    /// Number of cross-validation folds
    pub cross_validate: Option<usize>,
    /// Stratify folds by label
    pub stratified: bool,
    /// Hyperparameters to search over
    pub grid_search: Option<ParamGrid>,
    /// Metric used to rank grid-search candidates
    pub scoring: String,
    /// Worker threads for grid search; 1 runs sequentially, unset uses every core
    pub n_jobs: Option<usize>,
    /// Fixed hyperparameters for plain and cross-validated training
    pub params: Params,
    /// Seed for fold shuffling
    pub seed: u64,
}

impl Default for ClassicalConfig {
    fn default() -> Self {
        Self {
            cross_validate: None,
            stratified: true,
            grid_search: None,
            scoring: "f1".to_string(),
            n_jobs: None,
            params: Params::new(),
            seed: 42,
        }
    }
}

/// How a classical estimator is trained
#[derive(Debug, Clone, PartialEq)]
pub enum Regime {
    /// Fit once on the training split
    Plain,
    /// Score each of `folds` folds, then refit on everything
    CrossValidated {
        /// Number of folds
        folds: usize,
        /// Stratify folds by label
        stratified: bool,
    },
    /// Cross-validate every grid candidate and refit the best
    GridSearch {
        /// Parameter grid
        grid: ParamGrid,
        /// Number of folds per candidate
        folds: usize,
        /// Ranking metric
        scoring: MetricKind,
        /// Worker threads
        n_jobs: Option<usize>,
    },
}

/// Grid search when a grid is given, cross-validation when a fold count is given, else a plain fit
pub fn select_training_regime(config: &ClassicalConfig) -> Result<Regime> {
    let regime = match (&config.grid_search, config.cross_validate) {
        (Some(grid), folds) => Regime::GridSearch {
            grid: grid.clone(),
            folds: folds.unwrap_or(5),
            scoring: MetricKind::parse(&config.scoring)?,
            n_jobs: config.n_jobs,
        },
        (None, Some(folds)) => Regime::CrossValidated {
            folds,
            stratified: config.stratified,
        },
        (None, None) => Regime::Plain,
    };
    debug!("Selected training regime {:?}", regime);
    Ok(regime)
}

/// A fitted estimator and how it was chosen
#[derive(Debug)]
pub struct FittedEstimator<E> {
    /// The estimator, fitted on the whole training split
    pub estimator: E,
    /// Hyperparameters it was built with
    pub params: Params,
    /// Mean cross-validation score, when the regime computed one
    pub cv_score: Option<f64>,
}

struct Splits {
    train_x: Vec<Vec<f32>>,
    train_y: Vec<u32>,
    dev_x: Vec<Vec<f32>>,
    dev_y: Vec<u32>,
}

fn vectorize_splits<V: Vectorizer + ?Sized>(dataset: &Dataset, vectorizer: &mut V) -> Result<Splits> {
    let train_x = vectorizer.fit_transform(&Dataset::tokens(&dataset.train))?;
    let train_y = dataset.labels.encode_all(&dataset.train)?;
    let dev_x = if dataset.dev.is_empty() {
        Vec::new()
    } else {
        vectorizer.transform(&Dataset::tokens(&dataset.dev))?
    };
    let dev_y = dataset.labels.encode_all(&dataset.dev)?;
    Ok(Splits {
        train_x,
        train_y,
        dev_x,
        dev_y,
    })
}

fn eval_dev<E: Estimator + ?Sized>(
    estimator: &E,
    splits: &Splits,
    dev_metrics: Option<&mut Metrics>,
) -> Result<()> {
    if let Some(dev_metrics) = dev_metrics {
        if splits.dev_y.is_empty() {
            debug!("No dev data, skipping dev evaluation");
        } else {
            eval_estimator(estimator, &splits.dev_x, &splits.dev_y, dev_metrics, None)?;
            info!("Dev {}", dev_metrics.postfix());
        }
    }
    Ok(())
}

/// Fit the vectorizer and estimator on train, then score train and dev
#[instrument(skip_all, fields(estimator = estimator.name()))]
pub fn train_estimator<E, V>(
    mut estimator: E,
    vectorizer: &mut V,
    dataset: &Dataset,
    metrics: &mut Metrics,
    dev_metrics: Option<&mut Metrics>,
) -> Result<FittedEstimator<E>>
where
    E: Estimator,
    V: Vectorizer + ?Sized,
{
    let splits = vectorize_splits(dataset, vectorizer)?;
    estimator.fit(&splits.train_x, &splits.train_y)?;
    eval_estimator(&estimator, &splits.train_x, &splits.train_y, metrics, None)?;
    info!("Train {}", metrics.postfix());
    eval_dev(&estimator, &splits, dev_metrics)?;

    Ok(FittedEstimator {
        estimator,
        params: Params::new(),
        cv_score: None,
    })
}

/// Record one score per fold in `metrics`, then refit on all training data and score dev
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(estimator = estimator.name(), folds = folds))]
pub fn train_estimator_cv<E, V>(
    mut estimator: E,
    vectorizer: &mut V,
    dataset: &Dataset,
    folds: usize,
    stratified: bool,
    seed: u64,
    metrics: &mut Metrics,
    dev_metrics: Option<&mut Metrics>,
) -> Result<FittedEstimator<E>>
where
    E: Estimator,
    V: Vectorizer + ?Sized,
{
    let splits = vectorize_splits(dataset, vectorizer)?;
    let mut fold_scores = Vec::with_capacity(folds);

    for (fold, (train_idx, test_idx)) in fold_indices(&splits.train_y, folds, stratified, seed)?
        .into_iter()
        .enumerate()
    {
        let train_x = select(&splits.train_x, &train_idx);
        let train_y = select(&splits.train_y, &train_idx);
        let test_x = select(&splits.train_x, &test_idx);
        let test_y = select(&splits.train_y, &test_idx);

        estimator.fit(&train_x, &train_y)?;
        eval_estimator(&estimator, &test_x, &test_y, metrics, None)?;
        debug!("Fold {} {}", fold, metrics.postfix());
        if let (_, Some(score)) = metrics.display() {
            fold_scores.push(score);
        }
    }

    let cv_score = mean(&fold_scores);
    info!("Cross-validated {} = {:.4}", metrics.display_metric(), cv_score);

    estimator.fit(&splits.train_x, &splits.train_y)?;
    eval_dev(&estimator, &splits, dev_metrics)?;

    Ok(FittedEstimator {
        estimator,
        params: Params::new(),
        cv_score: Some(cv_score),
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn score_candidate<E, F>(
    factory: &F,
    params: &Params,
    splits: &Splits,
    folds: &[(Vec<usize>, Vec<usize>)],
    scoring: MetricKind,
) -> Result<f64>
where
    E: Estimator,
    F: Fn(&Params) -> Result<E>,
{
    let mut scores = Vec::with_capacity(folds.len());
    for (train_idx, test_idx) in folds {
        let mut estimator = factory(params)?;
        estimator.fit(&select(&splits.train_x, train_idx), &select(&splits.train_y, train_idx))?;
        let preds = estimator.predict(&select(&splits.train_x, test_idx))?;
        scores.push(scoring.compute(&select(&splits.train_y, test_idx), &preds)?);
    }
    Ok(mean(&scores))
}

/// Cross-validate every candidate of `grid`, refit the best on all training data and score train and dev
///
/// Candidates are scored in parallel unless `n_jobs` is 1. Ties keep the
/// earliest candidate; NaN scores rank last.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(folds = folds))]
pub fn train_estimator_gridsearch<E, F, V>(
    factory: &F,
    vectorizer: &mut V,
    dataset: &Dataset,
    grid: &ParamGrid,
    folds: usize,
    scoring: MetricKind,
    n_jobs: Option<usize>,
    seed: u64,
    metrics: &mut Metrics,
    dev_metrics: Option<&mut Metrics>,
) -> Result<FittedEstimator<E>>
where
    E: Estimator,
    F: Fn(&Params) -> Result<E> + Sync,
    V: Vectorizer + ?Sized,
{
    let splits = vectorize_splits(dataset, vectorizer)?;
    let candidates = grid.expand()?;
    let fold_sets = fold_indices(&splits.train_y, folds, true, seed)?;
    info!("Grid search over {} candidates with {} folds", candidates.len(), folds);

    let run = |params: &Params| score_candidate(factory, params, &splits, &fold_sets, scoring);
    let scores: Vec<f64> = match n_jobs {
        Some(1) => candidates.iter().map(run).collect::<Result<_>>()?,
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| Error::internal(format!("Failed to build thread pool: {e}")))?
            .install(|| candidates.par_iter().map(run).collect::<Result<_>>())?,
        None => candidates.par_iter().map(run).collect::<Result<_>>()?,
    };

    let mut best: Option<(usize, f64)> = None;
    for (i, &score) in scores.iter().enumerate() {
        debug!("Candidate {:?}: {} = {:.4}", candidates[i], scoring, score);
        let better = match best {
            None => true,
            Some((_, best_score)) => score > best_score || (best_score.is_nan() && !score.is_nan()),
        };
        if better {
            best = Some((i, score));
        }
    }
    let (best_ix, best_score) = best.ok_or_else(|| Error::internal("Parameter grid produced no candidates"))?;
    let params = candidates[best_ix].clone();
    info!("Best parameters {:?} with {} = {:.4}", params, scoring, best_score);

    let mut estimator = factory(&params)?;
    estimator.fit(&splits.train_x, &splits.train_y)?;
    eval_estimator(&estimator, &splits.train_x, &splits.train_y, metrics, None)?;
    eval_dev(&estimator, &splits, dev_metrics)?;

    Ok(FittedEstimator {
        estimator,
        params,
        cv_score: Some(best_score),
    })
}

/// Train with whichever regime `config` selects
pub fn train_classical<E, F, V>(
    factory: &F,
    config: &ClassicalConfig,
    vectorizer: &mut V,
    dataset: &Dataset,
    metrics: &mut Metrics,
    dev_metrics: Option<&mut Metrics>,
) -> Result<FittedEstimator<E>>
where
    E: Estimator,
    F: Fn(&Params) -> Result<E> + Sync,
    V: Vectorizer + ?Sized,
{
    match select_training_regime(config)? {
        Regime::Plain => {
            let estimator = factory(&config.params)?;
            let mut fitted = train_estimator(estimator, vectorizer, dataset, metrics, dev_metrics)?;
            fitted.params = config.params.clone();
            Ok(fitted)
        }
        Regime::CrossValidated { folds, stratified } => {
            let estimator = factory(&config.params)?;
            let mut fitted = train_estimator_cv(
                estimator,
                vectorizer,
                dataset,
                folds,
                stratified,
                config.seed,
                metrics,
                dev_metrics,
            )?;
            fitted.params = config.params.clone();
            Ok(fitted)
        }
        Regime::GridSearch {
            grid,
            folds,
            scoring,
            n_jobs,
        } => train_estimator_gridsearch(
            factory,
            vectorizer,
            dataset,
            &grid,
            folds,
            scoring,
            n_jobs,
            config.seed,
            metrics,
            dev_metrics,
        ),
    }
}
