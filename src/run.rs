//! End-to-end runs: load data, train or evaluate, write results
//!
//! [`run_singletask_model`] and [`run_mtl_model`] are what the command line
//! calls. Training runs store the model and its feature manifest when an
//! output base path is configured; evaluation runs load them back, score the
//! test split and also write per-document predictions.

use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::{info, instrument, warn};

use crate::config::{Config, DataConfig, Library, MetricsConfig};
use crate::error::{Error, Result};
use crate::fileio::{
    load_estimator, load_features, load_model, open_csv, read_json_lines, results_header, store_estimator,
    store_features, store_model, write_predictions, write_results, FeatureManifest, RowInfo,
};
use crate::model::{Classifier, MlpClassifier, MlpConfig};
use crate::progress::ProgressReporter;
use crate::training::classical::{train_classical, NaiveBayes, Params};
use crate::training::data::{process_and_batch, Dataset, Document};
use crate::training::evaluate::{assign_predictions, eval_estimator, eval_model};
use crate::training::metrics::{Metrics, DEV_LOSS_KEY};
use crate::training::multitask::train_mtl_model;
use crate::training::optimizers::TrainingOptimizer;
use crate::training::trainer::{train_singletask_model, TrainingHistory};
use crate::vectorize::{select_vectorizer, TextVectorizer, Vectorizer};

/// Mean cross-entropy over a batch of logits and class ids
pub fn cross_entropy_loss(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::loss::cross_entropy(logits, labels)
}

/// Read the configured splits of one dataset
pub fn load_dataset(data: &DataConfig) -> Result<Dataset> {
    let read = |path: &Path| read_json_lines(path, &data.doc_key, &data.label_key, &data.extra_keys);
    let train = read(data.train.as_path())?;
    let dev = data.dev.as_deref().map(read).transpose()?.unwrap_or_default();
    let test = data.test.as_deref().map(read).transpose()?.unwrap_or_default();
    info!(
        "Loaded dataset '{}': {} train, {} dev, {} test",
        data.name,
        train.len(),
        dev.len(),
        test.len()
    );
    Ok(Dataset::new(data.name.clone(), train, dev, test))
}

/// Fresh train and dev metrics from configuration
pub fn build_metrics(config: &MetricsConfig) -> Result<(Metrics, Metrics)> {
    let mut metrics = Metrics::new(&config.metrics, &config.display_metric)?;
    if let Some(metric) = &config.early_stopping {
        metrics = metrics.with_early_stopping(metric)?;
    }
    let dev_metrics = metrics.empty_like().with_loss_key(DEV_LOSS_KEY);
    Ok((metrics, dev_metrics))
}

fn write_run_results(config: &Config, history: &TrainingHistory, metrics: &Metrics, data_name: &str) -> Result<()> {
    let metric_names = metrics.list();
    let header = results_header(&metric_names, &config.model_info_names(), true);
    let model_info = config.model_info();
    let mut writer = open_csv(&config.output.results, &header)?;
    write_results(
        &mut writer,
        history,
        &metric_names,
        RowInfo {
            data_name,
            main_name: &config.data.name,
            model_info: &model_info,
        },
        header.len(),
    )?;
    info!("Wrote {} result rows to {}", history.len(), config.output.results.display());
    Ok(())
}

fn write_run_predictions(config: &Config, dataset: &Dataset) -> Result<()> {
    let Some(path) = &config.output.predictions else {
        return Ok(());
    };
    let model_info = config.model_info();
    let mut writer = open_csv(path, &[])?;
    write_predictions(
        &mut writer,
        &dataset.test,
        &dataset.labels,
        RowInfo {
            data_name: &dataset.name,
            main_name: &config.data.name,
            model_info: &model_info,
        },
    )?;
    info!("Wrote {} predictions to {}", dataset.test.len(), path.display());
    Ok(())
}

fn model_base(config: &Config) -> Result<&Path> {
    config
        .output
        .model_base
        .as_deref()
        .ok_or_else(|| Error::config("Evaluation needs output.model_base pointing at a stored model"))
}

fn load_test_dataset(config: &Config, manifest: &FeatureManifest) -> Result<Dataset> {
    let path = config
        .data
        .test
        .as_deref()
        .ok_or_else(|| Error::config(format!("Dataset '{}' has no test split", config.data.name)))?;
    let test = read_json_lines(path, &config.data.doc_key, &config.data.label_key, &config.data.extra_keys)?;
    Ok(Dataset {
        name: config.data.name.clone(),
        train: Vec::new(),
        dev: Vec::new(),
        test,
        labels: manifest.labels.clone(),
    })
}

/// Train or evaluate a single-task model and write its results
#[instrument(skip_all, fields(dataset = %config.data.name, library = %config.library, train = train))]
pub fn run_singletask_model(config: &Config, train: bool, device: &Device) -> Result<TrainingHistory> {
    let (history, metrics) = match (config.library, train) {
        (Library::Neural, true) => train_neural(config, device)?,
        (Library::Neural, false) => evaluate_neural(config, device)?,
        (Library::Classical, true) => train_estimator_run(config)?,
        (Library::Classical, false) => evaluate_estimator_run(config)?,
    };
    write_run_results(config, &history, &metrics, &config.data.name)?;
    Ok(history)
}

/// Train or evaluate a multi-task model and write its results
///
/// The main dataset is task 0 and the auxiliary datasets follow in order.
/// Evaluation scores the main task's test split.
#[instrument(skip_all, fields(dataset = %config.data.name, train = train))]
pub fn run_mtl_model(config: &Config, train: bool, device: &Device) -> Result<TrainingHistory> {
    if config.library != Library::Neural {
        return Err(Error::config("Multi-task training requires a neural model"));
    }
    if !train {
        let (history, metrics) = evaluate_neural(config, device)?;
        write_run_results(config, &history, &metrics, &config.data.name)?;
        return Ok(history);
    }

    let multitask = config
        .multitask
        .as_ref()
        .ok_or_else(|| Error::config("No multi-task section configured"))?;
    let mtl_config = config.mtl_config()?;
    let datasets = std::iter::once(&config.data)
        .chain(&multitask.aux_tasks)
        .map(load_dataset)
        .collect::<Result<Vec<_>>>()?;
    mtl_config.validate(datasets.len())?;

    let mut vectorizer = select_vectorizer(&config.vectorizer);
    let all_tokens: Vec<&[String]> = datasets.iter().flat_map(|d| Dataset::tokens(&d.train)).collect();
    vectorizer.fit(&all_tokens)?;

    let batch_size = config.training.batch_size;
    let mut tasks = datasets
        .iter()
        .map(|d| process_and_batch(d, &d.train, &vectorizer, batch_size, device))
        .collect::<Result<Vec<_>>>()?;

    let dev_dataset = &datasets[mtl_config.dev_task_id];
    let dev_batches = if dev_dataset.dev.is_empty() {
        warn!("Dev task '{}' has no dev split, early stopping is disabled", dev_dataset.name);
        None
    } else {
        Some(process_and_batch(dev_dataset, &dev_dataset.dev, &vectorizer, batch_size, device)?)
    };

    let model = MlpClassifier::new(
        MlpConfig {
            input_dim: vectorizer.dim(),
            hidden_dim: config.model.hidden_dim,
            output_dims: datasets.iter().map(Dataset::num_classes).collect(),
        },
        device,
    )?;
    let mut optimizer = TrainingOptimizer::new(&config.optimizer, model.var_map())?;
    let (mut metrics, mut dev_metrics) = build_metrics(&config.metrics)?;

    let progress = ProgressReporter::new("Training model", config.training.epochs as u64, config.training.progress);
    let history = train_mtl_model(
        &model,
        &mut optimizer,
        &cross_entropy_loss,
        &mut tasks,
        &mut metrics,
        dev_batches.as_ref().map(|b| (b, &mut dev_metrics)),
        &mtl_config,
        &progress,
    )?;
    progress.finish();

    persist_neural(config, &model, vectorizer, &datasets[0])?;
    write_run_results(config, &history, &metrics, &dev_dataset.name)?;
    Ok(history)
}

fn persist_neural(config: &Config, model: &MlpClassifier, vectorizer: TextVectorizer, dataset: &Dataset) -> Result<()> {
    if let Some(base) = &config.output.model_base {
        store_model(model, base)?;
        let manifest = FeatureManifest::new(vectorizer, dataset.labels.clone(), Some(model.config().clone()));
        store_features(&manifest, base)?;
    }
    Ok(())
}

fn train_neural(config: &Config, device: &Device) -> Result<(TrainingHistory, Metrics)> {
    let dataset = load_dataset(&config.data)?;
    let mut vectorizer = select_vectorizer(&config.vectorizer);
    vectorizer.fit(&Dataset::tokens(&dataset.train))?;

    let batch_size = config.training.batch_size;
    let mut train_batches = process_and_batch(&dataset, &dataset.train, &vectorizer, batch_size, device)?;
    let dev_batches = if dataset.dev.is_empty() {
        None
    } else {
        Some(process_and_batch(&dataset, &dataset.dev, &vectorizer, batch_size, device)?)
    };

    let model = MlpClassifier::new(
        MlpConfig {
            input_dim: vectorizer.dim(),
            hidden_dim: config.model.hidden_dim,
            output_dims: vec![dataset.num_classes()],
        },
        device,
    )?;
    let mut optimizer = TrainingOptimizer::new(&config.optimizer, model.var_map())?;
    let (mut metrics, mut dev_metrics) = build_metrics(&config.metrics)?;

    let progress = ProgressReporter::new("Training epochs", config.training.epochs as u64, config.training.progress);
    let history = train_singletask_model(
        &model,
        &mut optimizer,
        &cross_entropy_loss,
        &mut train_batches,
        &mut metrics,
        dev_batches.as_ref().map(|b| (b, &mut dev_metrics)),
        &config.training,
        &progress,
    )?;
    progress.finish();

    persist_neural(config, &model, vectorizer, &dataset)?;
    Ok((history, metrics))
}

fn evaluate_neural(config: &Config, device: &Device) -> Result<(TrainingHistory, Metrics)> {
    let base = model_base(config)?;
    let manifest = load_features(base)?;
    let mlp_config = manifest
        .model
        .clone()
        .ok_or_else(|| Error::data("Feature manifest has no neural model shape"))?;
    let model = MlpClassifier::new(mlp_config, device)?;
    load_model(&model, base, device)?;

    let mut dataset = load_test_dataset(config, &manifest)?;
    let batches = process_and_batch(
        &dataset,
        &dataset.test,
        &manifest.vectorizer,
        config.training.batch_size,
        device,
    )?;
    let (mut metrics, _) = build_metrics(&config.metrics)?;
    let evaluation = eval_model(&model, &batches, &cross_entropy_loss, &mut metrics, Some(0))?;
    info!("Test loss {:.4}, {}", evaluation.loss, metrics.postfix());

    assign_predictions(&mut dataset.test, &evaluation.predictions)?;
    write_run_predictions(config, &dataset)?;
    Ok((TrainingHistory::from_metrics(&metrics, None), metrics))
}

fn naive_bayes(params: &Params) -> Result<NaiveBayes> {
    NaiveBayes::from_params(params)
}

fn train_estimator_run(config: &Config) -> Result<(TrainingHistory, Metrics)> {
    let dataset = load_dataset(&config.data)?;
    let mut vectorizer = select_vectorizer(&config.vectorizer);
    let (mut metrics, mut dev_metrics) = build_metrics(&config.metrics)?;
    let has_dev = !dataset.dev.is_empty();

    let fitted = train_classical(
        &naive_bayes,
        &config.classical,
        &mut vectorizer,
        &dataset,
        &mut metrics,
        has_dev.then_some(&mut dev_metrics),
    )?;
    if let Some(score) = fitted.cv_score {
        info!("Cross-validation score {:.4} with parameters {:?}", score, fitted.params);
    }

    if let Some(base) = &config.output.model_base {
        store_estimator(&fitted.estimator, base)?;
        store_features(&FeatureManifest::new(vectorizer, dataset.labels.clone(), None), base)?;
    }

    let history = TrainingHistory::from_metrics(&metrics, has_dev.then_some(&dev_metrics));
    Ok((history, metrics))
}

fn evaluate_estimator_run(config: &Config) -> Result<(TrainingHistory, Metrics)> {
    let base = model_base(config)?;
    let manifest = load_features(base)?;
    let estimator: NaiveBayes = load_estimator(base, "naive-bayes")?;

    let mut dataset = load_test_dataset(config, &manifest)?;
    let features = manifest.vectorizer.transform(&Dataset::tokens(&dataset.test))?;
    let labels = dataset.labels.encode_all(&dataset.test)?;
    let (mut metrics, _) = build_metrics(&config.metrics)?;

    let docs: &mut [Document] = &mut dataset.test;
    eval_estimator(&estimator, &features, &labels, &mut metrics, Some(docs))?;
    info!("Test {}", metrics.postfix());

    write_run_predictions(config, &dataset)?;
    Ok((TrainingHistory::from_metrics(&metrics, None), metrics))
}
