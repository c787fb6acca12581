//! Single-task training loop
//!
//! One call trains a [`Classifier`] for up to `epochs` passes over a
//! [`BatchIterator`], scoring every epoch on the training predictions and,
//! when dev data is given, on the dev split. Early stopping watches the dev
//! early-stopping metric and restores the best parameters once it fires.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::progress::ProgressReporter;
use crate::training::config::TrainingConfig;
use crate::training::data::{Batch, BatchIterator};
use crate::training::early_stopping::EarlyStopping;
use crate::training::evaluate::eval_model;
use crate::training::metrics::{Metrics, Scores};
use crate::training::optimizers::{clip_grad_norm, TrainingOptimizer};

/// Per-epoch record of a training run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    /// Mean training loss per epoch
    pub train_loss: Vec<f64>,
    /// Mean dev loss per epoch
    pub dev_loss: Vec<f64>,
    /// Training scores per metric, one value per epoch
    pub train_scores: Scores,
    /// Dev scores per metric, one value per epoch
    pub dev_scores: Scores,
    /// Epochs actually run
    pub epochs_run: usize,
    /// Whether early stopping ended training
    pub stopped_early: bool,
    /// Zero-based epoch with the best dev score
    pub best_epoch: Option<usize>,
}

impl TrainingHistory {
    /// Collect losses and scores recorded in `train` and optionally `dev`
    pub fn from_metrics(train: &Metrics, dev: Option<&Metrics>) -> Self {
        let scores_of = |metrics: &Metrics| -> Scores {
            metrics
                .scores()
                .iter()
                .filter(|(key, _)| key.as_str() != metrics.loss_key())
                .map(|(key, values)| (key.clone(), values.clone()))
                .collect()
        };

        let train_loss = train.losses().to_vec();
        let epochs_run = train
            .list()
            .first()
            .and_then(|name| train.get(name))
            .map_or(train_loss.len(), <[f64]>::len);

        Self {
            train_loss,
            dev_loss: dev.map(|m| m.losses().to_vec()).unwrap_or_default(),
            train_scores: scores_of(train),
            dev_scores: dev.map(scores_of).unwrap_or_default(),
            epochs_run,
            stopped_early: false,
            best_epoch: None,
        }
    }

    /// Number of rows this history writes to a results file
    pub fn len(&self) -> usize {
        self.epochs_run
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.epochs_run == 0
    }
}

/// Result of one optimizer step
#[derive(Debug)]
pub(crate) struct StepOutput {
    /// Weighted mean batch loss
    pub loss: f64,
    /// Argmax predictions for the batch
    pub preds: Vec<u32>,
}

/// Forward, loss, backward, optional clipping and an optimizer step on one batch
pub(crate) fn train_step<M, L>(
    model: &M,
    optimizer: &mut TrainingOptimizer,
    loss_fn: &L,
    batch: &Batch,
    task_id: Option<usize>,
    loss_weight: f64,
    clip: Option<f64>,
) -> Result<StepOutput>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    let logits = model.forward(&batch.features, task_id)?;
    let mut loss = loss_fn(&logits, &batch.labels)?;
    if loss_weight != 1.0 {
        loss = loss.affine(loss_weight, 0.0)?;
    }

    let loss_value = loss.to_scalar::<f32>()? as f64;
    if !loss_value.is_finite() {
        return Err(Error::training(format!("Loss diverged to {loss_value}")));
    }

    let mut grads = loss.backward()?;
    if let Some(max_norm) = clip {
        clip_grad_norm(&mut grads, &model.var_map().all_vars(), max_norm)?;
    }
    optimizer.step(&grads)?;

    Ok(StepOutput {
        loss: loss_value,
        preds: logits.argmax(1)?.to_vec1::<u32>()?,
    })
}

struct EpochOutput {
    preds: Vec<u32>,
    labels: Vec<u32>,
    loss: f64,
}

fn run_epoch<M, L>(
    model: &M,
    optimizer: &mut TrainingOptimizer,
    loss_fn: &L,
    batches: &BatchIterator,
    clip: Option<f64>,
    progress: &ProgressReporter,
) -> Result<EpochOutput>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    let bar = progress.child("Batch", batches.num_batches() as u64);
    let mut out = EpochOutput {
        preds: Vec::with_capacity(batches.len()),
        labels: Vec::with_capacity(batches.len()),
        loss: 0.0,
    };
    let mut loss_sum = 0.0;

    for batch in batches {
        let batch = batch?;
        let step = train_step(model, optimizer, loss_fn, &batch, None, 1.0, clip)?;
        loss_sum += step.loss * batch.len as f64;
        out.preds.extend(step.preds);
        out.labels.extend(batch.label_vec()?);

        bar.set_postfix(&[
            ("batch_loss", format!("{:.4}", step.loss)),
            ("epoch_loss", format!("{:.4}", loss_sum / out.labels.len() as f64)),
        ]);
        bar.inc();
    }
    bar.finish();

    out.loss = if out.labels.is_empty() {
        f64::NAN
    } else {
        loss_sum / out.labels.len() as f64
    };
    Ok(out)
}

/// Train a single-task model
///
/// `progress` advances once per epoch; a nested bar tracks batches. With
/// `dev` data and a non-zero patience the best dev state is restored when
/// training ends, whether or not early stopping fired.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(model = model.name(), epochs = config.epochs))]
pub fn train_singletask_model<M, L>(
    model: &M,
    optimizer: &mut TrainingOptimizer,
    loss_fn: &L,
    batches: &mut BatchIterator,
    metrics: &mut Metrics,
    dev: Option<(&BatchIterator, &mut Metrics)>,
    config: &TrainingConfig,
    progress: &ProgressReporter,
) -> Result<TrainingHistory>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    config.validate()?;
    let (dev_batches, mut dev_metrics) = match dev {
        Some((batches, metrics)) => (Some(batches), Some(metrics)),
        None => (None, None),
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut early_stopping = (config.patience > 0 && dev_batches.is_some())
        .then(|| EarlyStopping::new(config.save_path.clone(), config.patience, config.low_is_good));
    let mut stopped_early = false;

    info!(
        "Training {} for up to {} epochs on {} examples",
        model.name(),
        config.epochs,
        batches.len()
    );

    for epoch in 0..config.epochs {
        if config.shuffle {
            batches.shuffle(&mut rng)?;
        }

        let epoch_out = run_epoch(model, optimizer, loss_fn, batches, config.clip, progress)?;
        metrics.compute(&epoch_out.labels, &epoch_out.preds)?;
        metrics.loss(epoch_out.loss);

        let mut postfix = vec![("loss", format!("{:.4}", epoch_out.loss))];
        let (name, value) = metrics.display();
        postfix.push((name, value.map_or("n/a".to_string(), |v| format!("{v:.4}"))));

        if let (Some(dev_batches), Some(dev_metrics)) = (dev_batches, dev_metrics.as_deref_mut()) {
            let evaluation = eval_model(model, dev_batches, loss_fn, dev_metrics, None)?;
            postfix.push(("dev_loss", format!("{:.4}", evaluation.loss)));
            postfix.push(("dev_score", format!("{:.4}", dev_metrics.display().1.unwrap_or(f64::NAN))));

            if let Some(es) = early_stopping.as_mut() {
                let score = dev_metrics.early_stopping().unwrap_or(f64::NAN);
                stopped_early = es.check(model, score)?;
            }
        }

        debug!("Epoch {}/{}: loss {:.4}", epoch + 1, config.epochs, epoch_out.loss);
        progress.set_postfix(&postfix);
        progress.inc();
        if stopped_early {
            info!("Stopped early after epoch {}", epoch + 1);
            break;
        }
    }

    let mut history = TrainingHistory::from_metrics(metrics, dev_metrics.as_deref());
    history.stopped_early = stopped_early;
    if let Some(es) = &early_stopping {
        if es.restore_best(model)? {
            debug!("Restored parameters from epoch {:?}", es.best_epoch());
        }
        history.best_epoch = es.best_epoch();
    }
    Ok(history)
}
