//! Multi-task training loop
//!
//! Each optimizer step samples one task according to the dataset weights,
//! draws that task's next batch and trains the matching output head with the
//! task's loss weight. Early stopping and training scores follow the dev task.

use candle_core::Tensor;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::progress::ProgressReporter;
use crate::training::config::MtlConfig;
use crate::training::data::BatchIterator;
use crate::training::early_stopping::EarlyStopping;
use crate::training::evaluate::eval_model;
use crate::training::metrics::Metrics;
use crate::training::optimizers::TrainingOptimizer;
use crate::training::trainer::{train_step, TrainingHistory};

/// Weighted random choice of the task to train on next
#[derive(Debug, Clone)]
pub struct TaskSampler {
    dist: WeightedIndex<f64>,
    num_tasks: usize,
}

impl TaskSampler {
    /// Sample task `i` with probability proportional to `weights[i]`
    pub fn new(weights: &[f64]) -> Result<Self> {
        let dist = WeightedIndex::new(weights)
            .map_err(|e| Error::config(format!("Invalid task sampling weights {weights:?}: {e}")))?;
        Ok(Self {
            dist,
            num_tasks: weights.len(),
        })
    }

    /// Draw a task id
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.dist.sample(rng)
    }

    /// Number of tasks
    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }
}

struct MtlEpoch {
    loss: f64,
    dev_task_preds: Vec<u32>,
    dev_task_labels: Vec<u32>,
    task_counts: Vec<usize>,
}

#[allow(clippy::too_many_arguments)]
fn run_mtl_epoch<M, L>(
    model: &M,
    optimizer: &mut TrainingOptimizer,
    loss_fn: &L,
    tasks: &mut [BatchIterator],
    sampler: &TaskSampler,
    loss_weights: &[f64],
    config: &MtlConfig,
    batch_count: usize,
    rng: &mut StdRng,
    progress: &ProgressReporter,
) -> Result<MtlEpoch>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    let bar = progress.child("Batch", batch_count as u64);
    let mut epoch = MtlEpoch {
        loss: f64::NAN,
        dev_task_preds: Vec::new(),
        dev_task_labels: Vec::new(),
        task_counts: vec![0; tasks.len()],
    };
    let mut loss_sum = 0.0;
    let mut label_count = 0usize;

    for _ in 0..batch_count {
        let task_id = sampler.sample(rng);
        let batch = tasks[task_id].next_cycled(rng, config.training.shuffle)?;
        let step = train_step(
            model,
            optimizer,
            loss_fn,
            &batch,
            Some(task_id),
            loss_weights[task_id],
            config.training.clip,
        )?;

        loss_sum += step.loss * batch.len as f64;
        label_count += batch.len;
        epoch.task_counts[task_id] += 1;
        if task_id == config.dev_task_id {
            epoch.dev_task_labels.extend(batch.label_vec()?);
            epoch.dev_task_preds.extend(step.preds);
        }

        bar.set_postfix(&[
            ("batch_loss", format!("{:.4}", step.loss)),
            ("epoch_loss", format!("{:.4}", loss_sum / label_count as f64)),
            ("task", task_id.to_string()),
        ]);
        bar.inc();
    }
    bar.finish();

    if label_count > 0 {
        epoch.loss = loss_sum / label_count as f64;
    }
    Ok(epoch)
}

/// Train a multi-task model
///
/// `tasks[i]` holds the training batches of task `i`, which is also the
/// output head it trains. Training scores are computed on the predictions made
/// for `dev_task_id` and are NaN for epochs that never sampled it. `dev` is
/// scored on the dev task's head.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(model = model.name(), tasks = tasks.len(), epochs = config.training.epochs))]
pub fn train_mtl_model<M, L>(
    model: &M,
    optimizer: &mut TrainingOptimizer,
    loss_fn: &L,
    tasks: &mut [BatchIterator],
    metrics: &mut Metrics,
    dev: Option<(&BatchIterator, &mut Metrics)>,
    config: &MtlConfig,
    progress: &ProgressReporter,
) -> Result<TrainingHistory>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    config.validate(tasks.len())?;
    if tasks.len() > model.num_tasks() {
        return Err(Error::invalid_input(format!(
            "Model has {} output heads but {} tasks were given",
            model.num_tasks(),
            tasks.len()
        )));
    }

    let (loss_weights, dataset_weights) = config.resolve_weights(tasks.len())?;
    let sampler = TaskSampler::new(&dataset_weights)?;
    let batch_count = config
        .batches_per_epoch
        .unwrap_or_else(|| tasks.iter().map(BatchIterator::num_batches).sum());

    let mut rng = StdRng::seed_from_u64(config.training.seed);
    if config.training.shuffle {
        for task in tasks.iter_mut() {
            task.shuffle(&mut rng)?;
        }
    }

    let (dev_batches, mut dev_metrics) = match dev {
        Some((batches, metrics)) => (Some(batches), Some(metrics)),
        None => (None, None),
    };
    let mut early_stopping = (config.training.patience > 0 && dev_batches.is_some()).then(|| {
        EarlyStopping::new(
            config.training.save_path.clone(),
            config.training.patience,
            config.training.low_is_good,
        )
    });
    let mut stopped_early = false;

    info!(
        "Training {} on {} tasks, {} batches per epoch, dataset weights {:?}",
        model.name(),
        tasks.len(),
        batch_count,
        dataset_weights
    );

    for epoch in 0..config.training.epochs {
        let out = run_mtl_epoch(
            model,
            optimizer,
            loss_fn,
            tasks,
            &sampler,
            &loss_weights,
            config,
            batch_count,
            &mut rng,
            progress,
        )?;
        debug!("Epoch {} task sample counts {:?}", epoch + 1, out.task_counts);

        if out.dev_task_labels.is_empty() {
            debug!("Task {} not sampled in epoch {}", config.dev_task_id, epoch + 1);
            metrics.skip();
        } else {
            metrics.compute(&out.dev_task_labels, &out.dev_task_preds)?;
        }
        metrics.loss(out.loss);

        let mut postfix = vec![("loss", format!("{:.4}", out.loss))];
        if let (Some(dev_batches), Some(dev_metrics)) = (dev_batches, dev_metrics.as_deref_mut()) {
            let evaluation = eval_model(model, dev_batches, loss_fn, dev_metrics, Some(config.dev_task_id))?;
            postfix.push(("dev_loss", format!("{:.4}", evaluation.loss)));
            postfix.push(("dev_score", format!("{:.4}", dev_metrics.display().1.unwrap_or(f64::NAN))));

            if let Some(es) = early_stopping.as_mut() {
                let score = dev_metrics.early_stopping().unwrap_or(f64::NAN);
                if es.check(model, score)? {
                    stopped_early = true;
                }
            }
        }

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
        es.restore_best(model)?;
        history.best_epoch = es.best_epoch();
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_follows_weights() {
        let sampler = TaskSampler::new(&[0.8, 0.2, 0.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut counts = [0usize; 3];
        for _ in 0..2000 {
            counts[sampler.sample(&mut rng)] += 1;
        }
        assert_eq!(counts[2], 0);
        assert!(counts[0] > counts[1] * 2);
        assert_eq!(sampler.num_tasks(), 3);
    }

    #[test]
    fn test_sampler_rejects_zero_weights() {
        assert!(TaskSampler::new(&[0.0, 0.0]).is_err());
        assert!(TaskSampler::new(&[]).is_err());
    }
}
