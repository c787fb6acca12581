//! Tests for the multi-task training loop

use anyhow::Result;
use approx::assert_relative_eq;

use crate::model::{Classifier, ModelState};
use crate::progress::ProgressReporter;
use crate::training::config::{MtlConfig, TrainingConfig};
use crate::training::multitask::train_mtl_model;

use super::fixtures::{adamw, batches, loss_fn, metrics, model};

fn config(epochs: usize) -> MtlConfig {
    MtlConfig {
        training: TrainingConfig {
            epochs,
            batch_size: 8,
            patience: 0,
            progress: false,
            ..TrainingConfig::default()
        },
        ..MtlConfig::default()
    }
}

#[test]
fn test_trains_every_task_head() -> Result<()> {
    let model = model(vec![2, 3])?;
    let mut optimizer = adamw(&model, 0.05)?;
    let mut tasks = vec![batches(24, 2, 8)?, batches(30, 3, 8)?];
    let (mut train_metrics, _) = metrics("accuracy")?;

    let history = train_mtl_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut tasks,
        &mut train_metrics,
        None,
        &config(10),
        &ProgressReporter::hidden(),
    )?;

    assert_eq!(history.epochs_run, 10);
    assert_eq!(history.train_loss.len(), 10);
    assert!(history.train_loss.iter().all(|l| l.is_finite()));
    assert!(history.train_loss[9] < history.train_loss[0]);
    assert!(!history.stopped_early);
    Ok(())
}

#[test]
fn test_unsampled_dev_task_scores_nan() -> Result<()> {
    let model = model(vec![2, 3])?;
    let mut optimizer = adamw(&model, 0.01)?;
    let mut tasks = vec![batches(16, 2, 8)?, batches(16, 3, 8)?];
    let (mut train_metrics, _) = metrics("accuracy")?;
    let config = MtlConfig {
        dev_task_id: 0,
        dataset_weights: Some(vec![0.0, 1.0]),
        batches_per_epoch: Some(3),
        ..config(3)
    };

    let history = train_mtl_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut tasks,
        &mut train_metrics,
        None,
        &config,
        &ProgressReporter::hidden(),
    )?;

    assert_eq!(history.epochs_run, 3);
    assert!(history.train_scores["accuracy"].iter().all(|s| s.is_nan()));
    assert!(history.train_loss.iter().all(|l| l.is_finite()));
    Ok(())
}

#[test]
fn test_dev_scored_on_dev_task_head() -> Result<()> {
    let model = model(vec![3, 2])?;
    let mut optimizer = adamw(&model, 0.05)?;
    let mut tasks = vec![batches(18, 3, 6)?, batches(16, 2, 8)?];
    // Dev data has 2 classes, matching head 1
    let dev = batches(10, 2, 5)?;
    let (mut train_metrics, mut dev_metrics) = metrics("accuracy")?;
    let config = MtlConfig {
        dev_task_id: 1,
        ..config(3)
    };

    let history = train_mtl_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut tasks,
        &mut train_metrics,
        Some((&dev, &mut dev_metrics)),
        &config,
        &ProgressReporter::hidden(),
    )?;

    assert_eq!(history.dev_loss.len(), 3);
    assert_eq!(history.dev_scores["accuracy"].len(), 3);
    Ok(())
}

#[test]
fn test_more_tasks_than_heads_is_rejected() -> Result<()> {
    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.01)?;
    let mut tasks = vec![batches(8, 2, 4)?, batches(8, 2, 4)?];
    let (mut train_metrics, _) = metrics("accuracy")?;

    let result = train_mtl_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut tasks,
        &mut train_metrics,
        None,
        &config(1),
        &ProgressReporter::hidden(),
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_mismatched_weights_are_rejected() -> Result<()> {
    let model = model(vec![2, 2])?;
    let mut optimizer = adamw(&model, 0.01)?;
    let mut tasks = vec![batches(8, 2, 4)?, batches(8, 2, 4)?];
    let (mut train_metrics, _) = metrics("accuracy")?;
    let config = MtlConfig {
        loss_weights: Some(vec![1.0]),
        ..config(1)
    };

    let result = train_mtl_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut tasks,
        &mut train_metrics,
        None,
        &config,
        &ProgressReporter::hidden(),
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_loss_weight_scales_task_loss() -> Result<()> {
    let model = model(vec![2])?;
    let initial = ModelState::capture(model.var_map())?;
    let weighted = |weight: f64| MtlConfig {
        loss_weights: Some(vec![weight]),
        batches_per_epoch: Some(1),
        training: TrainingConfig {
            shuffle: false,
            ..config(1).training
        },
        ..config(1)
    };

    let mut losses = Vec::new();
    for weight in [1.0, 3.0] {
        initial.restore(model.var_map())?;
        let mut optimizer = adamw(&model, 0.01)?;
        let mut tasks = vec![batches(16, 2, 8)?];
        let (mut train_metrics, _) = metrics("accuracy")?;
        let history = train_mtl_model(
            &model,
            &mut optimizer,
            &loss_fn,
            &mut tasks,
            &mut train_metrics,
            None,
            &weighted(weight),
            &ProgressReporter::hidden(),
        )?;
        losses.push(history.train_loss[0]);
    }

    assert_relative_eq!(losses[1], 3.0 * losses[0], max_relative = 1e-4);
    Ok(())
}
