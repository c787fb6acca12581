//! Tests for the single-task training loop

use anyhow::Result;

use crate::progress::ProgressReporter;
use crate::training::config::TrainingConfig;
use crate::training::evaluate::eval_model;
use crate::training::trainer::train_singletask_model;

use super::fixtures::{adamw, batches, flipped_batches, loss_fn, metrics, model};

fn config(epochs: usize, patience: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size: 8,
        patience,
        progress: false,
        ..TrainingConfig::default()
    }
}

#[test]
fn test_loss_decreases_on_separable_data() -> Result<()> {
    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.05)?;
    let mut train = batches(40, 2, 8)?;
    let (mut train_metrics, _) = metrics("accuracy")?;

    let history = train_singletask_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut train,
        &mut train_metrics,
        None,
        &config(15, 0),
        &ProgressReporter::hidden(),
    )?;

    assert_eq!(history.epochs_run, 15);
    assert_eq!(history.train_loss.len(), 15);
    assert!(history.train_loss[14] < history.train_loss[0]);
    assert!(history.train_scores["accuracy"][14] >= 0.9);
    assert!(history.dev_loss.is_empty());
    assert!(history.dev_scores.is_empty());
    assert!(!history.stopped_early);
    assert_eq!(history.best_epoch, None);
    Ok(())
}

#[test]
fn test_history_lengths_match_epochs_with_dev() -> Result<()> {
    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.01)?;
    let mut train = batches(24, 2, 8)?;
    let dev = batches(10, 2, 4)?;
    let (mut train_metrics, mut dev_metrics) = metrics("f1")?;

    let history = train_singletask_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut train,
        &mut train_metrics,
        Some((&dev, &mut dev_metrics)),
        &config(4, 0),
        &ProgressReporter::hidden(),
    )?;

    assert_eq!(history.epochs_run, 4);
    assert_eq!(history.dev_loss.len(), 4);
    assert_eq!(history.dev_scores["f1-score"].len(), 4);
    assert_eq!(history.train_scores["accuracy"].len(), 4);
    assert!(!history.train_scores.contains_key("loss"));
    assert!(!history.dev_scores.contains_key("dev_loss"));
    Ok(())
}

#[test]
fn test_early_stopping_stops_and_restores_best() -> Result<()> {
    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.05)?;
    let mut train = batches(40, 2, 8)?;
    // Learning the training labels makes the dev score worse
    let dev = flipped_batches(40, 8)?;
    let (mut train_metrics, mut dev_metrics) = metrics("accuracy")?;

    let history = train_singletask_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut train,
        &mut train_metrics,
        Some((&dev, &mut dev_metrics)),
        &config(30, 2),
        &ProgressReporter::hidden(),
    )?;

    assert!(history.stopped_early);
    assert!(history.epochs_run < 30);
    let best = history.best_epoch.expect("best epoch recorded");
    let dev_accuracy = &history.dev_scores["accuracy"];
    let best_score = dev_accuracy.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(dev_accuracy[best], best_score);

    let (_, mut check_metrics) = metrics("accuracy")?;
    eval_model(&model, &dev, &loss_fn, &mut check_metrics, None)?;
    assert_eq!(check_metrics.last("accuracy"), Some(dev_accuracy[best]));
    Ok(())
}

#[test]
fn test_best_model_is_written_to_save_path() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let save_path = dir.path().join("best").join("model.safetensors");

    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.01)?;
    let mut train = batches(16, 2, 8)?;
    let dev = batches(8, 2, 8)?;
    let (mut train_metrics, mut dev_metrics) = metrics("accuracy")?;
    let config = TrainingConfig {
        save_path: Some(save_path.clone()),
        ..config(2, 5)
    };

    train_singletask_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut train,
        &mut train_metrics,
        Some((&dev, &mut dev_metrics)),
        &config,
        &ProgressReporter::hidden(),
    )?;

    assert!(save_path.exists());
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() -> Result<()> {
    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.01)?;
    let mut train = batches(8, 2, 4)?;
    let (mut train_metrics, _) = metrics("accuracy")?;

    let result = train_singletask_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut train,
        &mut train_metrics,
        None,
        &config(0, 0),
        &ProgressReporter::hidden(),
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_best_state_restored_when_patience_never_runs_out() -> Result<()> {
    let model = model(vec![2])?;
    let mut optimizer = adamw(&model, 0.05)?;
    let mut train = batches(40, 2, 8)?;
    let dev = flipped_batches(40, 8)?;
    let (mut train_metrics, mut dev_metrics) = metrics("accuracy")?;

    let history = train_singletask_model(
        &model,
        &mut optimizer,
        &loss_fn,
        &mut train,
        &mut train_metrics,
        Some((&dev, &mut dev_metrics)),
        &config(12, 100),
        &ProgressReporter::hidden(),
    )?;

    assert!(!history.stopped_early);
    assert_eq!(history.epochs_run, 12);
    let best = history.best_epoch.expect("best epoch recorded");
    let last = history.epochs_run - 1;
    assert!(best < last);
    assert_ne!(history.dev_loss[best], history.dev_loss[last]);

    // The parameters in place after training are those of the best epoch
    let (_, mut check_metrics) = metrics("accuracy")?;
    let evaluation = eval_model(&model, &dev, &loss_fn, &mut check_metrics, None)?;
    assert_eq!(evaluation.loss, history.dev_loss[best]);
    assert_eq!(check_metrics.last("accuracy"), Some(history.dev_scores["accuracy"][best]));
    Ok(())
}
