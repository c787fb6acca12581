//! Prediction and evaluation for neural and classical models

use candle_core::Tensor;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::model::Classifier;
use crate::training::classical::Estimator;
use crate::training::data::{BatchIterator, Document};
use crate::training::metrics::Metrics;

/// Predictions over a batched split
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predictions {
    /// Predicted class ids, in batch order
    pub predicted: Vec<u32>,
    /// Gold class ids, in batch order
    pub labels: Vec<u32>,
    /// Loss summed over examples
    pub loss: f64,
}

/// Outcome of scoring a model on a split
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Mean per-example loss
    pub loss: f64,
    /// Predicted class ids
    pub predictions: Vec<u32>,
}

/// Run the model over every batch, collecting argmax predictions and loss
pub fn predict_model<M, L>(
    model: &M,
    batches: &BatchIterator,
    loss_fn: &L,
    task_id: Option<usize>,
) -> Result<Predictions>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    let mut out = Predictions::default();
    for batch in batches {
        let batch = batch?;
        let logits = model.forward(&batch.features, task_id)?.detach();
        let loss = loss_fn(&logits, &batch.labels)?.to_scalar::<f32>()? as f64;
        out.loss += loss * batch.len as f64;
        out.predicted.extend(logits.argmax(1)?.to_vec1::<u32>()?);
        out.labels.extend(batch.label_vec()?);
    }
    Ok(out)
}

/// Predict, score into `metrics` and record the mean loss
#[instrument(skip_all, fields(task_id = ?task_id))]
pub fn eval_model<M, L>(
    model: &M,
    batches: &BatchIterator,
    loss_fn: &L,
    metrics: &mut Metrics,
    task_id: Option<usize>,
) -> Result<Evaluation>
where
    M: Classifier + ?Sized,
    L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    let predictions = predict_model(model, batches, loss_fn, task_id)?;
    let loss = if predictions.labels.is_empty() {
        f64::NAN
    } else {
        predictions.loss / predictions.labels.len() as f64
    };

    metrics.compute(&predictions.labels, &predictions.predicted)?;
    metrics.loss(loss);
    debug!("Evaluation loss {:.4}, {}", loss, metrics.postfix());

    Ok(Evaluation {
        loss,
        predictions: predictions.predicted,
    })
}

/// Predict with a fitted classical estimator, scoring when gold labels are given
pub fn predict_estimator<E: Estimator + ?Sized>(
    estimator: &E,
    features: &[Vec<f32>],
    metrics: Option<&mut Metrics>,
    labels: Option<&[u32]>,
) -> Result<Vec<u32>> {
    let preds = estimator.predict(features)?;
    if let (Some(metrics), Some(labels)) = (metrics, labels) {
        metrics.compute(labels, &preds)?;
    }
    Ok(preds)
}

/// Score a fitted estimator and optionally store predictions on the documents
pub fn eval_estimator<E: Estimator + ?Sized>(
    estimator: &E,
    features: &[Vec<f32>],
    labels: &[u32],
    metrics: &mut Metrics,
    docs: Option<&mut [Document]>,
) -> Result<Vec<u32>> {
    let preds = predict_estimator(estimator, features, Some(metrics), Some(labels))?;
    if let Some(docs) = docs {
        assign_predictions(docs, &preds)?;
    }
    Ok(preds)
}

/// Store predicted class ids on the documents they were made for
pub fn assign_predictions(docs: &mut [Document], preds: &[u32]) -> Result<()> {
    if docs.len() != preds.len() {
        return Err(Error::invalid_input(format!(
            "Got {} predictions for {} documents",
            preds.len(),
            docs.len()
        )));
    }
    for (doc, &pred) in docs.iter_mut().zip(preds) {
        doc.pred = Some(pred);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_predictions() {
        let mut docs = vec![Document::new("a", "x"), Document::new("b", "y")];
        assign_predictions(&mut docs, &[1, 0]).unwrap();
        assert_eq!(docs[0].pred, Some(1));
        assert_eq!(docs[1].pred, Some(0));
        assert!(assign_predictions(&mut docs, &[1]).is_err());
    }
}
