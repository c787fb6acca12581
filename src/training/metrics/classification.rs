//! Classification scores on hard labels
//!
//! Multi-class precision, recall and F1 are averaged over classes weighted by
//! their support in the gold labels. AUC on hard predictions reduces to the
//! area under a single-threshold ROC curve per class, averaged the same way.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Per-class confusion counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ClassCounts {
    true_positives: usize,
    false_positives: usize,
    false_negatives: usize,
    true_negatives: usize,
}

impl ClassCounts {
    fn support(&self) -> usize {
        self.true_positives + self.false_negatives
    }

    fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    fn auc(&self) -> f64 {
        let tpr = self.recall();
        let fpr = ratio(self.false_positives, self.false_positives + self.true_negatives);
        (1.0 + tpr - fpr) / 2.0
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn check_lengths(labels: &[u32], preds: &[u32]) -> Result<()> {
    if labels.len() != preds.len() {
        return Err(Error::invalid_input(format!(
            "Labels and predictions differ in length: {} vs {}",
            labels.len(),
            preds.len()
        )));
    }
    Ok(())
}

fn class_counts(labels: &[u32], preds: &[u32]) -> Vec<ClassCounts> {
    let classes: BTreeSet<u32> = labels.iter().chain(preds.iter()).copied().collect();
    classes
        .into_iter()
        .map(|class| {
            let mut counts = ClassCounts::default();
            for (&y, &p) in labels.iter().zip(preds) {
                match (y == class, p == class) {
                    (true, true) => counts.true_positives += 1,
                    (false, true) => counts.false_positives += 1,
                    (true, false) => counts.false_negatives += 1,
                    (false, false) => counts.true_negatives += 1,
                }
            }
            counts
        })
        .collect()
}

fn support_weighted(labels: &[u32], preds: &[u32], score: fn(&ClassCounts) -> f64) -> Result<f64> {
    check_lengths(labels, preds)?;
    if labels.is_empty() {
        return Ok(f64::NAN);
    }
    let counts = class_counts(labels, preds);
    let total = labels.len() as f64;
    Ok(counts
        .iter()
        .map(|c| score(c) * c.support() as f64 / total)
        .sum())
}

/// Fraction of predictions equal to the gold label
pub fn accuracy(labels: &[u32], preds: &[u32]) -> Result<f64> {
    check_lengths(labels, preds)?;
    if labels.is_empty() {
        return Ok(f64::NAN);
    }
    let correct = labels.iter().zip(preds).filter(|(y, p)| y == p).count();
    Ok(correct as f64 / labels.len() as f64)
}

/// Support-weighted precision
pub fn precision(labels: &[u32], preds: &[u32]) -> Result<f64> {
    support_weighted(labels, preds, ClassCounts::precision)
}

/// Support-weighted recall
pub fn recall(labels: &[u32], preds: &[u32]) -> Result<f64> {
    support_weighted(labels, preds, ClassCounts::recall)
}

/// Support-weighted F1
pub fn f1_score(labels: &[u32], preds: &[u32]) -> Result<f64> {
    support_weighted(labels, preds, ClassCounts::f1)
}

/// Support-weighted one-vs-rest AUC of hard predictions
pub fn roc_auc(labels: &[u32], preds: &[u32]) -> Result<f64> {
    support_weighted(labels, preds, ClassCounts::auc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accuracy() {
        assert_relative_eq!(accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]).unwrap(), 0.75);
        assert!(accuracy(&[], &[]).unwrap().is_nan());
        assert!(accuracy(&[0], &[0, 1]).is_err());
    }

    #[test]
    fn test_binary_weighted_scores() {
        // class 0: tp=2 fp=1 fn=0; class 1: tp=1 fp=0 fn=1
        let labels = [0, 0, 1, 1];
        let preds = [0, 0, 0, 1];

        let p0 = 2.0 / 3.0;
        let p1 = 1.0;
        assert_relative_eq!(precision(&labels, &preds).unwrap(), 0.5 * p0 + 0.5 * p1, epsilon = 1e-12);

        let r0 = 1.0;
        let r1 = 0.5;
        assert_relative_eq!(recall(&labels, &preds).unwrap(), 0.5 * r0 + 0.5 * r1, epsilon = 1e-12);

        let f0 = 2.0 * p0 * r0 / (p0 + r0);
        let f1 = 2.0 * p1 * r1 / (p1 + r1);
        assert_relative_eq!(f1_score(&labels, &preds).unwrap(), 0.5 * f0 + 0.5 * f1, epsilon = 1e-12);
    }

    #[test]
    fn test_perfect_predictions() {
        let labels = [0, 1, 2, 2];
        assert_relative_eq!(f1_score(&labels, &labels).unwrap(), 1.0);
        assert_relative_eq!(roc_auc(&labels, &labels).unwrap(), 1.0);
    }

    #[test]
    fn test_class_never_predicted_scores_zero() {
        let labels = [1, 1];
        let preds = [0, 0];
        assert_relative_eq!(precision(&labels, &preds).unwrap(), 0.0);
        assert_relative_eq!(f1_score(&labels, &preds).unwrap(), 0.0);
    }
}
