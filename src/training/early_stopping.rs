//! Early stopping on a monitored dev score
//!
//! Each call to [`EarlyStopping::check`] corresponds to one epoch. On
//! improvement the model parameters are snapshotted (and written to disk when
//! a save path is set) so the best model can be restored once training stops.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::model::{Classifier, ModelState};

/// Monitors a score and signals when it has stopped improving
#[derive(Debug)]
pub struct EarlyStopping {
    save_path: Option<PathBuf>,
    patience: usize,
    low_is_good: bool,
    best_score: Option<f64>,
    best_epoch: Option<usize>,
    epochs_without_improvement: usize,
    epoch: usize,
    best_state: Option<ModelState>,
}

impl EarlyStopping {
    /// Stop after `patience` epochs without improvement
    ///
    /// With `low_is_good` a lower score counts as better (e.g. a loss).
    pub fn new(save_path: Option<PathBuf>, patience: usize, low_is_good: bool) -> Self {
        Self {
            save_path,
            patience,
            low_is_good,
            best_score: None,
            best_epoch: None,
            epochs_without_improvement: 0,
            epoch: 0,
            best_state: None,
        }
    }

    fn improves(&self, score: f64) -> bool {
        if score.is_nan() {
            return false;
        }
        match self.best_score {
            None => true,
            Some(best) if self.low_is_good => score < best,
            Some(best) => score > best,
        }
    }

    /// Record this epoch's score; returns `true` when training should stop
    pub fn check<M: Classifier + ?Sized>(&mut self, model: &M, score: f64) -> Result<bool> {
        let epoch = self.epoch;
        self.epoch += 1;

        if self.improves(score) {
            debug!("Score improved to {:.4} at epoch {}", score, epoch);
            let state = ModelState::capture(model.var_map())?;
            if let Some(path) = &self.save_path {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                state.save(path)?;
            }
            self.best_state = Some(state);
            self.best_score = Some(score);
            self.best_epoch = Some(epoch);
            self.epochs_without_improvement = 0;
            return Ok(false);
        }

        self.epochs_without_improvement += 1;
        let stop = self.epochs_without_improvement >= self.patience;
        if stop {
            info!(
                "Early stopping: no improvement for {} epochs (best score {:.4} at epoch {})",
                self.epochs_without_improvement,
                self.best_score.unwrap_or(f64::NAN),
                self.best_epoch.map_or(-1, |e| e as i64)
            );
        }
        Ok(stop)
    }

    /// Load the best snapshot back into `model`; returns whether one existed
    pub fn restore_best<M: Classifier + ?Sized>(&self, model: &M) -> Result<bool> {
        match &self.best_state {
            Some(state) => {
                state.restore(model.var_map())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Best score seen so far
    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    /// Zero-based epoch of the best score
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Snapshot of the best model
    pub fn best_state(&self) -> Option<&ModelState> {
        self.best_state.as_ref()
    }

    /// Consecutive epochs without improvement
    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    /// Where the best model is written, if anywhere
    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MlpClassifier, MlpConfig};
    use candle_core::Device;
    use tempfile::TempDir;

    fn model() -> MlpClassifier {
        let config = MlpConfig {
            input_dim: 3,
            hidden_dim: 4,
            output_dims: vec![2],
        };
        MlpClassifier::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_stops_after_patience() {
        let model = model();
        let mut es = EarlyStopping::new(None, 2, false);

        assert!(!es.check(&model, 0.5).unwrap());
        assert!(!es.check(&model, 0.6).unwrap());
        assert!(!es.check(&model, 0.6).unwrap());
        assert!(es.check(&model, 0.55).unwrap());

        assert_eq!(es.best_score(), Some(0.6));
        assert_eq!(es.best_epoch(), Some(1));
        assert_eq!(es.epochs_without_improvement(), 2);
    }

    #[test]
    fn test_low_is_good() {
        let model = model();
        let mut es = EarlyStopping::new(None, 1, true);
        assert!(!es.check(&model, 1.0).unwrap());
        assert!(!es.check(&model, 0.8).unwrap());
        assert!(es.check(&model, 0.9).unwrap());
        assert_eq!(es.best_score(), Some(0.8));
    }

    #[test]
    fn test_nan_never_improves() {
        let model = model();
        let mut es = EarlyStopping::new(None, 3, false);
        es.check(&model, f64::NAN).unwrap();
        assert!(es.best_score().is_none());
        assert!(es.best_state().is_none());
        assert!(!es.restore_best(&model).unwrap());
    }

    #[test]
    fn test_best_state_is_saved_and_restored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("best").join("model.safetensors");
        let model = model();
        let mut es = EarlyStopping::new(Some(path.clone()), 1, false);

        es.check(&model, 0.9).unwrap();
        assert!(path.exists());
        let best = es.best_state().unwrap().get("hidden.weight").unwrap().to_vec2::<f32>().unwrap();

        for var in model.var_map().all_vars() {
            var.set(&var.as_tensor().ones_like().unwrap()).unwrap();
        }
        assert!(es.restore_best(&model).unwrap());

        let restored = ModelState::capture(model.var_map()).unwrap();
        let restored = restored.get("hidden.weight").unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(best, restored);
    }
}
