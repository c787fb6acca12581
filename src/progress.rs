//! Progress bars for epoch and batch loops
//!
//! Visible reporters share one [`MultiProgress`] so nested batch bars are
//! drawn below their epoch bar instead of fighting over the same line.

use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Thin wrapper over an indicatif bar with a key=value postfix
pub struct ProgressReporter {
    bar: ProgressBar,
    multi: Option<Arc<MultiProgress>>,
}

impl ProgressReporter {
    /// A bar with a known number of steps, hidden when `visible` is false
    pub fn new(description: &str, total: u64, visible: bool) -> Self {
        if !visible {
            return Self::hidden();
        }
        let multi = Arc::new(MultiProgress::new());
        Self::attached(multi, description, total)
    }

    fn attached(multi: Arc<MultiProgress>, description: &str, total: u64) -> Self {
        let bar = multi.add(ProgressBar::new(total));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(description.to_string());
        Self {
            bar,
            multi: Some(multi),
        }
    }

    /// A bar that never draws
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            multi: None,
        }
    }

    /// Nested bar drawn under this one; hidden when this bar is hidden
    pub fn child(&self, description: &str, total: u64) -> Self {
        match &self.multi {
            Some(multi) => Self::attached(Arc::clone(multi), description, total),
            None => Self::hidden(),
        }
    }

    /// Replace the postfix with `key=value` pairs
    pub fn set_postfix(&self, fields: &[(&str, String)]) {
        let message = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.bar.set_message(message);
    }

    /// Advance by one step
    pub fn inc(&self) {
        self.bar.inc(1);
    }

    /// Finish and remove the bar
    pub fn finish(&self) {
        self.bar.finish_and_clear();
        if let Some(multi) = &self.multi {
            multi.remove(&self.bar);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_reporter_accepts_updates() {
        let progress = ProgressReporter::new("Training epochs", 3, false);
        progress.set_postfix(&[("loss", "0.1234".to_string()), ("accuracy", "0.9".to_string())]);
        progress.inc();
        let child = progress.child("Batch", 10);
        assert!(child.multi.is_none());
        child.inc();
        child.finish();
        progress.finish();
    }

    #[test]
    fn test_child_shares_parent_multi_progress() {
        let progress = ProgressReporter::new("Training epochs", 2, true);
        let child = progress.child("Batch", 5);

        let (Some(parent_multi), Some(child_multi)) = (&progress.multi, &child.multi) else {
            panic!("visible reporters must be attached to a MultiProgress");
        };
        assert!(Arc::ptr_eq(parent_multi, child_multi));

        child.inc();
        child.inc();
        progress.inc();
        assert_eq!(child.bar.position(), 2);
        assert_eq!(progress.bar.position(), 1);
        child.finish();
        progress.finish();
    }
}
