//! Batch construction and iteration for training and evaluation

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, instrument};

use super::{Dataset, Document};
use crate::error::{Error, Result};
use crate::vectorize::Vectorizer;

/// A batch of dense features and class ids
#[derive(Debug, Clone)]
pub struct Batch {
    /// Features [batch_size, num_features], f32
    pub features: Tensor,
    /// Class ids [batch_size], u32
    pub labels: Tensor,
    /// Number of examples in the batch
    pub len: usize,
}

impl Batch {
    /// Build a batch from rows of features and their labels
    pub fn from_rows(rows: &[&[f32]], labels: &[u32], device: &Device) -> Result<Self> {
        if rows.len() != labels.len() {
            return Err(Error::invalid_input(format!(
                "Batch has {} feature rows but {} labels",
                rows.len(),
                labels.len()
            )));
        }
        if rows.is_empty() {
            return Err(Error::invalid_input("Cannot build an empty batch"));
        }

        let width = rows[0].len();
        if let Some(bad) = rows.iter().position(|row| row.len() != width) {
            return Err(Error::invalid_input(format!(
                "Inconsistent feature width at row {}: expected {}, got {}",
                bad,
                width,
                rows[bad].len()
            )));
        }

        let flat: Vec<f32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        let features = Tensor::from_vec(flat, (rows.len(), width), device)?;
        let labels = Tensor::from_slice(labels, rows.len(), device)?;

        Ok(Self {
            features,
            labels,
            len: rows.len(),
        })
    }

    /// Class ids as a host vector
    pub fn label_vec(&self) -> Result<Vec<u32>> {
        Ok(self.labels.to_vec1::<u32>()?)
    }
}

/// Batched view over one split of a dataset
///
/// Examples stay on the host as dense rows; a [`Batch`] is assembled on the
/// device only when the iteration reaches it. Shuffling permutes the example
/// order and never copies feature data.
#[derive(Debug, Clone)]
pub struct BatchIterator {
    features: Vec<Vec<f32>>,
    labels: Vec<u32>,
    batch_size: usize,
    device: Device,
    order: Vec<usize>,
    cursor: usize,
}

impl BatchIterator {
    /// Chunk `features`/`labels` into batches of `batch_size`
    pub fn new(
        features: Vec<Vec<f32>>,
        labels: Vec<u32>,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("Batch size must be > 0"));
        }
        if features.len() != labels.len() {
            return Err(Error::invalid_input(format!(
                "Got {} feature rows but {} labels",
                features.len(),
                labels.len()
            )));
        }
        if features.is_empty() {
            return Err(Error::data("Cannot batch an empty set of examples"));
        }
        let width = features[0].len();
        if let Some(bad) = features.iter().position(|row| row.len() != width) {
            return Err(Error::invalid_input(format!(
                "Inconsistent feature width at row {}: expected {}, got {}",
                bad,
                width,
                features[bad].len()
            )));
        }

        debug!(
            "Batching {} examples into batches of {}",
            features.len(),
            batch_size
        );
        Ok(Self {
            order: (0..features.len()).collect(),
            features,
            labels,
            batch_size,
            device: device.clone(),
            cursor: 0,
        })
    }

    /// Build batch `index` of the current order on the device
    pub fn batch(&self, index: usize) -> Result<Batch> {
        let start = index * self.batch_size;
        if start >= self.order.len() {
            return Err(Error::invalid_input(format!(
                "Batch {} out of range for {} batches",
                index,
                self.num_batches()
            )));
        }
        let chunk = &self.order[start..(start + self.batch_size).min(self.order.len())];
        let rows: Vec<&[f32]> = chunk.iter().map(|&i| self.features[i].as_slice()).collect();
        let labels: Vec<u32> = chunk.iter().map(|&i| self.labels[i]).collect();
        Batch::from_rows(&rows, &labels, &self.device)
    }

    /// Permute the examples and restart the cycling cursor
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        self.order.shuffle(rng);
        self.cursor = 0;
        Ok(())
    }

    /// Batches of one pass, in the current order
    pub fn iter(&self) -> Batches<'_> {
        Batches {
            source: self,
            next: 0,
        }
    }

    /// Next batch of an endless cycle over the data
    ///
    /// When a pass is exhausted the cursor restarts, reshuffling first if
    /// `shuffle` is set.
    pub fn next_cycled<R: Rng + ?Sized>(&mut self, rng: &mut R, shuffle: bool) -> Result<Batch> {
        if self.cursor >= self.num_batches() {
            if shuffle {
                self.shuffle(rng)?;
            }
            self.cursor = 0;
        }
        let batch = self.batch(self.cursor)?;
        self.cursor += 1;
        Ok(batch)
    }

    /// Number of batches in one pass
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether there are no examples
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Configured batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Width of the feature rows
    pub fn num_features(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }

    /// Labels in the current example order
    pub fn labels(&self) -> Vec<u32> {
        self.order.iter().map(|&i| self.labels[i]).collect()
    }
}

/// One pass over a [`BatchIterator`], building each batch as it is reached
#[derive(Debug)]
pub struct Batches<'a> {
    source: &'a BatchIterator,
    next: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.source.num_batches() {
            return None;
        }
        let batch = self.source.batch(self.next);
        self.next += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.source.num_batches().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

impl<'a> IntoIterator for &'a BatchIterator {
    type Item = Result<Batch>;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Encode labels, vectorize `docs` and batch them
///
/// The vectorizer must already be fitted; labels unknown to the dataset's
/// label index are an error.
#[instrument(skip_all, fields(dataset = %dataset.name, docs = docs.len()))]
pub fn process_and_batch<V: Vectorizer + ?Sized>(
    dataset: &Dataset,
    docs: &[Document],
    vectorizer: &V,
    batch_size: usize,
    device: &Device,
) -> Result<BatchIterator> {
    let labels = dataset.labels.encode_all(docs)?;
    let features = vectorizer.transform(&Dataset::tokens(docs))?;
    BatchIterator::new(features, labels, batch_size, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy_iterator(n: usize, batch_size: usize) -> BatchIterator {
        let features = (0..n).map(|i| vec![i as f32, 1.0]).collect();
        let labels = (0..n as u32).map(|i| i % 2).collect();
        BatchIterator::new(features, labels, batch_size, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_batches_cover_all_examples() {
        let iterator = toy_iterator(10, 4);
        assert_eq!(iterator.num_batches(), 3);
        let batches: Vec<Batch> = iterator.iter().collect::<Result<_>>().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(batches[0].features.dims(), &[4, 2]);
        assert_eq!(iterator.iter().len(), 3);
        assert!(iterator.batch(3).is_err());
    }

    #[test]
    fn test_shuffle_keeps_feature_label_pairs() {
        let mut iterator = toy_iterator(9, 3);
        let mut rng = StdRng::seed_from_u64(7);
        iterator.shuffle(&mut rng).unwrap();

        let mut seen = Vec::new();
        for batch in &iterator {
            let batch = batch.unwrap();
            let rows = batch.features.to_vec2::<f32>().unwrap();
            let labels = batch.label_vec().unwrap();
            for (row, label) in rows.iter().zip(labels) {
                assert_eq!(row[0] as u32 % 2, label);
                seen.push(row[0] as usize);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_next_cycled_wraps_around() {
        let mut iterator = toy_iterator(4, 2);
        let mut rng = StdRng::seed_from_u64(0);

        let first = iterator.next_cycled(&mut rng, false).unwrap().label_vec().unwrap();
        let second = iterator.next_cycled(&mut rng, false).unwrap().label_vec().unwrap();
        let third = iterator.next_cycled(&mut rng, false).unwrap().label_vec().unwrap();

        assert_ne!(first.len(), 0);
        assert_eq!(second.len(), 2);
        assert_eq!(first, third);
    }

    #[test]
    fn test_next_cycled_reshuffles_at_end_of_pass() {
        let mut iterator = toy_iterator(64, 64);
        let mut rng = StdRng::seed_from_u64(3);

        let first_pass = iterator.next_cycled(&mut rng, true).unwrap();
        let first_rows = first_pass.features.to_vec2::<f32>().unwrap();
        let ids: Vec<usize> = first_rows.iter().map(|row| row[0] as usize).collect();
        assert_eq!(ids, (0..64).collect::<Vec<_>>());

        let second_pass = iterator.next_cycled(&mut rng, true).unwrap();
        let second_rows = second_pass.features.to_vec2::<f32>().unwrap();
        let mut reshuffled: Vec<usize> = second_rows.iter().map(|row| row[0] as usize).collect();
        assert_ne!(reshuffled, ids);

        reshuffled.sort_unstable();
        assert_eq!(reshuffled, ids);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(BatchIterator::new(vec![vec![1.0]], vec![0], 0, &Device::Cpu).is_err());
        assert!(BatchIterator::new(vec![vec![1.0]], vec![], 1, &Device::Cpu).is_err());
        assert!(BatchIterator::new(vec![], vec![], 1, &Device::Cpu).is_err());
        assert!(
            BatchIterator::new(vec![vec![1.0], vec![1.0, 2.0]], vec![0, 1], 2, &Device::Cpu)
                .is_err()
        );
    }
}
