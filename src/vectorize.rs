//! Bag-of-words vectorizers turning token lists into dense feature rows

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Maps tokenised documents to fixed-width feature vectors
pub trait Vectorizer {
    /// Learn the vocabulary (and any statistics) from training documents
    fn fit(&mut self, docs: &[&[String]]) -> Result<()>;

    /// Vectorize documents with the fitted vocabulary
    fn transform(&self, docs: &[&[String]]) -> Result<Vec<Vec<f32>>>;

    /// Fit on `docs` and vectorize them
    fn fit_transform(&mut self, docs: &[&[String]]) -> Result<Vec<Vec<f32>>> {
        self.fit(docs)?;
        self.transform(docs)
    }

    /// Human readable vectorizer name
    fn name(&self) -> &str;

    /// Whether `fit` has been called
    fn is_fitted(&self) -> bool;

    /// Width of the produced feature vectors
    fn dim(&self) -> usize;
}

/// Sorted token vocabulary shared by the count-based vectorizers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Vocabulary {
    index: BTreeMap<String, usize>,
}

impl Vocabulary {
    fn build(docs: &[&[String]]) -> Result<Self> {
        let tokens: BTreeSet<&String> = docs.iter().flat_map(|doc| doc.iter()).collect();
        if tokens.is_empty() {
            return Err(Error::data("Cannot fit a vectorizer on an empty vocabulary"));
        }
        let index = tokens
            .into_iter()
            .enumerate()
            .map(|(ix, token)| (token.clone(), ix))
            .collect();
        Ok(Self { index })
    }

    fn counts(&self, doc: &[String]) -> Vec<f32> {
        let mut row = vec![0.0; self.index.len()];
        for token in doc {
            if let Some(&ix) = self.index.get(token) {
                row[ix] += 1.0;
            }
        }
        row
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Raw token counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountVectorizer {
    vocabulary: Option<Vocabulary>,
}

impl CountVectorizer {
    /// Create an unfitted count vectorizer
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vectorizer for CountVectorizer {
    fn fit(&mut self, docs: &[&[String]]) -> Result<()> {
        let vocabulary = Vocabulary::build(docs)?;
        debug!("CountVectorizer fitted with {} features", vocabulary.len());
        self.vocabulary = Some(vocabulary);
        Ok(())
    }

    fn transform(&self, docs: &[&[String]]) -> Result<Vec<Vec<f32>>> {
        let vocabulary = self
            .vocabulary
            .as_ref()
            .ok_or_else(|| Error::invalid_input("CountVectorizer used before fit"))?;
        Ok(docs.iter().map(|doc| vocabulary.counts(doc)).collect())
    }

    fn name(&self) -> &str {
        "CountVectorizer"
    }

    fn is_fitted(&self) -> bool {
        self.vocabulary.is_some()
    }

    fn dim(&self) -> usize {
        self.vocabulary.as_ref().map_or(0, Vocabulary::len)
    }
}

/// Term counts scaled by smoothed inverse document frequency, l2-normalised per row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    vocabulary: Option<Vocabulary>,
    idf: Vec<f32>,
}

impl TfidfVectorizer {
    /// Create an unfitted tf-idf vectorizer
    pub fn new() -> Self {
        Self::default()
    }

    /// Learned inverse document frequencies in vocabulary order
    pub fn idf(&self) -> &[f32] {
        &self.idf
    }
}

impl Vectorizer for TfidfVectorizer {
    fn fit(&mut self, docs: &[&[String]]) -> Result<()> {
        let vocabulary = Vocabulary::build(docs)?;
        let mut document_frequency = vec![0usize; vocabulary.len()];
        for doc in docs {
            let unique: BTreeSet<&String> = doc.iter().collect();
            for token in unique {
                if let Some(&ix) = vocabulary.index.get(token) {
                    document_frequency[ix] += 1;
                }
            }
        }

        let n = docs.len() as f32;
        // idf(t) = ln((1 + n) / (1 + df(t))) + 1
        self.idf = document_frequency
            .into_iter()
            .map(|df| ((1.0 + n) / (1.0 + df as f32)).ln() + 1.0)
            .collect();
        debug!("TfidfVectorizer fitted with {} features", vocabulary.len());
        self.vocabulary = Some(vocabulary);
        Ok(())
    }

    fn transform(&self, docs: &[&[String]]) -> Result<Vec<Vec<f32>>> {
        let vocabulary = self
            .vocabulary
            .as_ref()
            .ok_or_else(|| Error::invalid_input("TfidfVectorizer used before fit"))?;

        Ok(docs
            .iter()
            .map(|doc| {
                let mut row = vocabulary.counts(doc);
                for (value, idf) in row.iter_mut().zip(&self.idf) {
                    *value *= idf;
                }
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    row.iter_mut().for_each(|v| *v /= norm);
                }
                row
            })
            .collect())
    }

    fn name(&self) -> &str {
        "TFIDF-Vectorizer"
    }

    fn is_fitted(&self) -> bool {
        self.vocabulary.is_some()
    }

    fn dim(&self) -> usize {
        self.vocabulary.as_ref().map_or(0, Vocabulary::len)
    }
}

/// Vectorizer chosen by name, serialisable alongside a trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TextVectorizer {
    /// Raw counts
    Count(CountVectorizer),
    /// Tf-idf weighting
    Tfidf(TfidfVectorizer),
}

impl TextVectorizer {
    fn inner(&self) -> &dyn Vectorizer {
        match self {
            TextVectorizer::Count(v) => v as &dyn Vectorizer,
            TextVectorizer::Tfidf(v) => v as &dyn Vectorizer,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Vectorizer {
        match self {
            TextVectorizer::Count(v) => v as &mut dyn Vectorizer,
            TextVectorizer::Tfidf(v) => v as &mut dyn Vectorizer,
        }
    }
}

impl Vectorizer for TextVectorizer {
    fn fit(&mut self, docs: &[&[String]]) -> Result<()> {
        self.inner_mut().fit(docs)
    }

    fn transform(&self, docs: &[&[String]]) -> Result<Vec<Vec<f32>>> {
        self.inner().transform(docs)
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn is_fitted(&self) -> bool {
        self.inner().is_fitted()
    }

    fn dim(&self) -> usize {
        self.inner().dim()
    }
}

/// Pick a vectorizer by name (`count` or `tfidf`), falling back to counts
pub fn select_vectorizer(name: &str) -> TextVectorizer {
    let name = name.to_lowercase();
    if name.contains("tfidf") {
        TextVectorizer::Tfidf(TfidfVectorizer::new())
    } else if name.contains("count") {
        TextVectorizer::Count(CountVectorizer::new())
    } else {
        warn!("Unknown vectorizer '{}', select from: count, tfidf. Defaulting to count.", name);
        TextVectorizer::Count(CountVectorizer::new())
    }
}
