//! Documents, label encoding and dataset containers
//!
//! A [`Dataset`] owns the train/dev/test splits of one corpus together with
//! the [`LabelIndex`] that maps string labels to the dense class ids used by
//! the models.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod batching;

pub use batching::{process_and_batch, Batch, BatchIterator, Batches};

/// A single labelled text document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Tokenised text
    pub tokens: Vec<String>,
    /// Gold label as it appears in the source data
    pub label: String,
    /// Additional fields extracted from the source record
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    /// Predicted class id, set after evaluation
    #[serde(default)]
    pub pred: Option<u32>,
}

impl Document {
    /// Create a document from raw text, splitting on whitespace
    pub fn new(text: &str, label: impl Into<String>) -> Self {
        Self {
            tokens: tokenize(text),
            label: label.into(),
            extra: BTreeMap::new(),
            pred: None,
        }
    }

    /// Tokens joined back into a single line of text
    pub fn text(&self) -> String {
        self.tokens.join(" ").replace(['\n', '\r'], " ")
    }
}

/// Lowercase whitespace tokenisation
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Bijection between string labels and class ids
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelIndex {
    label_to_ix: HashMap<String, u32>,
    ix_to_label: Vec<String>,
}

impl LabelIndex {
    /// Create an empty label index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every label in `docs`, assigning ids in first-seen order
    pub fn process_labels(&mut self, docs: &[Document]) {
        for doc in docs {
            self.insert(&doc.label);
        }
    }

    /// Register a single label, returning its id
    pub fn insert(&mut self, label: &str) -> u32 {
        if let Some(&ix) = self.label_to_ix.get(label) {
            return ix;
        }
        let ix = self.ix_to_label.len() as u32;
        self.label_to_ix.insert(label.to_string(), ix);
        self.ix_to_label.push(label.to_string());
        ix
    }

    /// Id of a known label
    pub fn encode(&self, label: &str) -> Result<u32> {
        self.label_to_ix
            .get(label)
            .copied()
            .ok_or_else(|| Error::data(format!("Unknown label: {label}")))
    }

    /// Label for a class id
    pub fn lookup(&self, ix: u32) -> Option<&str> {
        self.ix_to_label.get(ix as usize).map(String::as_str)
    }

    /// Encode the labels of all documents
    pub fn encode_all(&self, docs: &[Document]) -> Result<Vec<u32>> {
        docs.iter().map(|doc| self.encode(&doc.label)).collect()
    }

    /// Number of distinct labels
    pub fn len(&self) -> usize {
        self.ix_to_label.len()
    }

    /// Whether no labels have been registered
    pub fn is_empty(&self) -> bool {
        self.ix_to_label.is_empty()
    }

    /// Labels in id order
    pub fn labels(&self) -> &[String] {
        &self.ix_to_label
    }
}

/// Train, dev and test splits of one corpus
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    /// Dataset name, used in result rows
    pub name: String,
    /// Training documents
    pub train: Vec<Document>,
    /// Development documents
    pub dev: Vec<Document>,
    /// Test documents
    pub test: Vec<Document>,
    /// Label encoding shared by all splits
    pub labels: LabelIndex,
}

impl Dataset {
    /// Create a dataset and index the labels of every split
    pub fn new(
        name: impl Into<String>,
        train: Vec<Document>,
        dev: Vec<Document>,
        test: Vec<Document>,
    ) -> Self {
        let mut labels = LabelIndex::new();
        labels.process_labels(&train);
        labels.process_labels(&dev);
        labels.process_labels(&test);

        Self {
            name: name.into(),
            train,
            dev,
            test,
            labels,
        }
    }

    /// Number of classes seen across all splits
    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Token lists of a split, as consumed by vectorizers
    pub fn tokens(docs: &[Document]) -> Vec<&[String]> {
        docs.iter().map(|doc| doc.tokens.as_slice()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_index_first_seen_order() {
        let docs = vec![
            Document::new("a b", "neg"),
            Document::new("c", "pos"),
            Document::new("d", "neg"),
        ];
        let mut index = LabelIndex::new();
        index.process_labels(&docs);

        assert_eq!(index.len(), 2);
        assert_eq!(index.encode("neg").unwrap(), 0);
        assert_eq!(index.encode("pos").unwrap(), 1);
        assert_eq!(index.lookup(1), Some("pos"));
        assert!(index.lookup(2).is_none());
        assert!(index.encode("neutral").is_err());
    }

    #[test]
    fn test_dataset_indexes_all_splits() {
        let dataset = Dataset::new(
            "toy",
            vec![Document::new("x", "a")],
            vec![Document::new("y", "b")],
            vec![Document::new("z", "c")],
        );
        assert_eq!(dataset.num_classes(), 3);
        assert_eq!(dataset.labels.labels(), &["a", "b", "c"]);
    }

    #[test]
    fn test_document_text_flattens_newlines() {
        let mut doc = Document::new("Hello World", "x");
        assert_eq!(doc.tokens, vec!["hello", "world"]);
        doc.tokens.push("line\nbreak".to_string());
        assert_eq!(doc.text(), "hello world line break");
    }
}
