//! Reading datasets and writing results, predictions and models
//!
//! Datasets are JSON lines files. Results and predictions are CSV rows; models
//! are safetensors files and feature manifests are JSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Classifier, MlpConfig, ModelState};
use crate::training::classical::Estimator;
use crate::training::data::{Document, LabelIndex};
use crate::training::trainer::TrainingHistory;
use crate::vectorize::TextVectorizer;

/// Follow a dotted path such as `user.profile.lang` through nested objects
///
/// Numeric segments index into arrays.
pub fn get_deep_value<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Read one document per line of a JSON lines file
///
/// `extra` maps output names to dotted paths of further fields to keep on each
/// document. Blank lines are skipped; malformed lines and missing keys are
/// errors that name the line.
pub fn read_json_lines(
    path: impl AsRef<Path>,
    doc_key: &str,
    label_key: &str,
    extra: &BTreeMap<String, String>,
) -> Result<Vec<Document>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::data(format!("Failed to open {}: {e}", path.display())))?;

    let mut docs = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: Value = serde_json::from_str(&line).map_err(|e| {
            Error::data(format!("{}:{line_no}: malformed JSON: {e}", path.display()))
        })?;
        let field = |key: &str| {
            get_deep_value(&record, key).ok_or_else(|| {
                Error::data(format!("{}:{line_no}: missing key '{key}'", path.display()))
            })
        };

        let text = value_to_string(field(doc_key)?);
        let label = value_to_string(field(label_key)?);
        let mut doc = Document::new(&text, label);
        for (name, key) in extra {
            doc.extra.insert(name.clone(), field(key)?.clone());
        }
        docs.push(doc);
    }

    debug!("Read {} documents from {}", docs.len(), path.display());
    Ok(docs)
}

/// Identifying columns shared by result and prediction rows
#[derive(Debug, Clone, Copy)]
pub struct RowInfo<'a> {
    /// Dataset the row was computed on
    pub data_name: &'a str,
    /// Dataset the model was trained on
    pub main_name: &'a str,
    /// Free-form model description columns
    pub model_info: &'a [String],
}

/// Column names matching [`write_results`] rows
pub fn results_header(metric_names: &[&str], model_info_names: &[&str], with_dev: bool) -> Vec<String> {
    let mut header = vec!["dataset".to_string(), "trained_on".to_string(), "epoch".to_string()];
    header.extend(model_info_names.iter().map(|name| name.to_string()));
    header.extend(metric_names.iter().map(|m| format!("train_{m}")));
    header.push("train_loss".to_string());
    if with_dev {
        header.extend(metric_names.iter().map(|m| format!("dev_{m}")));
        header.push("dev_loss".to_string());
    }
    header
}

fn epoch_value(values: Option<&Vec<f64>>, epoch: usize) -> String {
    values
        .and_then(|v| v.get(epoch))
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Write one CSV row per epoch of `history`
///
/// Values missing for an epoch (dev scores of a cross-validated estimator, the
/// loss of a classical model) are left empty. Rows shorter than `expected_len`
/// are padded with empty cells; longer rows are an error.
pub fn write_results<W: Write>(
    writer: &mut csv::Writer<W>,
    history: &TrainingHistory,
    metric_names: &[&str],
    info: RowInfo<'_>,
    expected_len: usize,
) -> Result<()> {
    let with_dev = !history.dev_loss.is_empty() || history.dev_scores.values().any(|v| !v.is_empty());

    for epoch in 0..history.len() {
        let mut row = vec![info.data_name.to_string(), info.main_name.to_string(), epoch.to_string()];
        row.extend(info.model_info.iter().cloned());

        for &metric in metric_names {
            row.push(epoch_value(history.train_scores.get(metric), epoch));
        }
        row.push(epoch_value(Some(&history.train_loss), epoch));

        if with_dev {
            for &metric in metric_names {
                row.push(epoch_value(history.dev_scores.get(metric), epoch));
            }
            row.push(epoch_value(Some(&history.dev_loss), epoch));
        }

        if row.len() > expected_len {
            return Err(Error::invalid_input(format!(
                "Result row has {} columns, expected at most {}",
                row.len(),
                expected_len
            )));
        }
        row.resize(expected_len, String::new());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write each document with its gold and predicted label, then a `---` separator row
pub fn write_predictions<W: Write>(
    writer: &mut csv::Writer<W>,
    docs: &[Document],
    labels: &LabelIndex,
    info: RowInfo<'_>,
) -> Result<()> {
    let row_len = 5 + info.model_info.len();

    for doc in docs {
        let pred = doc
            .pred
            .ok_or_else(|| Error::invalid_input("Document has no prediction"))?;
        let predicted = labels
            .lookup(pred)
            .ok_or_else(|| Error::data(format!("No label for class id {pred}")))?;

        let mut row = vec![
            doc.text(),
            doc.label.clone(),
            predicted.to_string(),
            info.data_name.to_string(),
            info.main_name.to_string(),
        ];
        row.extend(info.model_info.iter().cloned());
        writer.write_record(&row)?;
    }

    writer.write_record(vec!["---"; row_len])?;
    writer.flush()?;
    Ok(())
}

fn model_path(base: &Path, name: &str) -> PathBuf {
    PathBuf::from(format!("{}_{}.mdl", base.display(), name))
}

/// Save the model parameters to `{base}_{name}.mdl`
pub fn store_model<M: Classifier + ?Sized>(model: &M, base: impl AsRef<Path>) -> Result<PathBuf> {
    let path = model_path(base.as_ref(), model.name());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    ModelState::capture(model.var_map())?.save(&path)?;
    info!("Stored model at {}", path.display());
    Ok(path)
}

/// Load parameters saved by [`store_model`] into `model`
pub fn load_model<M: Classifier + ?Sized>(model: &M, base: impl AsRef<Path>, device: &Device) -> Result<()> {
    let path = model_path(base.as_ref(), model.name());
    let state = ModelState::load(&path, device)
        .map_err(|e| Error::data(format!("Failed to load model from {}: {e}", path.display())))?;
    state.restore(model.var_map())?;
    info!("Loaded model from {}", path.display());
    Ok(())
}

/// Save a fitted classical estimator as JSON to `{base}_{name}.mdl`
pub fn store_estimator<E>(estimator: &E, base: impl AsRef<Path>) -> Result<PathBuf>
where
    E: Estimator + Serialize,
{
    let path = model_path(base.as_ref(), estimator.name());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, estimator)?;
    writer.flush()?;
    info!("Stored estimator at {}", path.display());
    Ok(path)
}

/// Load an estimator saved by [`store_estimator`]
pub fn load_estimator<E>(base: impl AsRef<Path>, name: &str) -> Result<E>
where
    E: Estimator + DeserializeOwned,
{
    let path = model_path(base.as_ref(), name);
    let file = File::open(&path)
        .map_err(|e| Error::data(format!("Failed to open {}: {e}", path.display())))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Everything needed to featurise new documents for a stored model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureManifest {
    /// When the manifest was written
    pub created: DateTime<Utc>,
    /// Fitted vectorizer
    pub vectorizer: TextVectorizer,
    /// Label encoding of the main task
    pub labels: LabelIndex,
    /// Shape of the stored neural model, if any
    pub model: Option<MlpConfig>,
}

impl FeatureManifest {
    /// Manifest stamped with the current time
    pub fn new(vectorizer: TextVectorizer, labels: LabelIndex, model: Option<MlpConfig>) -> Self {
        Self {
            created: Utc::now(),
            vectorizer,
            labels,
            model,
        }
    }
}

fn features_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}.fts", base.display()))
}

/// Write the manifest to `{base}.fts`
pub fn store_features(manifest: &FeatureManifest, base: impl AsRef<Path>) -> Result<PathBuf> {
    let path = features_path(base.as_ref());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, manifest)?;
    writer.flush()?;
    Ok(path)
}

/// Read a manifest written by [`store_features`]
pub fn load_features(base: impl AsRef<Path>) -> Result<FeatureManifest> {
    let path = features_path(base.as_ref());
    let file = File::open(&path)
        .map_err(|e| Error::data(format!("Failed to open {}: {e}", path.display())))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Open a CSV writer, appending when the file already exists
///
/// The header is written only to new files.
pub fn open_csv(path: impl AsRef<Path>, header: &[String]) -> Result<csv::Writer<File>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let exists = path.exists() && std::fs::metadata(path)?.len() > 0;
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
    if !exists && !header.is_empty() {
        writer.write_record(header)?;
    }
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpClassifier;
    use crate::training::metrics::Scores;
    use crate::vectorize::{select_vectorizer, Vectorizer};
    use serde_json::json;
    use tempfile::TempDir;

    fn written(writer: csv::Writer<Vec<u8>>) -> String {
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn test_deep_value() {
        let record = json!({"a": {"b": {"c": {"d": {"e": 5}}}}, "xs": [1, 2]});
        assert_eq!(get_deep_value(&record, "a.b.c.d.e"), Some(&json!(5)));
        assert_eq!(get_deep_value(&record, "xs.1"), Some(&json!(2)));
        assert!(get_deep_value(&record, "a.x").is_none());
    }

    #[test]
    fn test_read_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            "{\"text\": \"Hello World\", \"meta\": {\"label\": 1}, \"user\": {\"id\": 7}}\n\n{\"text\": \"bye\", \"meta\": {\"label\": 0}, \"user\": {\"id\": 8}}\n",
        )
        .unwrap();

        let mut extra = BTreeMap::new();
        extra.insert("user".to_string(), "user.id".to_string());
        let docs = read_json_lines(&path, "text", "meta.label", &extra).unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].tokens, vec!["hello", "world"]);
        assert_eq!(docs[0].label, "1");
        assert_eq!(docs[1].extra["user"], json!(8));
    }

    #[test]
    fn test_read_json_lines_reports_line_numbers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\"text\": \"a\", \"label\": \"x\"}\n{not json}\n").unwrap();
        let err = read_json_lines(&path, "text", "label", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains(":2:"));

        std::fs::write(&path, "{\"text\": \"a\"}\n").unwrap();
        let err = read_json_lines(&path, "text", "label", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing key 'label'"));
    }

    fn history(with_dev: bool) -> TrainingHistory {
        let mut train_scores = Scores::new();
        train_scores.insert("accuracy".to_string(), vec![0.5, 0.75]);
        let mut dev_scores = Scores::new();
        let mut dev_loss = Vec::new();
        if with_dev {
            dev_scores.insert("accuracy".to_string(), vec![0.25, 0.5]);
            dev_loss = vec![1.5, 1.25];
        }
        TrainingHistory {
            train_loss: vec![1.0, 0.5],
            dev_loss,
            train_scores,
            dev_scores,
            epochs_run: 2,
            stopped_early: false,
            best_epoch: None,
        }
    }

    #[test]
    fn test_write_results_rows() {
        let info = vec!["mlp".to_string()];
        let row_info = RowInfo {
            data_name: "toy",
            main_name: "toy",
            model_info: &info,
        };
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        write_results(&mut writer, &history(true), &["accuracy"], row_info, 8).unwrap();
        let out = written(writer);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["toy,toy,0,mlp,0.5,1,0.25,1.5", "toy,toy,1,mlp,0.75,0.5,0.5,1.25"]);
    }

    #[test]
    fn test_write_results_pads_and_rejects_long_rows() {
        let info: Vec<String> = Vec::new();
        let row_info = RowInfo {
            data_name: "a",
            main_name: "b",
            model_info: &info,
        };
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        write_results(&mut writer, &history(false), &["accuracy"], row_info, 7).unwrap();
        assert!(written(writer).starts_with("a,b,0,0.5,1,,\n"));

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        assert!(write_results(&mut writer, &history(true), &["accuracy"], row_info, 4).is_err());
    }

    #[test]
    fn test_results_header() {
        let header = results_header(&["accuracy"], &["model"], true);
        assert_eq!(
            header,
            vec!["dataset", "trained_on", "epoch", "model", "train_accuracy", "train_loss", "dev_accuracy", "dev_loss"]
        );
    }

    #[test]
    fn test_write_predictions() {
        let mut labels = LabelIndex::new();
        labels.insert("neg");
        labels.insert("pos");
        let mut doc = Document::new("good\nday", "pos");
        doc.pred = Some(0);
        let info = vec!["mlp".to_string()];
        let row_info = RowInfo {
            data_name: "test",
            main_name: "train",
            model_info: &info,
        };

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        write_predictions(&mut writer, &[doc], &labels, row_info).unwrap();
        let out = written(writer);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["good day,pos,neg,test,train,mlp", "---,---,---,---,---,---"]);

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        assert!(write_predictions(&mut writer, &[Document::new("x", "pos")], &labels, row_info).is_err());
    }

    #[test]
    fn test_store_and_load_model() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("models").join("run");
        let config = MlpConfig {
            input_dim: 3,
            hidden_dim: 4,
            output_dims: vec![2],
        };
        let model = MlpClassifier::new(config.clone(), &Device::Cpu).unwrap();
        let path = store_model(&model, &base).unwrap();
        assert!(path.to_string_lossy().ends_with("run_mlp.mdl"));

        let other = MlpClassifier::new(config, &Device::Cpu).unwrap();
        load_model(&other, &base, &Device::Cpu).unwrap();
        let a = ModelState::capture(model.var_map()).unwrap();
        let b = ModelState::capture(other.var_map()).unwrap();
        assert_eq!(
            a.get("hidden.weight").unwrap().to_vec2::<f32>().unwrap(),
            b.get("hidden.weight").unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_store_and_load_estimator() {
        use crate::training::classical::NaiveBayes;

        let dir = TempDir::new().unwrap();
        let base = dir.path().join("nb");
        let features = vec![vec![2.0, 0.0], vec![0.0, 2.0]];
        let mut nb = NaiveBayes::new(0.5).unwrap();
        nb.fit(&features, &[0, 2]).unwrap();
        store_estimator(&nb, &base).unwrap();

        let loaded: NaiveBayes = load_estimator(&base, "naive-bayes").unwrap();
        assert_eq!(loaded.alpha(), 0.5);
        assert_eq!(loaded.predict(&features).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_store_and_load_features() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("features");
        let mut vectorizer = select_vectorizer("tfidf");
        let tokens = vec!["a".to_string(), "b".to_string()];
        vectorizer.fit(&[tokens.as_slice()]).unwrap();
        let mut labels = LabelIndex::new();
        labels.insert("x");

        let manifest = FeatureManifest::new(vectorizer, labels.clone(), None);
        store_features(&manifest, &base).unwrap();
        let loaded = load_features(&base).unwrap();

        assert_eq!(loaded.labels, labels);
        assert_eq!(loaded.vectorizer.dim(), 2);
        assert_eq!(loaded.created, manifest.created);
    }

    #[test]
    fn test_open_csv_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("results.csv");
        let header = vec!["a".to_string(), "b".to_string()];
        {
            let mut writer = open_csv(&path, &header).unwrap();
            writer.write_record(["1", "2"]).unwrap();
        }
        {
            let mut writer = open_csv(&path, &header).unwrap();
            writer.write_record(["3", "4"]).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a,b\n1,2\n3,4\n");
    }
}
