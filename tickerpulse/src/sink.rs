//! CSV persistence of scored headlines.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Sentinel accepted by [`filter_by_label`] for "no filter".
pub const ALL_LABELS: &str = "All";

/// One scored headline as written to the news CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsRow {
    pub headline: String,
    pub sentiment_label: String,
    pub sentiment_score: f64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    Missing(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Destination for a refresh's rows. Each call replaces what was there.
pub trait ResultSink: Send + Sync {
    fn write_rows(&self, rows: &[NewsRow]) -> Result<(), StorageError>;
}

pub struct CsvNewsSink {
    path: PathBuf,
}

impl CsvNewsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for CsvNewsSink {
    fn write_rows(&self, rows: &[NewsRow]) -> Result<(), StorageError> {
        write_csv(&self.path, rows)?;
        info!(path = %self.path.display(), rows = rows.len(), "news CSV written");
        Ok(())
    }
}

/// Write `rows` with a header line, truncating any previous file.
pub(crate) fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let csv_err = |source| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Load the rows written by [`CsvNewsSink`].
pub fn read_news_rows(path: &Path) -> Result<Vec<NewsRow>, StorageError> {
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            if let csv::ErrorKind::Io(io_err) = e.kind() {
                if io_err.kind() == io::ErrorKind::NotFound {
                    return Err(StorageError::Missing(path.to_path_buf()));
                }
            }
            return Err(StorageError::Csv {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    reader
        .deserialize()
        .collect::<Result<Vec<NewsRow>, _>>()
        .map_err(|source| StorageError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

/// Distinct labels in first-seen order.
pub fn sentiment_labels(rows: &[NewsRow]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for row in rows {
        if !labels.contains(&row.sentiment_label) {
            labels.push(row.sentiment_label.clone());
        }
    }
    labels
}

/// Rows carrying `label`; `None` or [`ALL_LABELS`] keeps everything.
pub fn filter_by_label(rows: Vec<NewsRow>, label: Option<&str>) -> Vec<NewsRow> {
    match label {
        None | Some(ALL_LABELS) => rows,
        Some(label) => rows
            .into_iter()
            .filter(|r| r.sentiment_label == label)
            .collect(),
    }
}
