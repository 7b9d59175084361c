//! Error type shared by every stage of patch extraction.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ChannelCode;
use crate::driver::SampleStage;

pub type PatchResult<T> = Result<T, PatchError>;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to read dataset config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dataset config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("dataset `{0}` is not defined in the dataset config")]
    UnknownDataset(String),
    #[error("failed to list images under {path}: {source}")]
    Discover {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to read split table {path}: {source}")]
    SplitTable {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(
        "dataset `{dataset}`: requested channels {requested:?} but annotation `{ann_type}` declares {declared:?}"
    )]
    ChannelSelection {
        dataset: String,
        ann_type: String,
        requested: Vec<ChannelCode>,
        declared: Vec<ChannelCode>,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to read annotation `{ann_type}` at {path}: {source}")]
    AnnotationIo {
        ann_type: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("annotation `{ann_type}` at {path} is not valid json: {source}")]
    AnnotationJson {
        ann_type: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("annotation `{ann_type}` at {path} is malformed: {msg}")]
    AnnotationFormat {
        ann_type: String,
        path: PathBuf,
        msg: String,
    },
    #[error("{what} is {found:?} (HxW) but the image is {expected:?}")]
    ShapeMismatch {
        what: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("{what} has {found} channels, expected {expected}")]
    ChannelCount {
        what: String,
        expected: usize,
        found: usize,
    },
    #[error("patch {index} at origin {origin:?} is {found:?} (HxW), expected {win}x{win}")]
    PatchShape {
        index: usize,
        origin: (usize, usize),
        found: (usize, usize),
        win: usize,
    },
    #[error("failed to write patch {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read patch record {path}: {msg}")]
    Record { path: PathBuf, msg: String },
    #[error("dataset `{dataset}`, sample `{basename}` ({stage}): {source}")]
    Sample {
        dataset: String,
        basename: String,
        stage: SampleStage,
        #[source]
        source: Box<PatchError>,
    },
}

impl PatchError {
    /// Whether this error must abort the whole run rather than just the current sample.
    ///
    /// A malformed annotation file only poisons its own sample; everything else signals
    /// broken configuration, unreadable inputs or a failing output volume.
    pub fn is_fatal(&self) -> bool {
        match self {
            PatchError::AnnotationIo { .. }
            | PatchError::AnnotationJson { .. }
            | PatchError::AnnotationFormat { .. } => false,
            PatchError::Sample { source, .. } => source.is_fatal(),
            _ => true,
        }
    }

    pub(crate) fn in_sample(self, dataset: &str, basename: &str, stage: SampleStage) -> Self {
        PatchError::Sample {
            dataset: dataset.to_string(),
            basename: basename.to_string(),
            stage,
            source: Box::new(self),
        }
    }
}
