//! Dataset descriptors, run parameters and split tables.
//!
//! Everything here is loaded once at startup and passed by reference into the
//! loaders, the tiling engine and the batch driver.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PatchError, PatchResult};
use crate::tiling::ExtractPolicy;

/// Semantic meaning of one annotation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelCode {
    /// Instance label map (0 = background).
    #[serde(rename = "INST")]
    Inst,
    /// Per-pixel class label derived from instance ids and their classes.
    #[serde(rename = "TYPE")]
    Type,
}

impl ChannelCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelCode::Inst => "INST",
            ChannelCode::Type => "TYPE",
        }
    }
}

impl fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INST" => Ok(ChannelCode::Inst),
            "TYPE" => Ok(ChannelCode::Type),
            other => Err(format!("unknown channel code `{other}` (expected INST or TYPE)")),
        }
    }
}

/// Where one annotation type lives for a dataset and which channels it declares.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationSource {
    pub ann_dir: PathBuf,
    pub ann_ext: String,
    /// Declared channel order of the stored annotation.
    pub channel_code: Vec<ChannelCode>,
}

impl AnnotationSource {
    pub fn path_for(&self, basename: &str) -> PathBuf {
        self.ann_dir.join(format!("{}{}", basename, self.ann_ext))
    }
}

/// Static description of one dataset: image/mask locations, annotation sources and split table.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetDescriptor {
    #[serde(skip)]
    pub name: String,
    pub img_dir: PathBuf,
    pub img_ext: String,
    #[serde(default)]
    pub msk_dir: Option<PathBuf>,
    #[serde(default)]
    pub msk_ext: Option<String>,
    pub split_info: PathBuf,
    #[serde(default)]
    pub ann_info: BTreeMap<String, AnnotationSource>,
}

impl DatasetDescriptor {
    /// Mask location for `basename`, if the dataset declares a mask directory at all.
    pub fn mask_path(&self, basename: &str) -> Option<PathBuf> {
        match (&self.msk_dir, &self.msk_ext) {
            (Some(dir), Some(ext)) => Some(dir.join(format!("{}{}", basename, ext))),
            _ => None,
        }
    }

    fn resolve_relative(&mut self, base: &Path) {
        self.img_dir = base.join(&self.img_dir);
        self.split_info = base.join(&self.split_info);
        if let Some(dir) = self.msk_dir.take() {
            self.msk_dir = Some(base.join(dir));
        }
        for source in self.ann_info.values_mut() {
            source.ann_dir = base.join(&source.ann_dir);
        }
    }

    fn validate(&self) -> PatchResult<()> {
        if self.msk_dir.is_some() && self.msk_ext.is_none() {
            return Err(PatchError::InvalidConfig(format!(
                "dataset `{}` sets msk_dir without msk_ext",
                self.name
            )));
        }
        for (ann_type, source) in &self.ann_info {
            if source.channel_code.is_empty() {
                return Err(PatchError::InvalidConfig(format!(
                    "dataset `{}`: annotation `{}` declares no channel codes",
                    self.name, ann_type
                )));
            }
            let unique: HashSet<_> = source.channel_code.iter().collect();
            if unique.len() != source.channel_code.len() {
                return Err(PatchError::InvalidConfig(format!(
                    "dataset `{}`: annotation `{}` declares duplicate channel codes {:?}",
                    self.name, ann_type, source.channel_code
                )));
            }
        }
        Ok(())
    }
}

/// All datasets defined in one dataset config file, keyed by dataset name.
#[derive(Debug, Clone, Default)]
pub struct DatasetCatalog {
    datasets: BTreeMap<String, DatasetDescriptor>,
}

impl DatasetCatalog {
    /// Load a YAML dataset config. Relative paths are resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> PatchResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PatchError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&text, base).map_err(|err| match err {
            PatchError::ConfigParse { source, .. } => PatchError::ConfigParse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(text: &str, base_dir: &Path) -> PatchResult<Self> {
        let mut datasets: BTreeMap<String, DatasetDescriptor> =
            serde_yaml::from_str(text).map_err(|source| PatchError::ConfigParse {
                path: PathBuf::new(),
                source,
            })?;
        for (name, descriptor) in datasets.iter_mut() {
            descriptor.name = name.clone();
            descriptor.resolve_relative(base_dir);
            descriptor.validate()?;
        }
        Ok(Self { datasets })
    }

    pub fn get(&self, name: &str) -> PatchResult<&DatasetDescriptor> {
        self.datasets
            .get(name)
            .ok_or_else(|| PatchError::UnknownDataset(name.to_string()))
    }

    /// Fail fast if any requested dataset is missing from the catalog.
    pub fn check_requested(&self, names: &[String]) -> PatchResult<()> {
        for name in names {
            self.get(name)?;
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }
}

/// Run parameters for one extraction pass.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub save_root: PathBuf,
    pub datasets: Vec<String>,
    pub ann_types: Vec<String>,
    pub channels: Vec<ChannelCode>,
    pub win: usize,
    pub step: usize,
    pub policy: ExtractPolicy,
    /// Worker threads; 0 or 1 processes files sequentially.
    pub workers: usize,
    /// Restrict the run to these basenames (resuming over a remaining file list).
    pub only: Option<HashSet<String>>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            save_root: PathBuf::from("patches"),
            datasets: vec!["gland".into(), "lumen".into(), "nuclei".into()],
            ann_types: vec!["Gland".into(), "Lumen".into(), "Nuclei".into()],
            channels: vec![ChannelCode::Inst, ChannelCode::Type],
            win: 996,
            step: 448,
            policy: ExtractPolicy::Valid,
            workers: 1,
            only: None,
        }
    }
}

impl ExtractConfig {
    pub fn validate(&self) -> PatchResult<()> {
        if self.win == 0 || self.step == 0 {
            return Err(PatchError::InvalidConfig(format!(
                "window ({}) and step ({}) must both be positive",
                self.win, self.step
            )));
        }
        if self.step > self.win {
            return Err(PatchError::InvalidConfig(format!(
                "step ({}) larger than window ({}) would leave pixels outside every patch",
                self.step, self.win
            )));
        }
        if self.channels.is_empty() {
            return Err(PatchError::InvalidConfig(
                "at least one channel code must be requested".to_string(),
            ));
        }
        Ok(())
    }

    /// Output directory for one dataset split, e.g. `root/gland/split_2/996_448`.
    pub fn output_dir(&self, dataset: &str, split: u32) -> PathBuf {
        self.save_root
            .join(dataset)
            .join(format!("split_{split}"))
            .join(format!("{}_{}", self.win, self.step))
    }
}

#[derive(Debug, Deserialize)]
struct SplitRow {
    #[serde(rename = "Filename")]
    filename: String,
    #[serde(rename = "Split")]
    split: i64,
}

/// Basename → split assignment. Splits ≤ 0 mark excluded samples.
#[derive(Debug, Clone, Default)]
pub struct SplitTable {
    splits: HashMap<String, i64>,
}

impl SplitTable {
    /// Read a `Filename,Split` CSV. The first row for a repeated filename wins.
    pub fn load(path: impl AsRef<Path>) -> PatchResult<Self> {
        let path = path.as_ref();
        let to_err = |source: csv::Error| PatchError::SplitTable {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(to_err)?;
        let mut splits = HashMap::new();
        for row in reader.deserialize() {
            let row: SplitRow = row.map_err(to_err)?;
            splits.entry(row.filename).or_insert(row.split);
        }
        Ok(Self { splits })
    }

    pub fn from_rows<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut splits = HashMap::new();
        for (name, split) in rows {
            splits.entry(name.into()).or_insert(split);
        }
        Self { splits }
    }

    /// Positive split for `basename`, or `None` if it is missing or excluded.
    pub fn resolve(&self, basename: &str) -> Option<u32> {
        self.splits
            .get(basename)
            .copied()
            .filter(|split| *split > 0)
            .and_then(|split| u32::try_from(split).ok())
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}
