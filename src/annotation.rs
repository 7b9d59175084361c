//! Annotation compositing.
//!
//! Each annotation type (gland, lumen, nuclei, ...) is stored per sample as an instance
//! label map plus parallel `id` / `class` sequences. The loader merges the requested
//! types into one channel-coded tensor and tracks where every channel came from.

use image::DynamicImage;
use log::{debug, info};
use ndarray::{Array2, Array3, Axis};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{AnnotationSource, ChannelCode, DatasetDescriptor};
use crate::error::{PatchError, PatchResult};

/// A field that may be stored as a bare number, a flat list or a singleton-nested list.
///
/// Exports from array-oriented tools squeeze length-1 vectors down to scalars and keep
/// row vectors as `[[...]]`; all of those normalise to one flat sequence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScalarOrSeq {
    Scalar(i32),
    Seq(Vec<i32>),
    Nested(Vec<Vec<i32>>),
}

impl ScalarOrSeq {
    pub fn into_vec(self) -> Vec<i32> {
        match self {
            ScalarOrSeq::Scalar(v) => vec![v],
            ScalarOrSeq::Seq(v) => v,
            ScalarOrSeq::Nested(rows) => rows.into_iter().flatten().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InstMapSource {
    Inline(Vec<Vec<i32>>),
    /// Label image, relative to the annotation file.
    File(PathBuf),
}

#[derive(Debug, Deserialize)]
struct AnnotationFile {
    inst_map: InstMapSource,
    id: ScalarOrSeq,
    #[serde(default)]
    class: Option<ScalarOrSeq>,
}

/// One decoded annotation file.
#[derive(Debug, Clone)]
pub struct InstanceAnnotation {
    pub inst_map: Array2<i32>,
    pub ids: Vec<i32>,
    pub classes: Option<Vec<i32>>,
}

impl InstanceAnnotation {
    pub fn read(path: &Path, ann_type: &str) -> PatchResult<Self> {
        let raw = std::fs::read(path).map_err(|source| PatchError::AnnotationIo {
            ann_type: ann_type.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        let file: AnnotationFile =
            serde_json::from_slice(&raw).map_err(|source| PatchError::AnnotationJson {
                ann_type: ann_type.to_string(),
                path: path.to_path_buf(),
                source,
            })?;
        let malformed = |msg: String| PatchError::AnnotationFormat {
            ann_type: ann_type.to_string(),
            path: path.to_path_buf(),
            msg,
        };

        let inst_map = match file.inst_map {
            InstMapSource::Inline(rows) => {
                let height = rows.len();
                let width = rows.first().map_or(0, Vec::len);
                if let Some(bad) = rows.iter().position(|row| row.len() != width) {
                    return Err(malformed(format!(
                        "inst_map row {bad} has {} columns, expected {width}",
                        rows[bad].len()
                    )));
                }
                let flat: Vec<i32> = rows.into_iter().flatten().collect();
                Array2::from_shape_vec((height, width), flat)
                    .map_err(|e| malformed(format!("inst_map: {e}")))?
            }
            InstMapSource::File(rel) => {
                let label_path = path.parent().unwrap_or_else(|| Path::new(".")).join(rel);
                let labels = image::open(&label_path)
                    .map_err(|e| malformed(format!("inst_map image {}: {e}", label_path.display())))?;
                label_map(&labels).ok_or_else(|| {
                    malformed(format!(
                        "inst_map image {} is {:?}, expected 8- or 16-bit grayscale",
                        label_path.display(),
                        labels.color()
                    ))
                })?
            }
        };

        let ids = file.id.into_vec();
        let classes = file.class.map(ScalarOrSeq::into_vec);
        if let Some(classes) = &classes {
            if classes.len() != ids.len() {
                return Err(malformed(format!(
                    "{} ids but {} classes",
                    ids.len(),
                    classes.len()
                )));
            }
        }

        Ok(Self {
            inst_map,
            ids,
            classes,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.inst_map.dim()
    }
}

/// Instance labels stored as raw gray values. Color and float images carry no label ids.
fn label_map(labels: &DynamicImage) -> Option<Array2<i32>> {
    let shape = (labels.height() as usize, labels.width() as usize);
    match labels {
        DynamicImage::ImageLuma8(gray) => Some(Array2::from_shape_fn(shape, |(r, c)| {
            i32::from(gray.get_pixel(c as u32, r as u32)[0])
        })),
        DynamicImage::ImageLuma16(gray) => Some(Array2::from_shape_fn(shape, |(r, c)| {
            i32::from(gray.get_pixel(c as u32, r as u32)[0])
        })),
        _ => None,
    }
}

/// Stamp `classes[i]` onto every pixel whose instance label is `ids[i]`.
///
/// Uncovered pixels, background (id 0) and ids absent from the map stay 0. A repeated
/// id takes the class of its last occurrence.
pub fn class_map(inst_map: &Array2<i32>, ids: &[i32], classes: &[i32]) -> Array2<i32> {
    let lookup: HashMap<i32, i32> = ids
        .iter()
        .copied()
        .zip(classes.iter().copied())
        .filter(|(id, _)| *id != 0)
        .collect();
    inst_map.mapv(|inst| lookup.get(&inst).copied().unwrap_or(0))
}

/// Channels of one annotation type that survive the requested-code filter, in declared order.
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    ann_type: String,
    source: AnnotationSource,
    indices: Vec<usize>,
}

impl ChannelPlan {
    /// Fails if none of the declared channel codes is requested; that is a misconfiguration
    /// of the whole run, not a property of one sample.
    pub fn new(
        dataset: &str,
        ann_type: &str,
        source: &AnnotationSource,
        requested: &[ChannelCode],
    ) -> PatchResult<Self> {
        let indices: Vec<usize> = source
            .channel_code
            .iter()
            .enumerate()
            .filter(|(_, code)| requested.contains(code))
            .map(|(idx, _)| idx)
            .collect();
        if indices.is_empty() {
            return Err(PatchError::ChannelSelection {
                dataset: dataset.to_string(),
                ann_type: ann_type.to_string(),
                requested: requested.to_vec(),
                declared: source.channel_code.clone(),
            });
        }
        Ok(Self {
            ann_type: ann_type.to_string(),
            source: source.clone(),
            indices,
        })
    }

    pub fn ann_type(&self) -> &str {
        &self.ann_type
    }

    /// Indices into the declared channel list.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn codes(&self) -> impl Iterator<Item = ChannelCode> + '_ {
        self.indices.iter().map(|&idx| self.source.channel_code[idx])
    }

    /// Provenance strings (`"{type}-{code}"`) of the selected channels.
    pub fn provenance(&self) -> Vec<String> {
        self.codes()
            .map(|code| format!("{}-{}", self.ann_type, code))
            .collect()
    }

    /// Build the selected channels for one decoded annotation.
    fn materialize(
        &self,
        ann: InstanceAnnotation,
        path: &Path,
    ) -> PatchResult<Vec<Array2<i32>>> {
        let mut types = if self.codes().any(|code| code == ChannelCode::Type) {
            let classes = ann.classes.as_deref().ok_or_else(|| PatchError::AnnotationFormat {
                ann_type: self.ann_type.clone(),
                path: path.to_path_buf(),
                msg: "TYPE channel requested but the file has no `class` field".to_string(),
            })?;
            Some(class_map(&ann.inst_map, &ann.ids, classes))
        } else {
            None
        };
        let mut inst = Some(ann.inst_map);
        // Declared codes are unique, so each map is moved out at most once.
        Ok(self
            .codes()
            .filter_map(|code| match code {
                ChannelCode::Inst => inst.take(),
                ChannelCode::Type => types.take(),
            })
            .collect())
    }
}

/// Composite annotation of one sample: `[H, W, K]` labels plus `K` provenance strings.
#[derive(Debug, Clone)]
pub struct CompositeAnnotation {
    pub data: Array3<i32>,
    pub channel_codes: Vec<String>,
}

impl CompositeAnnotation {
    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(2))
    }
}

/// Per-dataset annotation loader with channel selection resolved up front.
#[derive(Debug, Clone)]
pub struct AnnotationLoader<'a> {
    descriptor: &'a DatasetDescriptor,
    /// Requested types in order; `None` when the dataset does not define the type.
    plans: Vec<(String, Option<ChannelPlan>)>,
}

impl<'a> AnnotationLoader<'a> {
    pub fn new(
        descriptor: &'a DatasetDescriptor,
        ann_types: &[String],
        requested: &[ChannelCode],
    ) -> PatchResult<Self> {
        let mut plans = Vec::with_capacity(ann_types.len());
        for ann_type in ann_types {
            let plan = match descriptor.ann_info.get(ann_type) {
                Some(source) => {
                    let plan = ChannelPlan::new(&descriptor.name, ann_type, source, requested)?;
                    debug!(
                        "dataset `{}`: annotation `{}` uses declared channels {:?}",
                        descriptor.name,
                        ann_type,
                        plan.indices()
                    );
                    Some(plan)
                }
                None => {
                    info!(
                        "dataset `{}` has no annotation `{}` at dataset level",
                        descriptor.name, ann_type
                    );
                    None
                }
            };
            plans.push((ann_type.clone(), plan));
        }
        Ok(Self { descriptor, plans })
    }

    pub fn descriptor(&self) -> &'a DatasetDescriptor {
        self.descriptor
    }

    /// Composite annotation for `basename`, or `None` if no type contributed a channel.
    ///
    /// `shape` is the `(height, width)` of the sample image; every annotation must match it.
    pub fn load(
        &self,
        basename: &str,
        shape: (usize, usize),
    ) -> PatchResult<Option<CompositeAnnotation>> {
        let mut channels: Vec<Array2<i32>> = Vec::new();
        let mut channel_codes = Vec::new();

        for (ann_type, plan) in &self.plans {
            let Some(plan) = plan else {
                debug!("`{basename}` has no annotation `{ann_type}` at dataset level");
                continue;
            };
            let path = plan.source.path_for(basename);
            if !path.is_file() {
                info!("`{basename}` has no annotation `{ann_type}` file");
                continue;
            }

            let ann = InstanceAnnotation::read(&path, ann_type)?;
            if ann.shape() != shape {
                return Err(PatchError::ShapeMismatch {
                    what: format!("annotation `{ann_type}` ({})", path.display()),
                    expected: shape,
                    found: ann.shape(),
                });
            }
            channels.extend(plan.materialize(ann, &path)?);
            channel_codes.extend(plan.provenance());
        }

        if channels.is_empty() {
            return Ok(None);
        }

        let mut data = Array3::<i32>::zeros((shape.0, shape.1, channels.len()));
        for (k, channel) in channels.iter().enumerate() {
            data.index_axis_mut(Axis(2), k).assign(channel);
        }
        Ok(Some(CompositeAnnotation {
            data,
            channel_codes,
        }))
    }
}
