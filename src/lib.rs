pub mod annotation;
pub mod config;
pub mod driver;
pub mod error;
pub mod loader;
pub mod raster;
pub mod tiling;
pub mod writer;

pub use annotation::{AnnotationLoader, ChannelPlan, CompositeAnnotation, InstanceAnnotation, ScalarOrSeq, class_map};
pub use config::{AnnotationSource, ChannelCode, DatasetCatalog, DatasetDescriptor, ExtractConfig, SplitTable};
pub use driver::{BatchDriver, JobPlan, RunSummary, SampleJob, SampleOutcome, SampleStage, plan_jobs};
pub use error::{PatchError, PatchResult};
pub use raster::Raster;
pub use tiling::{AxisOrigins, ExtractPolicy, Patch, PatchExtractor};
pub use writer::{PatchMeta, PatchRecord, PatchWriter, keep_patch};
