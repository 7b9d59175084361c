#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from histopatch for tests
pub use histopatch::{
    AnnotationLoader, BatchDriver, ChannelCode, DatasetCatalog, ExtractConfig, ExtractPolicy,
    PatchError, PatchExtractor, PatchRecord, PatchWriter, Raster, SampleOutcome,
};
