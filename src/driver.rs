//! Batch driver: turns datasets into a stream of `(dataset, file)` jobs and runs the
//! per-sample pipeline over it, sequentially or on a worker pool.

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use walkdir::WalkDir;

use crate::annotation::AnnotationLoader;
use crate::config::{DatasetCatalog, ExtractConfig, SplitTable};
use crate::error::{PatchError, PatchResult};
use crate::loader::{load_image, load_mask};
use crate::raster::Raster;
use crate::tiling::PatchExtractor;
use crate::writer::{PatchWriter, keep_patch};

/// Where a sample is in its pipeline; attached to per-sample errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStage {
    Init,
    LoadingSample,
    Tiling,
    WritingPatches,
    Done,
}

impl fmt::Display for SampleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleStage::Init => "init",
            SampleStage::LoadingSample => "loading sample",
            SampleStage::Tiling => "tiling",
            SampleStage::WritingPatches => "writing patches",
            SampleStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// One image file of one dataset, with its resolved split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleJob {
    pub dataset: String,
    pub basename: String,
    pub image_path: PathBuf,
    pub split: u32,
}

/// The job stream for a run plus the files that never became jobs.
#[derive(Debug, Clone, Default)]
pub struct JobPlan {
    pub jobs: Vec<SampleJob>,
    /// Files with no split row or a split ≤ 0.
    pub excluded: usize,
    /// Files left out by the basename allow-list.
    pub filtered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Written { kept: usize, discarded: usize },
    NoAnnotation,
}

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub planned: usize,
    pub excluded: usize,
    pub filtered: usize,
    pub processed: usize,
    pub no_annotation: usize,
    pub failed: usize,
    pub patches_written: usize,
    pub patches_discarded: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Files planned:        {}", self.planned)?;
        writeln!(f, "Files processed:      {}", self.processed)?;
        writeln!(f, "Excluded by split:    {}", self.excluded)?;
        writeln!(f, "Filtered out:         {}", self.filtered)?;
        writeln!(f, "Without annotation:   {}", self.no_annotation)?;
        writeln!(f, "Failed:               {}", self.failed)?;
        writeln!(f, "Patches written:      {}", self.patches_written)?;
        write!(f, "Patches discarded:    {}", self.patches_discarded)
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    no_annotation: AtomicUsize,
    failed: AtomicUsize,
    written: AtomicUsize,
    discarded: AtomicUsize,
}

/// Image files under `dir` (recursively) whose name ends with `ext`, sorted.
pub fn discover_images(dir: &Path, ext: &str) -> PatchResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|source| PatchError::Discover {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(ext)
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Sample basename: the file name with the dataset's image extension removed.
pub fn basename_of(path: &Path, ext: &str) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(ext) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(name),
    }
}

/// Resolve splits for every image of every requested dataset.
pub fn plan_jobs(catalog: &DatasetCatalog, config: &ExtractConfig) -> PatchResult<JobPlan> {
    let mut plan = JobPlan::default();
    for name in &config.datasets {
        let descriptor = catalog.get(name)?;
        let splits = SplitTable::load(&descriptor.split_info)?;
        let files = discover_images(&descriptor.img_dir, &descriptor.img_ext)?;
        info!(
            "dataset `{}`: {} image files, {} split rows",
            name,
            files.len(),
            splits.len()
        );

        for image_path in files {
            let basename = basename_of(&image_path, &descriptor.img_ext);
            if let Some(only) = &config.only {
                if !only.contains(&basename) {
                    plan.filtered += 1;
                    continue;
                }
            }
            match splits.resolve(&basename) {
                Some(split) => plan.jobs.push(SampleJob {
                    dataset: name.clone(),
                    basename,
                    image_path,
                    split,
                }),
                None => {
                    debug!("`{basename}` has no positive split, excluded");
                    plan.excluded += 1;
                }
            }
        }
    }
    Ok(plan)
}

/// Runs the extraction pipeline over planned jobs.
pub struct BatchDriver<'a> {
    catalog: &'a DatasetCatalog,
    config: &'a ExtractConfig,
    extractor: PatchExtractor,
    loaders: BTreeMap<String, AnnotationLoader<'a>>,
    show_progress: bool,
}

impl<'a> BatchDriver<'a> {
    /// Validate the configuration and resolve channel selection for every dataset.
    ///
    /// Requesting a dataset the catalog does not know, or an annotation type whose declared
    /// channels are disjoint from the requested ones, fails here before any file is read.
    pub fn new(catalog: &'a DatasetCatalog, config: &'a ExtractConfig) -> PatchResult<Self> {
        config.validate()?;
        catalog.check_requested(&config.datasets)?;

        let mut loaders = BTreeMap::new();
        for name in &config.datasets {
            let descriptor = catalog.get(name)?;
            let loader = AnnotationLoader::new(descriptor, &config.ann_types, &config.channels)?;
            loaders.insert(name.clone(), loader);
        }

        Ok(Self {
            catalog,
            config,
            extractor: PatchExtractor::new(config.win, config.step).with_policy(config.policy),
            loaders,
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn plan(&self) -> PatchResult<JobPlan> {
        plan_jobs(self.catalog, self.config)
    }

    /// Plan and run every requested dataset.
    pub fn run(&self) -> PatchResult<RunSummary> {
        let plan = self.plan()?;
        self.run_jobs(&plan)
    }

    /// Run a job plan. Non-fatal sample errors are logged and counted; the first fatal
    /// error stops scheduling further files and is returned.
    pub fn run_jobs(&self, plan: &JobPlan) -> PatchResult<RunSummary> {
        let progress = if self.show_progress {
            let pb = ProgressBar::new(plan.jobs.len() as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "Process File: |{bar:40}| {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };
        let counters = Counters::default();

        let run_one = |job: &SampleJob| -> PatchResult<()> {
            progress.set_message(job.basename.clone());
            let result = self.process_sample(job);
            progress.inc(1);
            match result {
                Ok(SampleOutcome::Written { kept, discarded }) => {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                    counters.written.fetch_add(kept, Ordering::Relaxed);
                    counters.discarded.fetch_add(discarded, Ordering::Relaxed);
                    Ok(())
                }
                Ok(SampleOutcome::NoAnnotation) => {
                    counters.no_annotation.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(err) if !err.is_fatal() => {
                    warn!("skipping sample: {err}");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };

        let result = if self.config.workers <= 1 {
            plan.jobs.iter().try_for_each(&run_one)
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .build()
                .map_err(|e| PatchError::InvalidConfig(format!("cannot start worker pool: {e}")))?;
            pool.install(|| plan.jobs.par_iter().try_for_each(&run_one))
        };
        if let Err(err) = result {
            progress.abandon();
            return Err(err);
        }
        progress.finish_and_clear();

        let summary = RunSummary {
            planned: plan.jobs.len(),
            excluded: plan.excluded,
            filtered: plan.filtered,
            processed: counters.processed.into_inner(),
            no_annotation: counters.no_annotation.into_inner(),
            failed: counters.failed.into_inner(),
            patches_written: counters.written.into_inner(),
            patches_discarded: counters.discarded.into_inner(),
        };
        info!(
            "finished: {} files processed, {} patches written, {} failed",
            summary.processed, summary.patches_written, summary.failed
        );
        Ok(summary)
    }

    /// Load, compose, tile and write one sample.
    ///
    /// Depends only on the job and the immutable run configuration, so samples can run
    /// in any order or in parallel.
    pub fn process_sample(&self, job: &SampleJob) -> PatchResult<SampleOutcome> {
        let (dataset, basename) = (job.dataset.as_str(), job.basename.as_str());
        let loader = self
            .loaders
            .get(dataset)
            .ok_or_else(|| PatchError::UnknownDataset(dataset.to_string()))
            .map_err(|e| e.in_sample(dataset, basename, SampleStage::Init))?;

        debug!("{dataset}/{basename}: {}", SampleStage::LoadingSample);
        let Some((raster, channel_codes)) = load_sample(loader, job)
            .map_err(|e| e.in_sample(dataset, basename, SampleStage::LoadingSample))?
        else {
            info!("`{basename}` has no annotation {:?}", self.config.ann_types);
            return Ok(SampleOutcome::NoAnnotation);
        };

        debug!(
            "{dataset}/{basename}: {} {}x{}x{}",
            SampleStage::Tiling,
            raster.height(),
            raster.width(),
            raster.channels()
        );
        let prepared = self.extractor.prepare(raster.as_array());
        let writer = PatchWriter::create(self.config.output_dir(dataset, job.split))
            .map_err(|e| e.in_sample(dataset, basename, SampleStage::WritingPatches))?;

        let (mut kept, mut discarded) = (0, 0);
        for patch in self.extractor.patches(&prepared) {
            let patch = patch.map_err(|e| e.in_sample(dataset, basename, SampleStage::Tiling))?;
            if !keep_patch(patch.mask()) {
                discarded += 1;
                continue;
            }
            writer
                .write(basename, &patch, &channel_codes)
                .map_err(|e| e.in_sample(dataset, basename, SampleStage::WritingPatches))?;
            kept += 1;
        }

        debug!(
            "{dataset}/{basename}: {} ({kept} kept, {discarded} discarded)",
            SampleStage::Done
        );
        Ok(SampleOutcome::Written { kept, discarded })
    }
}

fn load_sample(
    loader: &AnnotationLoader<'_>,
    job: &SampleJob,
) -> PatchResult<Option<(Raster, Vec<String>)>> {
    let image = load_image(&job.image_path)?;
    let (height, width, _) = image.dim();
    let mask = load_mask(loader.descriptor(), &job.basename, (height, width))?;
    let Some(annotation) = loader.load(&job.basename, (height, width))? else {
        return Ok(None);
    };
    let raster = Raster::compose(&image, &mask, &annotation.data)?;
    Ok(Some((raster, annotation.channel_codes)))
}
