use histopatch::{DatasetCatalog, ExtractConfig, ExtractPolicy};
use image::{ImageBuffer, Luma, Rgb};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Dataset name used by every on-disk fixture.
pub const DATASET: &str = "gland";

/// Dataset config with two annotation types: `Gland` (INST, TYPE) and `Nuclei` (INST only).
pub const DATASET_YAML: &str = r#"
gland:
  img_dir: images
  img_ext: .png
  msk_dir: masks
  msk_ext: .png
  split_info: split.csv
  ann_info:
    Gland:
      ann_dir: ann/gland
      ann_ext: .json
      channel_code: [INST, TYPE]
    Nuclei:
      ann_dir: ann/nuclei
      ann_ext: .json
      channel_code: [INST]
"#;

/// A throwaway dataset directory laid out like `DATASET_YAML` expects.
/// The directory is removed when the fixture is dropped.
pub struct DatasetFixture {
    pub dir: TempDir,
}

impl DatasetFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        for sub in ["images", "masks", "ann/gland", "ann/nuclei"] {
            fs::create_dir_all(dir.path().join(sub)).expect("Failed to create fixture dir");
        }
        fs::write(dir.path().join("dataset.yml"), DATASET_YAML).expect("Failed to write config");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join("dataset.yml")
    }

    pub fn catalog(&self) -> DatasetCatalog {
        DatasetCatalog::load(self.config_path()).expect("Failed to load fixture config")
    }

    /// Save an RGB image whose pixels encode their own position.
    pub fn add_image(&self, basename: &str, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 10 % 256) as u8, (y * 10 % 256) as u8, 200u8])
        });
        img.save(self.root().join("images").join(format!("{basename}.png")))
            .expect("Failed to save test image");
    }

    /// Save a tissue mask; `foreground(x, y)` decides which pixels are tissue.
    pub fn add_mask(&self, basename: &str, width: u32, height: u32, foreground: impl Fn(u32, u32) -> bool) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Luma([if foreground(x, y) { 255u8 } else { 0u8 }])
        });
        img.save(self.root().join("masks").join(format!("{basename}.png")))
            .expect("Failed to save test mask");
    }

    /// Write an annotation file for `ann_dir` (`gland` or `nuclei`).
    pub fn add_annotation(&self, ann_dir: &str, basename: &str, body: &serde_json::Value) {
        self.add_raw_annotation(ann_dir, basename, &body.to_string());
    }

    pub fn add_raw_annotation(&self, ann_dir: &str, basename: &str, text: &str) {
        let path = self.root().join("ann").join(ann_dir).join(format!("{basename}.json"));
        fs::write(path, text).expect("Failed to write annotation");
    }

    pub fn write_splits(&self, rows: &[(&str, i64)]) {
        let mut text = String::from("Filename,Split\n");
        for (name, split) in rows {
            text.push_str(&format!("{name},{split}\n"));
        }
        fs::write(self.root().join("split.csv"), text).expect("Failed to write split table");
    }
}

/// Inline annotation whose instance map is `inst(x, y)` over a `width × height` grid.
pub fn annotation_json(
    width: usize,
    height: usize,
    inst: impl Fn(usize, usize) -> i32,
    ids: serde_json::Value,
    classes: serde_json::Value,
) -> serde_json::Value {
    let rows: Vec<Vec<i32>> = (0..height)
        .map(|y| (0..width).map(|x| inst(x, y)).collect())
        .collect();
    json!({ "inst_map": rows, "id": ids, "class": classes })
}

/// Two instances: id 1 fills the top half, id 2 the bottom-right quarter.
pub fn two_instance_annotation(width: usize, height: usize) -> serde_json::Value {
    annotation_json(
        width,
        height,
        |x, y| {
            if y < height / 2 {
                1
            } else if x >= width / 2 {
                2
            } else {
                0
            }
        },
        json!([1, 2]),
        json!([3, 5]),
    )
}

/// Extraction settings sized for the small fixture images.
pub fn small_config(save_root: &Path) -> ExtractConfig {
    ExtractConfig {
        save_root: save_root.to_path_buf(),
        datasets: vec![DATASET.to_string()],
        ann_types: vec!["Gland".to_string(), "Lumen".to_string(), "Nuclei".to_string()],
        win: 8,
        step: 8,
        policy: ExtractPolicy::Valid,
        ..ExtractConfig::default()
    }
}

/// Every file under `dir`, relative path and contents, sorted by path.
pub fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).expect("Failed to list output dir") {
            let path = entry.expect("Failed to read dir entry").path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(dir).expect("path under dir").to_path_buf();
                files.push((rel, fs::read(&path).expect("Failed to read output file")));
            }
        }
    }
    files.sort();
    files
}
