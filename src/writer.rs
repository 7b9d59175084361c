//! Patch filtering and patch record persistence.
//!
//! A patch record is a zstd-compressed tar with three entries:
//! `meta.json`, `img.png` (RGB, 8-bit) and `ann.bin` (little-endian `i32`, `[H, W, K]`).
//! Entry headers are fixed so rerunning on unchanged inputs rewrites identical bytes.

use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use ndarray::{Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

use crate::error::{PatchError, PatchResult};
use crate::tiling::Patch;

const META_ENTRY: &str = "meta.json";
const IMAGE_ENTRY: &str = "img.png";
const ANNOTATION_ENTRY: &str = "ann.bin";
const ZSTD_LEVEL: i32 = 3;

/// Keep a patch only if its mask covers at least one foreground pixel.
pub fn keep_patch(mask: ArrayView2<'_, i32>) -> bool {
    mask.iter().map(|&v| i64::from(v)).sum::<i64>() > 0
}

/// Descriptive part of a patch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMeta {
    pub basename: String,
    pub index: usize,
    pub origin: [usize; 2],
    pub height: usize,
    pub width: usize,
    pub channel_code: Vec<String>,
}

/// A patch record read back from disk.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub meta: PatchMeta,
    pub image: Array3<u8>,
    pub annotation: Array3<i32>,
}

impl PatchRecord {
    pub fn read(path: impl AsRef<Path>) -> PatchResult<Self> {
        let path = path.as_ref();
        let bad = |msg: String| PatchError::Record {
            path: path.to_path_buf(),
            msg,
        };

        let file = File::open(path).map_err(|e| bad(e.to_string()))?;
        let decoder = ZstdDecoder::new(file).map_err(|e| bad(format!("invalid zstd stream: {e}")))?;
        let mut archive = Archive::new(decoder);

        let (mut meta, mut png, mut ann) = (None, None, None);
        for entry in archive.entries().map_err(|e| bad(e.to_string()))? {
            let mut entry = entry.map_err(|e| bad(e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| bad(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| bad(e.to_string()))?;
            match name.as_str() {
                META_ENTRY => meta = Some(buf),
                IMAGE_ENTRY => png = Some(buf),
                ANNOTATION_ENTRY => ann = Some(buf),
                _ => {}
            }
        }

        let meta: PatchMeta = serde_json::from_slice(
            &meta.ok_or_else(|| bad(format!("missing {META_ENTRY}")))?,
        )
        .map_err(|e| bad(format!("{META_ENTRY}: {e}")))?;
        let png = png.ok_or_else(|| bad(format!("missing {IMAGE_ENTRY}")))?;
        let ann = ann.ok_or_else(|| bad(format!("missing {ANNOTATION_ENTRY}")))?;

        let rgb = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .map_err(|e| bad(format!("{IMAGE_ENTRY}: {e}")))?
            .to_rgb8();
        if (rgb.height() as usize, rgb.width() as usize) != (meta.height, meta.width) {
            return Err(bad(format!(
                "{IMAGE_ENTRY} is {}x{}, meta says {}x{}",
                rgb.height(),
                rgb.width(),
                meta.height,
                meta.width
            )));
        }
        let image = Array3::from_shape_fn((meta.height, meta.width, 3), |(r, c, k)| {
            rgb.get_pixel(c as u32, r as u32)[k]
        });

        let values: Vec<i32> = ann
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let annotation = Array3::from_shape_vec(
            (meta.height, meta.width, meta.channel_code.len()),
            values,
        )
        .map_err(|e| bad(format!("{ANNOTATION_ENTRY}: {e}")))?;

        Ok(Self {
            meta,
            image,
            annotation,
        })
    }
}

/// Writes kept patches of one `split / window_step` directory.
#[derive(Debug, Clone)]
pub struct PatchWriter {
    out_dir: PathBuf,
}

impl PatchWriter {
    /// Create the output directory if needed. Safe to call concurrently for the same path.
    pub fn create(out_dir: impl Into<PathBuf>) -> PatchResult<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir).map_err(|source| PatchError::Write {
            path: out_dir.clone(),
            source,
        })?;
        Ok(Self { out_dir })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn record_path(&self, basename: &str, index: usize) -> PathBuf {
        self.out_dir.join(format!("{basename}-{index:04}.dat"))
    }

    /// Persist one patch and return where it was written.
    pub fn write(
        &self,
        basename: &str,
        patch: &Patch<'_>,
        channel_codes: &[String],
    ) -> PatchResult<PathBuf> {
        let path = self.record_path(basename, patch.index);
        let (height, width) = patch.size();
        let meta = PatchMeta {
            basename: basename.to_string(),
            index: patch.index,
            origin: [patch.origin.0, patch.origin.1],
            height,
            width,
            channel_code: channel_codes.to_vec(),
        };

        self.write_record(&path, &meta, patch)
            .map_err(|source| PatchError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    fn write_record(&self, path: &Path, meta: &PatchMeta, patch: &Patch<'_>) -> std::io::Result<()> {
        let meta_json = serde_json::to_vec_pretty(meta)?;
        let png = encode_png(patch)?;
        let ann: Vec<u8> = patch
            .annotation()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        // Written under a temporary name so an interrupted run never leaves a truncated record.
        let tmp = path.with_extension("dat.part");
        let out = BufWriter::new(File::create(&tmp)?);
        let encoder = ZstdEncoder::new(out, ZSTD_LEVEL)?;
        let mut tar = Builder::new(encoder);
        append_entry(&mut tar, META_ENTRY, &meta_json)?;
        append_entry(&mut tar, IMAGE_ENTRY, &png)?;
        append_entry(&mut tar, ANNOTATION_ENTRY, &ann)?;
        let encoder = tar.into_inner()?;
        encoder.finish()?.flush()?;
        fs::rename(&tmp, path)
    }
}

fn append_entry<W: Write>(tar: &mut Builder<W>, name: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    tar.append_data(&mut header, name, data)
}

fn encode_png(patch: &Patch<'_>) -> std::io::Result<Vec<u8>> {
    let image = patch.image();
    let (height, width) = patch.size();
    let rgb: RgbImage = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let px = |k: usize| image[[y as usize, x as usize, k]].clamp(0, 255) as u8;
        Rgb([px(0), px(1), px(2)])
    });
    let mut png = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(std::io::Error::other)?;
    Ok(png)
}
