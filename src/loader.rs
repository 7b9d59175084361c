//! Image and tissue-mask loading.

use log::debug;
use ndarray::{Array2, Array3};
use std::path::Path;

use crate::config::DatasetDescriptor;
use crate::error::{PatchError, PatchResult};

/// Load an image as `[H, W, 3]` RGB, whatever its on-disk color type.
pub fn load_image(path: &Path) -> PatchResult<Array3<u8>> {
    let img = image::open(path)
        .map_err(|source| PatchError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok(Array3::from_shape_fn(
        (height as usize, width as usize, 3),
        |(r, c, k)| img.get_pixel(c as u32, r as u32)[k],
    ))
}

/// Load the binary tissue mask for `basename` (nonzero = foreground).
///
/// Datasets without a mask directory, and samples whose mask file is missing, get an
/// all-foreground mask of `shape`.
pub fn load_mask(
    descriptor: &DatasetDescriptor,
    basename: &str,
    shape: (usize, usize),
) -> PatchResult<Array2<u8>> {
    let Some(path) = descriptor.mask_path(basename).filter(|p| p.is_file()) else {
        debug!("`{basename}` has no mask, using full foreground");
        return Ok(Array2::ones(shape));
    };

    let gray = image::open(&path)
        .map_err(|source| PatchError::Image {
            path: path.clone(),
            source,
        })?
        .to_luma8();
    let found = (gray.height() as usize, gray.width() as usize);
    if found != shape {
        return Err(PatchError::ShapeMismatch {
            what: format!("mask {}", path.display()),
            expected: shape,
            found,
        });
    }
    Ok(Array2::from_shape_fn(shape, |(r, c)| {
        u8::from(gray.get_pixel(c as u32, r as u32)[0] > 0)
    }))
}
