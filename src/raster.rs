//! Multi-channel raster for one sample: `[3 image][1 mask][K annotation]`.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};

use crate::error::{PatchError, PatchResult};

pub const IMAGE_CHANNELS: usize = 3;
pub const MASK_CHANNEL: usize = 3;
pub const ANNOTATION_OFFSET: usize = 4;

/// Image, mask and composite annotation of one sample stacked along the channel axis.
#[derive(Debug, Clone)]
pub struct Raster {
    data: Array3<i32>,
}

impl Raster {
    /// Stack `image ⧺ mask ⧺ annotation`. All three must share height and width.
    pub fn compose(
        image: &Array3<u8>,
        mask: &Array2<u8>,
        annotation: &Array3<i32>,
    ) -> PatchResult<Self> {
        let (height, width, image_channels) = image.dim();
        if image_channels != IMAGE_CHANNELS {
            return Err(PatchError::ChannelCount {
                what: "image".to_string(),
                expected: IMAGE_CHANNELS,
                found: image_channels,
            });
        }
        if mask.dim() != (height, width) {
            return Err(PatchError::ShapeMismatch {
                what: "mask".to_string(),
                expected: (height, width),
                found: mask.dim(),
            });
        }
        let (ann_h, ann_w, ann_channels) = annotation.dim();
        if (ann_h, ann_w) != (height, width) {
            return Err(PatchError::ShapeMismatch {
                what: "composite annotation".to_string(),
                expected: (height, width),
                found: (ann_h, ann_w),
            });
        }

        let mut data = Array3::<i32>::zeros((height, width, ANNOTATION_OFFSET + ann_channels));
        data.slice_mut(s![.., .., ..IMAGE_CHANNELS])
            .assign(&image.mapv(i32::from));
        data.index_axis_mut(Axis(2), MASK_CHANNEL)
            .assign(&mask.mapv(i32::from));
        data.slice_mut(s![.., .., ANNOTATION_OFFSET..])
            .assign(annotation);
        Ok(Self { data })
    }

    pub fn height(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn width(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn annotation_channels(&self) -> usize {
        self.channels() - ANNOTATION_OFFSET
    }

    pub fn as_array(&self) -> &Array3<i32> {
        &self.data
    }

    pub fn image(&self) -> ArrayView3<'_, i32> {
        self.data.slice(s![.., .., ..IMAGE_CHANNELS])
    }

    pub fn mask(&self) -> ArrayView2<'_, i32> {
        self.data.index_axis(Axis(2), MASK_CHANNEL)
    }

    pub fn annotation(&self) -> ArrayView3<'_, i32> {
        self.data.slice(s![.., .., ANNOTATION_OFFSET..])
    }
}
