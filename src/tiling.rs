//! Deterministic sliding-window extraction over a variable-size raster.
//!
//! Patches are emitted in a fixed order that defines their per-file index:
//! the regular grid row-major, then the forced bottom row, then the forced right
//! column, then the forced bottom-right corner.

use ndarray::{Array3, ArrayView2, ArrayView3, Axis, s};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::{PatchError, PatchResult};
use crate::raster::{ANNOTATION_OFFSET, IMAGE_CHANNELS, MASK_CHANNEL};

/// How window origins are placed over the raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractPolicy {
    /// Windows stay inside the raster; a final origin at `size - win` covers the edge.
    #[default]
    Valid,
    /// Reflect-pad by `win - step` first, then place windows as in `Valid`.
    Mirror,
}

impl fmt::Display for ExtractPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractPolicy::Valid => f.write_str("valid"),
            ExtractPolicy::Mirror => f.write_str("mirror"),
        }
    }
}

impl FromStr for ExtractPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "valid" => Ok(ExtractPolicy::Valid),
            "mirror" => Ok(ExtractPolicy::Mirror),
            other => Err(format!("unknown extraction policy `{other}` (expected valid or mirror)")),
        }
    }
}

/// Window origins along one axis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AxisOrigins {
    /// `0, step, 2*step, ...` while the window still fits.
    pub regular: Vec<usize>,
    /// `length - win` when the regular stride does not land there exactly.
    pub forced: Option<usize>,
}

impl AxisOrigins {
    pub fn new(length: usize, win: usize, step: usize) -> Self {
        if win == 0 || step == 0 || length < win {
            return Self::default();
        }
        let span = length - win;
        let regular = (0..=span / step).map(|i| i * step).collect();
        let forced = (span % step != 0).then_some(span);
        Self { regular, forced }
    }

    /// All origins in ascending order.
    pub fn all(&self) -> Vec<usize> {
        self.regular.iter().copied().chain(self.forced).collect()
    }
}

/// One `win × win × C` window of a raster.
#[derive(Debug, Clone)]
pub struct Patch<'a> {
    pub index: usize,
    pub origin: (usize, usize),
    pub data: ArrayView3<'a, i32>,
}

impl<'a> Patch<'a> {
    pub fn image(&self) -> ArrayView3<'a, i32> {
        self.data.slice_move(s![.., .., ..IMAGE_CHANNELS])
    }

    pub fn mask(&self) -> ArrayView2<'a, i32> {
        self.data.index_axis_move(Axis(2), MASK_CHANNEL)
    }

    pub fn annotation(&self) -> ArrayView3<'a, i32> {
        self.data.slice_move(s![.., .., ANNOTATION_OFFSET..])
    }

    pub fn size(&self) -> (usize, usize) {
        (self.data.len_of(Axis(0)), self.data.len_of(Axis(1)))
    }
}

/// Stateless sliding-window extractor.
#[derive(Debug, Clone, Copy)]
pub struct PatchExtractor {
    win: usize,
    step: usize,
    policy: ExtractPolicy,
}

impl PatchExtractor {
    pub fn new(win: usize, step: usize) -> Self {
        Self {
            win,
            step,
            policy: ExtractPolicy::Valid,
        }
    }

    pub fn with_policy(mut self, policy: ExtractPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Window origins `(row, col)` for a `height × width` raster, in emission order.
    pub fn grid(&self, height: usize, width: usize) -> Vec<(usize, usize)> {
        let rows = AxisOrigins::new(height, self.win, self.step);
        let cols = AxisOrigins::new(width, self.win, self.step);
        if rows.regular.is_empty() || cols.regular.is_empty() {
            return Vec::new();
        }

        let mut origins = Vec::new();
        for &r in &rows.regular {
            for &c in &cols.regular {
                origins.push((r, c));
            }
        }
        if let Some(r) = rows.forced {
            origins.extend(cols.regular.iter().map(|&c| (r, c)));
        }
        if let Some(c) = cols.forced {
            origins.extend(rows.regular.iter().map(|&r| (r, c)));
        }
        if let (Some(r), Some(c)) = (rows.forced, cols.forced) {
            origins.push((r, c));
        }
        origins
    }

    /// Apply the policy's padding. `Valid` borrows the raster untouched.
    pub fn prepare<'a>(&self, raster: &'a Array3<i32>) -> Cow<'a, Array3<i32>> {
        match self.policy {
            ExtractPolicy::Valid => Cow::Borrowed(raster),
            ExtractPolicy::Mirror if self.win > self.step => {
                let diff = self.win - self.step;
                let before = diff / 2;
                Cow::Owned(reflect_pad(raster, before, diff - before))
            }
            ExtractPolicy::Mirror => Cow::Borrowed(raster),
        }
    }

    /// Windows over an already prepared raster.
    ///
    /// A raster smaller than the window on either axis yields nothing. Every emitted
    /// patch is checked to be exactly `win × win`.
    pub fn patches<'a>(
        &self,
        raster: &'a Array3<i32>,
    ) -> impl Iterator<Item = PatchResult<Patch<'a>>> + 'a {
        let (height, width, _) = raster.dim();
        let win = self.win;
        self.grid(height, width)
            .into_iter()
            .enumerate()
            .map(move |(index, (r, c))| {
                let data = raster.slice(s![r..(r + win).min(height), c..(c + win).min(width), ..]);
                let patch = Patch {
                    index,
                    origin: (r, c),
                    data,
                };
                if patch.size() != (win, win) {
                    return Err(PatchError::PatchShape {
                        index,
                        origin: (r, c),
                        found: patch.size(),
                        win,
                    });
                }
                Ok(patch)
            })
    }
}

/// Index into `0..len` reflecting about the edges without repeating them (`dcb|abcd|cba`).
fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = i.rem_euclid(period);
    if m >= len as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

/// Reflect-pad both spatial axes by `before` / `after` pixels.
pub fn reflect_pad(raster: &Array3<i32>, before: usize, after: usize) -> Array3<i32> {
    let (height, width, channels) = raster.dim();
    if height == 0 || width == 0 {
        return raster.clone();
    }
    let shape = (height + before + after, width + before + after, channels);
    Array3::from_shape_fn(shape, |(r, c, k)| {
        let src_r = reflect_index(r as isize - before as isize, height);
        let src_c = reflect_index(c as isize - before as isize, width);
        raster[[src_r, src_c, k]]
    })
}
