//! Integration tests for the sliding-window tiling engine.
//!
//! Tests cover:
//! - Window geometry for exact fits, forced edge origins and undersized rasters
//! - Full coverage of the raster by patch footprints
//! - Emission order, restartability and mirror padding

mod common;

use histopatch::AxisOrigins;
use ndarray::Array3;

use common::*;

fn origins(raster: &Array3<i32>, extractor: &PatchExtractor) -> anyhow::Result<Vec<(usize, usize)>> {
    let mut out = Vec::new();
    for patch in extractor.patches(raster) {
        out.push(patch?.origin);
    }
    Ok(out)
}

#[test]
fn test_window_equal_to_raster_yields_single_patch() -> anyhow::Result<()> {
    let raster = Array3::<i32>::zeros((996, 996, 5));
    let extractor = PatchExtractor::new(996, 448);

    let patches: Vec<_> = extractor.patches(&raster).collect::<Result<_, _>>()?;
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].origin, (0, 0));
    assert_eq!(patches[0].data.dim(), (996, 996, 5));
    Ok(())
}

#[test]
fn test_forced_final_origin_covers_edge() -> anyhow::Result<()> {
    let axis = AxisOrigins::new(1200, 996, 448);
    assert_eq!(axis.regular, vec![0]);
    assert_eq!(axis.forced, Some(204));
    assert_eq!(axis.all(), vec![0, 204]);

    let raster = Array3::<i32>::zeros((1200, 1200, 5));
    let extractor = PatchExtractor::new(996, 448);
    assert_eq!(
        origins(&raster, &extractor)?,
        vec![(0, 0), (204, 0), (0, 204), (204, 204)]
    );
    for patch in extractor.patches(&raster) {
        assert_eq!(patch?.size(), (996, 996));
    }
    Ok(())
}

#[test]
fn test_exact_stride_multiple_has_no_forced_origin() {
    let axis = AxisOrigins::new(20, 8, 4);
    assert_eq!(axis.regular, vec![0, 4, 8, 12]);
    assert_eq!(axis.forced, None);
}

#[test]
fn test_raster_smaller_than_window_yields_nothing() -> anyhow::Result<()> {
    let extractor = PatchExtractor::new(8, 4);

    let short = Array3::<i32>::zeros((5, 20, 4));
    assert!(origins(&short, &extractor)?.is_empty());

    let narrow = Array3::<i32>::zeros((20, 7, 4));
    assert!(origins(&narrow, &extractor)?.is_empty());
    Ok(())
}

#[test]
fn test_patch_footprints_cover_whole_raster() -> anyhow::Result<()> {
    for &(height, width, win, step) in &[(37, 53, 16, 7), (16, 16, 16, 5), (30, 17, 9, 9), (25, 40, 10, 3)] {
        let raster = Array3::<i32>::zeros((height, width, 4));
        let extractor = PatchExtractor::new(win, step);
        let mut covered = vec![vec![false; width]; height];

        for patch in extractor.patches(&raster) {
            let patch = patch?;
            assert_eq!(patch.size(), (win, win));
            let (r0, c0) = patch.origin;
            for row in covered.iter_mut().skip(r0).take(win) {
                for cell in row.iter_mut().skip(c0).take(win) {
                    *cell = true;
                }
            }
        }

        assert!(
            covered.iter().flatten().all(|&c| c),
            "{height}x{width} with win {win} step {step} left pixels uncovered"
        );
    }
    Ok(())
}

#[test]
fn test_emission_order_assigns_sequential_indices() -> anyhow::Result<()> {
    let raster = Array3::<i32>::zeros((10, 14, 4));
    let extractor = PatchExtractor::new(6, 4);

    let patches: Vec<_> = extractor.patches(&raster).collect::<Result<_, _>>()?;
    let indices: Vec<usize> = patches.iter().map(|p| p.index).collect();
    assert_eq!(indices, (0..patches.len()).collect::<Vec<_>>());

    // rows: regular [0, 4], no forced; cols: regular [0, 4, 8], no forced
    let got: Vec<_> = patches.iter().map(|p| p.origin).collect();
    assert_eq!(got, vec![(0, 0), (0, 4), (0, 8), (4, 0), (4, 4), (4, 8)]);

    let raster = Array3::<i32>::zeros((11, 11, 4));
    let extractor = PatchExtractor::new(6, 4);
    // rows/cols: regular [0, 4], forced 5
    assert_eq!(
        origins(&raster, &extractor)?,
        vec![(0, 0), (0, 4), (4, 0), (4, 4), (5, 0), (5, 4), (0, 5), (4, 5), (5, 5)]
    );
    Ok(())
}

#[test]
fn test_extraction_is_restartable_and_non_mutating() -> anyhow::Result<()> {
    let raster = Array3::from_shape_fn((12, 12, 4), |(r, c, k)| (r * 100 + c * 10 + k) as i32);
    let before = raster.clone();
    let extractor = PatchExtractor::new(5, 3);

    let first = origins(&raster, &extractor)?;
    let second = origins(&raster, &extractor)?;
    assert_eq!(first, second);
    assert_eq!(raster, before);

    let patch = extractor.patches(&raster).nth(1).expect("second patch")?;
    let (r0, c0) = patch.origin;
    assert_eq!(patch.data[[0, 0, 2]], raster[[r0, c0, 2]]);
    Ok(())
}

#[test]
fn test_patch_channel_views() -> anyhow::Result<()> {
    let raster = Array3::from_shape_fn((4, 4, 6), |(_, _, k)| k as i32);
    let extractor = PatchExtractor::new(4, 4);
    let patch = extractor.patches(&raster).next().expect("one patch")?;

    assert_eq!(patch.image().dim(), (4, 4, 3));
    assert!(patch.mask().iter().all(|&v| v == 3));
    assert_eq!(patch.annotation().dim(), (4, 4, 2));
    assert_eq!(patch.annotation()[[0, 0, 1]], 5);
    Ok(())
}

#[test]
fn test_mirror_policy_reflects_edges() -> anyhow::Result<()> {
    let raster = Array3::from_shape_fn((10, 10, 4), |(r, c, _)| (r * 10 + c) as i32);
    let extractor = PatchExtractor::new(8, 4).with_policy(ExtractPolicy::Mirror);

    let padded = extractor.prepare(&raster);
    // win - step = 4, split 2 before and 2 after
    assert_eq!(padded.dim(), (14, 14, 4));
    assert_eq!(padded[[0, 2, 0]], raster[[2, 0, 0]]);
    assert_eq!(padded[[1, 2, 0]], raster[[1, 0, 0]]);
    assert_eq!(padded[[2, 2, 0]], raster[[0, 0, 0]]);
    assert_eq!(padded[[13, 13, 0]], raster[[7, 7, 0]]);

    for patch in extractor.patches(&padded) {
        assert_eq!(patch?.size(), (8, 8));
    }
    Ok(())
}

#[test]
fn test_valid_policy_borrows_raster() {
    let raster = Array3::<i32>::zeros((10, 10, 4));
    let extractor = PatchExtractor::new(8, 4);
    assert!(matches!(extractor.prepare(&raster), std::borrow::Cow::Borrowed(_)));
}

#[test]
fn test_policy_parsing() {
    assert_eq!("valid".parse::<ExtractPolicy>(), Ok(ExtractPolicy::Valid));
    assert_eq!("Mirror".parse::<ExtractPolicy>(), Ok(ExtractPolicy::Mirror));
    assert!("same".parse::<ExtractPolicy>().is_err());
}
