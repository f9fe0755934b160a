//! Masking of the high-resolution cube
//!
//! Stages run in a fixed order and each can be switched off:
//! out-of-swath removal, water/cloud mask, depth mask, smoothing, band
//! truncation, log transform and top-left crop. Masked pixels become NaN in
//! every band and no stage turns a NaN back into a number.

use crate::config::MaskingConfig;
use crate::core::cube::SpectralCube;
use crate::core::filters::{gaussian_filter, gaussian_filter_cube};
use crate::core::pipeline::RunContext;
use crate::io::bathymetry::{depth_range_mask, DepthRange};
use crate::types::{ensure_shape, FuseError, FuseResult, Raster};
use ndarray::{s, Array2, Axis, Zip};

/// Masking stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MaskStage {
    OutOfSwath,
    WaterAndCloud,
    Depth,
    Smooth,
    Truncate,
    Log,
    Crop,
}

/// Auxiliary rasters on the cube grid
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskInputs<'a> {
    /// Land/water categories of the low-resolution reference
    pub watermask: Option<&'a Array2<u8>>,
    /// Pixels where the low-resolution reference is invalid
    pub negative_pixels: Option<&'a Array2<bool>>,
    /// Positive depth in meters, NaN over land
    pub depth: Option<&'a Raster>,
}

/// What a masking run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskingOutcome {
    pub stages: Vec<MaskStage>,
    /// (rows, cols) window applied by the crop stage
    pub crop: Option<(usize, usize)>,
}

/// Null every band where band 0 is exactly zero; returns the pixel count
pub fn remove_out_of_swath(cube: &mut SpectralCube) -> usize {
    let data = cube.data_mut();
    let outside = data.index_axis(Axis(0), 0).mapv(|v| v == 0.0);
    null_pixels(data, &outside)
}

/// Null every band where `mask` is true; returns the number of pixels that were not yet null
pub fn null_where(cube: &mut SpectralCube, mask: &Array2<bool>) -> FuseResult<usize> {
    ensure_shape("mask", cube.shape(), mask.dim())?;
    Ok(null_pixels(cube.data_mut(), mask))
}

fn null_pixels(data: &mut crate::types::RasterCube, mask: &Array2<bool>) -> usize {
    let mut newly = 0;
    for ((row, col), &masked) in mask.indexed_iter() {
        if !masked {
            continue;
        }
        let mut pixel = data.slice_mut(s![.., row, col]);
        if pixel.iter().any(|v| !v.is_nan()) {
            newly += 1;
        }
        pixel.fill(f32::NAN);
    }
    newly
}

/// Pixels near ambiguous (coastal) categories: the smoothed categories exceed `threshold`
pub fn water_mask(watermask: &Array2<u8>, sigma: f32, threshold: f32) -> Array2<bool> {
    let categories = watermask.mapv(f32::from);
    gaussian_filter(&categories, sigma as f64).mapv(|v| v > threshold)
}

/// Bright (cloud) pixels in `cloud_band` or implausibly dark pixels in `reference_band`
pub fn cloud_mask(cube: &SpectralCube, config: &MaskingConfig) -> FuseResult<Array2<bool>> {
    let cloud = cube.band(config.cloud_band)?;
    let reference = cube.band(config.reference_band)?;
    let mut mask = Array2::from_elem(cube.shape(), false);
    Zip::from(&mut mask)
        .and(&cloud)
        .and(&reference)
        .for_each(|m, &c, &r| *m = c > config.cloud_max || r < config.reference_min);
    Ok(mask)
}

/// `log10(v + 1)` per value; values at or below -1 become NaN
pub fn log_transform(cube: &mut SpectralCube) {
    cube.data_mut()
        .mapv_inplace(|v| if v > -1.0 { (v + 1.0).log10() } else { f32::NAN });
}

/// Top-left window of a 2-D grid
pub fn crop_grid<T: Clone>(grid: &Array2<T>, rows: usize, cols: usize) -> Array2<T> {
    let (r, c) = grid.dim();
    grid.slice(s![..rows.min(r), ..cols.min(c)]).to_owned()
}

/// Runs the enabled masking stages
pub struct CubeMasker<'a> {
    config: &'a MaskingConfig,
}

impl<'a> CubeMasker<'a> {
    pub fn new(config: &'a MaskingConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, cube: &mut SpectralCube, inputs: MaskInputs<'_>, ctx: &RunContext) -> FuseResult<MaskingOutcome> {
        let config = self.config;
        let total = cube.shape().0 * cube.shape().1;
        let mut outcome = MaskingOutcome::default();

        if config.remove_out_of_swath {
            ctx.checkpoint("out-of-swath removal")?;
            let removed = remove_out_of_swath(cube);
            log::info!("Out-of-swath: {} of {} pixels removed", removed, total);
            outcome.stages.push(MaskStage::OutOfSwath);
        }

        if config.mask {
            ctx.checkpoint("water and cloud mask")?;
            let categories = inputs.watermask.ok_or_else(|| {
                FuseError::Config("Water and cloud masking needs a land/water mask".to_string())
            })?;
            ensure_shape("water mask", cube.shape(), categories.dim())?;
            let coastal = water_mask(categories, config.water_sigma, config.water_threshold);
            let removed = null_where(cube, &coastal)?;
            log::info!("Water mask: {} pixels removed", removed);
            let clouds = cloud_mask(cube, config)?;
            let removed = null_where(cube, &clouds)?;
            log::info!(
                "Cloud mask (band {} > {}, band {} < {}): {} pixels removed",
                config.cloud_band,
                config.cloud_max,
                config.reference_band,
                config.reference_min,
                removed
            );
            outcome.stages.push(MaskStage::WaterAndCloud);
        }

        if let Some(range) = &config.depth {
            ctx.checkpoint("depth mask")?;
            if self.apply_depth(cube, inputs.depth, range)? {
                outcome.stages.push(MaskStage::Depth);
            }
        }

        if config.smooth {
            ctx.checkpoint("smoothing")?;
            match inputs.negative_pixels {
                Some(negative) => {
                    null_where(cube, negative)?;
                    gaussian_filter_cube(cube.data_mut(), config.smooth_sigma as f64);
                    log::info!("Smoothed cube with sigma {}", config.smooth_sigma);
                    outcome.stages.push(MaskStage::Smooth);
                }
                None => log::warn!("Smoothing requested without a negative-pixel mask, skipping"),
            }
        }

        if let Some(keep) = config.keep_bands {
            if keep < cube.band_count() {
                log::debug!("Keeping {} of {} bands", keep, cube.band_count());
            }
            cube.truncate(keep);
            outcome.stages.push(MaskStage::Truncate);
        }

        if config.log_transform {
            ctx.checkpoint("log transform")?;
            log_transform(cube);
            outcome.stages.push(MaskStage::Log);
        }

        if let Some(size) = config.crop {
            cube.crop(size, size);
            let window = cube.shape();
            log::info!("Cropped cube to {:?}", window);
            outcome.crop = Some(window);
            outcome.stages.push(MaskStage::Crop);
        }

        Ok(outcome)
    }

    /// Returns whether the depth mask was applied
    fn apply_depth(&self, cube: &mut SpectralCube, depth: Option<&Raster>, range: &DepthRange) -> FuseResult<bool> {
        let depth = match depth {
            Some(depth) => depth,
            None => {
                log::warn!("Depth mask enabled but no bathymetry loaded, skipping");
                return Ok(false);
            }
        };
        ensure_shape("depth mask", cube.shape(), depth.dim())?;
        let outside = depth_range_mask(depth, range);
        let removed = null_where(cube, &outside)?;
        log::info!(
            "Depth mask ({:?}..{} m): {} pixels removed",
            range.min_depth,
            range.max_depth,
            removed
        );
        Ok(true)
    }
}
