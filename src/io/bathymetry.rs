//! Bathymetry grids
//!
//! Elevation rasters store water depth as negative heights. The pipeline works
//! with positive depth in meters, land (height >= 0) becoming NaN.

use crate::core::domain::Domain;
use crate::io::raster::{BandId, RasterBackend, RasterHandle};
use crate::types::{FuseError, FuseResult, Raster, ResampleAlg};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Allowed depth range in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthRange {
    pub max_depth: f32,
    #[serde(default)]
    pub min_depth: Option<f32>,
}

impl DepthRange {
    pub fn new(max_depth: f32, min_depth: Option<f32>) -> FuseResult<Self> {
        if !(max_depth > 0.0) || min_depth.map_or(false, |min| !(min >= 0.0 && min < max_depth)) {
            return Err(FuseError::Config(format!(
                "Invalid depth range: min {:?}, max {}",
                min_depth, max_depth
            )));
        }
        Ok(Self { max_depth, min_depth })
    }

    /// True where a depth lies outside the range; NaN depths are outside
    pub fn excludes(&self, depth: f32) -> bool {
        if !depth.is_finite() {
            return true;
        }
        depth > self.max_depth || self.min_depth.map_or(false, |min| depth < min)
    }
}

/// Convert heights to positive depth, land becoming NaN
pub fn depth_from_elevation(elevation: &Raster) -> Raster {
    elevation.mapv(|h| if h.is_nan() || h >= 0.0 { f32::NAN } else { -h })
}

/// True over land (no valid depth)
pub fn land_mask(depth: &Raster) -> Array2<bool> {
    depth.mapv(|d| !d.is_finite())
}

/// True where the depth is outside `range`
pub fn depth_range_mask(depth: &Raster, range: &DepthRange) -> Array2<bool> {
    depth.mapv(|d| range.excludes(d))
}

/// Depth with every excluded pixel set to NaN
pub fn apply_depth_range(depth: &Raster, range: &DepthRange) -> Raster {
    let mut limited = depth.clone();
    Zip::from(&mut limited).for_each(|d| {
        if range.excludes(*d) {
            *d = f32::NAN;
        }
    });
    limited
}

/// Load a bathymetry raster, reproject it onto `domain` and convert to depth
pub fn load_depth<B: RasterBackend>(backend: &B, path: &Path, domain: &Domain) -> FuseResult<Raster> {
    log::info!("Loading bathymetry from {}", path.display());
    let mut handle = backend.open(path)?;
    handle.reproject(domain, ResampleAlg::NearestNeighbour)?;
    let elevation = handle.band_array(&BandId::Number(1))?;

    let depth = depth_from_elevation(&elevation);
    let water = depth.iter().filter(|d| d.is_finite()).count();
    log::info!(
        "Bathymetry: {:.1}% of the domain is water",
        100.0 * water as f64 / depth.len().max(1) as f64
    );
    Ok(depth)
}
